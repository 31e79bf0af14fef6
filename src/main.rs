use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use env_logger::{Env, Target};

use yolo_onnx_convert::yolo_cli::YoloCli;
use yolo_onnx_convert::{ConversionReport, ConversionRequest, ExportConfig, ModelLibrary, convert, paths};

const RULE: &str = "============================================================";

/// Convert a YOLO detection/segmentation checkpoint to ONNX.
#[derive(Parser, Debug)]
#[command(name = "convert", version)]
struct Args {
    /// Checkpoint to convert [default: <project root>/public/models/yolov8n-seg-pothole.pt]
    model_path: Option<PathBuf>,
    /// Where to place the ONNX file [default: <project root>/public/models/yolov8n-seg-pothole.onnx]
    output_path: Option<PathBuf>,
    /// Directory the default paths are resolved against [default: current directory]
    #[arg(long, env = "YOLO_ONNX_PROJECT_ROOT")]
    project_root: Option<PathBuf>,
    #[arg(long, default_value_t = ExportConfig::default().imgsz)]
    imgsz: u32,
    #[arg(long, default_value_t = ExportConfig::default().opset)]
    opset: u32,
    /// Skip the exporter's graph simplification pass
    #[arg(long)]
    no_simplify: bool,
    /// Leave non-maximum suppression out of the graph
    #[arg(long)]
    no_nms: bool,
    /// Export with dynamic batch and input sizes
    #[arg(long)]
    dynamic: bool,
    /// Do not check the exported graph
    #[arg(long)]
    skip_verify: bool,
    #[arg(long, value_enum, default_value_t)]
    backend: Backend,
    /// `yolo` program used by the cli backend
    #[arg(long, default_value = "yolo")]
    yolo_bin: PathBuf,
    /// Print the conversion report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// Ultralytics through the embedded Python interpreter
    #[cfg(feature = "python")]
    Python,
    /// The `yolo` command-line program
    Cli,
}

impl Default for Backend {
    #[cfg(feature = "python")]
    fn default() -> Self {
        Backend::Python
    }

    #[cfg(not(feature = "python"))]
    fn default() -> Self {
        Backend::Cli
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(if args.json { Target::Stderr } else { Target::Stdout })
        .format_timestamp(None)
        .format_target(false)
        .init();

    let project_root = args
        .project_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let (model_path, output_path) =
        paths::resolve(&project_root, args.model_path.clone(), args.output_path.clone());

    let request = ConversionRequest {
        model_path,
        output_path: Some(output_path),
        config: ExportConfig {
            imgsz: args.imgsz,
            simplify: !args.no_simplify,
            opset: args.opset,
            nms: !args.no_nms,
            dynamic: args.dynamic,
        },
        verify: !args.skip_verify,
    };

    if !args.json {
        println!("{RULE}");
        println!("YOLO to ONNX Converter");
        println!("{RULE}");
    }

    let result = match args.backend {
        #[cfg(feature = "python")]
        Backend::Python => yolo_onnx_convert::ultralytics::UltralyticsLibrary::new()
            .and_then(|library| run(&library, &request)),
        Backend::Cli => {
            let library = YoloCli::new(&args.yolo_bin);
            library.probe().and_then(|()| run(&library, &request))
        }
    };

    match result {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(err) => {
                        println!("✗ Error: unable to serialize report: {err}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!();
                println!("{RULE}");
                println!("Conversion completed successfully!");
                println!("ONNX model saved to: {}", report.artifact.display());
                println!("{RULE}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "\n✗ Error: {err:#}");
            let _ = writeln!(stdout, "\nTroubleshooting tips:");
            let _ = writeln!(stdout, "1. Ensure ultralytics is installed: pip install ultralytics");
            let _ = writeln!(stdout, "2. Check that the model file is a valid YOLO checkpoint (.pt file)");
            let _ = writeln!(stdout, "3. Verify the model path is correct");
            let _ = writeln!(stdout, "4. For segmentation models, ensure you're using a YOLO segmentation model");
            ExitCode::FAILURE
        }
    }
}

fn run<L: ModelLibrary>(library: &L, request: &ConversionRequest) -> anyhow::Result<ConversionReport> {
    Ok(convert(library, request)?)
}
