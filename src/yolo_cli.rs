use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, bail};

use crate::library::{ExportConfig, ModelInfo, ModelLibrary};

/// PyTorch checkpoints are zip archives.
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Lines of exporter stderr kept in error messages.
const STDERR_TAIL: usize = 20;

/// The Ultralytics `yolo` command-line program, run as a subprocess.
pub struct YoloCli {
    program: PathBuf,
}

pub struct CheckpointFile {
    path: PathBuf,
}

impl YoloCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Confirms the program can be started.
    pub fn probe(&self) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .arg("version")
            .output()
            .with_context(|| format!("unable to run {}, install ultralytics with: pip install ultralytics", self.program.display()))?;
        if !output.status.success() {
            bail!("{} version exited with {}", self.program.display(), output.status);
        }
        log::debug!(
            "Using {} (ultralytics {})",
            self.program.display(),
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    fn export_args(model: &Path, config: &ExportConfig) -> Vec<OsString> {
        let mut model_arg = OsString::from("model=");
        model_arg.push(model.as_os_str());
        vec![
            OsString::from("export"),
            model_arg,
            OsString::from("format=onnx"),
            OsString::from(format!("imgsz={}", config.imgsz)),
            OsString::from(format!("simplify={}", python_bool(config.simplify))),
            OsString::from(format!("opset={}", config.opset)),
            OsString::from(format!("nms={}", python_bool(config.nms))),
            OsString::from(format!("dynamic={}", python_bool(config.dynamic))),
        ]
    }
}

fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

impl ModelLibrary for YoloCli {
    type Model = CheckpointFile;

    fn load(&self, path: &Path) -> anyhow::Result<Self::Model> {
        let mut magic = [0u8; 4];
        File::open(path)
            .and_then(|mut file| file.read_exact(&mut magic))
            .with_context(|| format!("unable to read {}", path.display()))?;
        if magic != ZIP_MAGIC {
            bail!("{} is not a PyTorch checkpoint archive", path.display());
        }
        Ok(CheckpointFile {
            path: path.to_path_buf(),
        })
    }

    fn describe(&self, _model: &Self::Model) -> anyhow::Result<ModelInfo> {
        // Class names live inside the pickled checkpoint; they are picked up
        // from the exported graph's `names` metadata instead.
        Ok(ModelInfo {
            kind: "YOLO".to_string(),
            class_names: vec![],
        })
    }

    fn export(&self, model: &Self::Model, config: &ExportConfig) -> anyhow::Result<PathBuf> {
        let args = Self::export_args(&model.path, config);
        log::debug!("Running {} {:?}", self.program.display(), args);
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("unable to run {}", self.program.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n");
            bail!("{} export exited with {}:\n{}", self.program.display(), output.status, tail);
        }
        Ok(model.path.with_extension("onnx"))
    }
}
