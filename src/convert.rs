use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Serialize, Serializer};

use crate::checker::{self, CheckError, ModelSummary};
use crate::library::{ExportConfig, ModelInfo, ModelLibrary};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to load YOLO model: {0:#}")]
    LoadFailure(anyhow::Error),
    #[error("Failed to export model to ONNX: {0:#}")]
    ExportFailure(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub model_path: PathBuf,
    /// Where the ONNX file should end up; `None` keeps the library's choice.
    pub output_path: Option<PathBuf>,
    pub config: ExportConfig,
    pub verify: bool,
}

impl ConversionRequest {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            output_path: None,
            config: ExportConfig::default(),
            verify: true,
        }
    }

    pub fn with_output(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(output_path.into());
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Verification {
    Passed(ModelSummary),
    Failed(#[serde(serialize_with = "serialize_display")] CheckError),
    Skipped,
}

fn serialize_display<S: Serializer>(err: &CheckError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}

#[derive(Debug, Serialize)]
pub struct ConversionReport {
    pub artifact: PathBuf,
    pub model: ModelInfo,
    pub config: ExportConfig,
    pub verification: Verification,
}

/// Loads the checkpoint named by `request`, exports it to ONNX, moves the
/// result to the requested output path and verifies it.
///
/// Only loading and exporting can fail; verification problems are reported
/// in [`ConversionReport::verification`].
pub fn convert<L: ModelLibrary>(
    library: &L,
    request: &ConversionRequest,
) -> Result<ConversionReport, ConversionError> {
    let model_path = &request.model_path;
    log::info!("Loading YOLO model from: {}", model_path.display());
    if !model_path.exists() {
        return Err(ConversionError::NotFound(model_path.clone()));
    }

    let (model, info) = library
        .load(model_path)
        .and_then(|model| {
            let info = library.describe(&model)?;
            Ok((model, info))
        })
        .map_err(ConversionError::LoadFailure)?;
    log::info!("Model loaded successfully");
    log::info!("  Type: {}", info.kind);
    if !info.class_names.is_empty() {
        log::info!("  Classes: {} classes", info.class_names.len());
        log::info!("  Class names: {}", info.class_preview());
    }

    log::info!("Exporting to ONNX format ({})", request.config);
    let previous = match request.output_path.as_deref().map(PreviousOutput::set_aside).transpose() {
        Ok(previous) => previous.flatten(),
        Err(err) => return Err(ConversionError::ExportFailure(err)),
    };
    let exported = library
        .export(&model, &request.config)
        .and_then(|exported| {
            if !exported.is_file() {
                anyhow::bail!("exporter reported {} but no file was written", exported.display());
            }
            match &request.output_path {
                Some(output) if !same_path(&exported, output) => {
                    relocate(&exported, output)?;
                    Ok(output.clone())
                }
                _ => Ok(exported),
            }
        });
    let artifact = match exported {
        Ok(artifact) => artifact,
        Err(err) => {
            if let Some(output) = &request.output_path {
                discard_partial(output);
            }
            if let Some(previous) = previous {
                previous.restore();
            }
            return Err(ConversionError::ExportFailure(err));
        }
    };
    if let Some(previous) = previous {
        previous.discard();
    }
    log::info!("Successfully exported model to: {}", artifact.display());

    let verification = if request.verify {
        verify(&artifact)
    } else {
        log::info!("Skipping ONNX verification");
        Verification::Skipped
    };

    let mut info = info;
    if info.class_names.is_empty()
        && let Verification::Passed(summary) = &verification
        && !summary.class_names.is_empty()
    {
        info.class_names = summary.class_names.clone();
        log::info!("  Classes: {} classes", info.class_names.len());
        log::info!("  Class names: {}", info.class_preview());
    }

    Ok(ConversionReport {
        artifact,
        model: info,
        config: request.config,
        verification,
    })
}

fn verify(artifact: &Path) -> Verification {
    match checker::verify_file(artifact) {
        Ok(summary) => {
            log::info!("ONNX model verification passed");
            log::info!("  IR version: {}, opset: {}", summary.ir_version, summary.opset.map_or("?".to_string(), |x| x.to_string()));
            for input in &summary.inputs {
                log::info!("  Input  {input}");
            }
            for output in &summary.outputs {
                log::info!("  Output {output}");
            }
            Verification::Passed(summary)
        }
        Err(err) => {
            log::warn!("ONNX verification failed: {err}");
            Verification::Failed(err)
        }
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Moves `from` to `to`, replacing any existing file and creating missing
/// parent directories.
fn relocate(from: &Path, to: &Path) -> anyhow::Result<()> {
    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    log::debug!("Moving {} to {}", from.display(), to.display());
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            if let Err(err) = fs::copy(from, to) {
                discard_partial(to);
                return Err(err).with_context(|| format!("unable to copy {} to {}", from.display(), to.display()));
            }
            fs::remove_file(from).with_context(|| format!("unable to remove {}", from.display()))
        }
        Err(err) => Err(err).with_context(|| format!("unable to move {} to {}", from.display(), to.display())),
    }
}

/// A file an earlier run left at the requested output path, moved to a
/// hidden sibling while the exporter runs.
struct PreviousOutput {
    output: PathBuf,
    backup: PathBuf,
}

impl PreviousOutput {
    fn set_aside(output: &Path) -> anyhow::Result<Option<Self>> {
        if !output.is_file() {
            return Ok(None);
        }
        let Some(name) = output.file_name() else {
            return Ok(None);
        };
        let mut backup_name = OsString::from(".");
        backup_name.push(name);
        backup_name.push(".previous");
        let backup = output.with_file_name(backup_name);
        fs::rename(output, &backup)
            .with_context(|| format!("unable to move existing {} aside", output.display()))?;
        log::debug!("Moved existing {} to {}", output.display(), backup.display());
        Ok(Some(Self {
            output: output.to_path_buf(),
            backup,
        }))
    }

    fn restore(self) {
        if let Err(err) = fs::rename(&self.backup, &self.output) {
            log::warn!(
                "Unable to restore previous output {} from {}: {err}",
                self.output.display(),
                self.backup.display()
            );
        }
    }

    fn discard(self) {
        if let Err(err) = fs::remove_file(&self.backup) {
            log::warn!("Unable to remove {}: {err}", self.backup.display());
        }
    }
}

fn discard_partial(path: &Path) {
    if path.is_file() {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed partial output {}", path.display()),
            Err(err) => log::warn!("Unable to remove partial output {}: {err}", path.display()),
        }
    }
}
