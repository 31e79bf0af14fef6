use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Fixed parameters handed to the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportConfig {
    pub imgsz: u32,
    pub simplify: bool,
    pub opset: u32,
    /// Embed non-maximum suppression in the exported graph.
    pub nms: bool,
    /// Export with dynamic batch/input sizes.
    pub dynamic: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            imgsz: 640,
            simplify: true,
            opset: 17,
            nms: true,
            dynamic: false,
        }
    }
}

impl fmt::Display for ExportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "imgsz={} opset={} simplify={} nms={} dynamic={}",
            self.imgsz, self.opset, self.simplify, self.nms, self.dynamic
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Class name of the underlying network, e.g. `SegmentationModel`.
    pub kind: String,
    pub class_names: Vec<String>,
}

impl ModelInfo {
    /// Class names for display, truncated after the first five.
    pub fn class_preview(&self) -> String {
        const PREVIEW: usize = 5;
        if self.class_names.len() > PREVIEW {
            format!("{:?}...", &self.class_names[..PREVIEW])
        } else {
            format!("{:?}", self.class_names)
        }
    }
}

/// A model library able to load a checkpoint and export it to ONNX.
pub trait ModelLibrary {
    type Model;

    fn load(&self, path: &Path) -> anyhow::Result<Self::Model>;

    fn describe(&self, model: &Self::Model) -> anyhow::Result<ModelInfo>;

    /// Exports `model` and returns the path the library wrote the ONNX file to.
    fn export(&self, model: &Self::Model, config: &ExportConfig) -> anyhow::Result<PathBuf>;
}
