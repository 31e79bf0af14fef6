pub mod checker;
pub mod convert;
pub mod library;
pub mod onnx;
pub mod paths;
#[cfg(feature = "python")]
pub mod ultralytics;
pub mod yolo_cli;

pub use checker::{CheckError, ModelSummary};
pub use convert::{ConversionError, ConversionReport, ConversionRequest, Verification, convert};
pub use library::{ExportConfig, ModelInfo, ModelLibrary};
