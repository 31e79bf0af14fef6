use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "public/models/yolov8n-seg-pothole.pt";
pub const DEFAULT_OUTPUT: &str = "public/models/yolov8n-seg-pothole.onnx";

/// Resolves the effective model and output paths. Positionals override the
/// defaults under `project_root` one at a time, so a lone model path still
/// writes to the default output location.
pub fn resolve(
    project_root: &Path,
    model_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
) -> (PathBuf, PathBuf) {
    (
        model_path.unwrap_or_else(|| project_root.join(DEFAULT_MODEL)),
        output_path.unwrap_or_else(|| project_root.join(DEFAULT_OUTPUT)),
    )
}
