use std::path::{Path, PathBuf};

use anyhow::Context;
use pyo3::prelude::PyAnyMethods;
use pyo3::types::{PyDict, PyDictMethods};
use pyo3::{Bound, IntoPyObject, Py, PyAny, PyErr, PyResult, Python};

use crate::library::{ExportConfig, ModelInfo, ModelLibrary};

/// The Ultralytics YOLO library, driven in-process through an embedded
/// Python interpreter.
pub struct UltralyticsLibrary {
    yolo: Py<PyAny>,
}

pub struct UltralyticsModel {
    model: Py<PyAny>,
}

impl UltralyticsLibrary {
    pub fn new() -> anyhow::Result<Self> {
        let yolo = Python::with_gil(|py| {
            let ultralytics = py.import("ultralytics")?;
            Ok::<_, PyErr>(ultralytics.getattr("YOLO")?.unbind())
        })
        .context("ultralytics package not found, install it with: pip install ultralytics")?;
        Ok(Self { yolo })
    }
}

/// Hands `path` to Python as an OS string, so non-UTF-8 names survive.
fn path_object<'py>(py: Python<'py>, path: &Path) -> PyResult<Bound<'py, PyAny>> {
    Ok(path.into_pyobject(py)?.into_any())
}

impl ModelLibrary for UltralyticsLibrary {
    type Model = UltralyticsModel;

    fn load(&self, path: &Path) -> anyhow::Result<Self::Model> {
        let model = Python::with_gil(|py| {
            let model = self.yolo.bind(py).call1((path_object(py, path)?,))?;
            Ok::<_, PyErr>(model.unbind())
        })?;
        Ok(UltralyticsModel { model })
    }

    fn describe(&self, model: &Self::Model) -> anyhow::Result<ModelInfo> {
        let info = Python::with_gil(|py| {
            let model = model.model.bind(py);
            let kind = if model.hasattr("model")? {
                model.getattr("model")?.get_type().getattr("__name__")?.extract()?
            } else {
                "YOLO".to_string()
            };
            let mut class_names = Vec::new();
            if model.hasattr("names")? {
                for name in model.getattr("names")?.call_method0("values")?.try_iter()? {
                    class_names.push(name?.extract::<String>()?);
                }
            }
            Ok::<_, PyErr>(ModelInfo { kind, class_names })
        })?;
        Ok(info)
    }

    fn export(&self, model: &Self::Model, config: &ExportConfig) -> anyhow::Result<PathBuf> {
        let exported = Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("format", "onnx")?;
            kwargs.set_item("imgsz", config.imgsz)?;
            kwargs.set_item("simplify", config.simplify)?;
            kwargs.set_item("opset", config.opset)?;
            kwargs.set_item("nms", config.nms)?;
            kwargs.set_item("dynamic", config.dynamic)?;
            let exported = model.model.bind(py).call_method("export", (), Some(&kwargs))?;
            exported.str()?.extract::<String>()
        })?;
        Ok(PathBuf::from(exported))
    }
}
