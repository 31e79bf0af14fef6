#![allow(dead_code)]

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::bail;
use prost::Message;
use yolo_onnx_convert::onnx::tensor_proto::DataType;
use yolo_onnx_convert::onnx::tensor_shape_proto::{Dimension, dimension};
use yolo_onnx_convert::onnx::{
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto, TensorShapeProto, TypeProto,
    ValueInfoProto, type_proto,
};
use yolo_onnx_convert::{ExportConfig, ModelInfo, ModelLibrary};

/// What the fake library's export call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportBehaviour {
    /// Writes a well-formed detection graph beside the checkpoint.
    ValidGraph,
    /// Writes bytes that do not decode as ONNX.
    InvalidGraph,
    /// Fails without writing anything.
    Fail,
    /// Writes a truncated file beside the checkpoint, then fails.
    FailAfterPartialWrite,
}

pub struct FakeLibrary {
    pub behaviour: ExportBehaviour,
    pub class_names: Vec<String>,
    pub exports: Cell<usize>,
}

pub struct FakeModel {
    path: PathBuf,
}

impl FakeLibrary {
    pub fn new(behaviour: ExportBehaviour) -> Self {
        Self {
            behaviour,
            class_names: vec!["pothole".to_string()],
            exports: Cell::new(0),
        }
    }

    /// Describes models without class names, like the `yolo` program backend.
    pub fn without_class_names(mut self) -> Self {
        self.class_names.clear();
        self
    }
}

impl ModelLibrary for FakeLibrary {
    type Model = FakeModel;

    fn load(&self, path: &Path) -> anyhow::Result<Self::Model> {
        let bytes = fs::read(path)?;
        if !bytes.starts_with(b"PK") {
            bail!("invalid load key, '{}'", bytes.first().copied().unwrap_or_default() as char);
        }
        Ok(FakeModel {
            path: path.to_path_buf(),
        })
    }

    fn describe(&self, _model: &Self::Model) -> anyhow::Result<ModelInfo> {
        Ok(ModelInfo {
            kind: "SegmentationModel".to_string(),
            class_names: self.class_names.clone(),
        })
    }

    fn export(&self, model: &Self::Model, config: &ExportConfig) -> anyhow::Result<PathBuf> {
        self.exports.set(self.exports.get() + 1);
        let exported = model.path.with_extension("onnx");
        match self.behaviour {
            ExportBehaviour::ValidGraph => {
                fs::write(&exported, detection_model(config).encode_to_vec())?;
                Ok(exported)
            }
            ExportBehaviour::InvalidGraph => {
                fs::write(&exported, b"\xff\xff\xff not protobuf")?;
                Ok(exported)
            }
            ExportBehaviour::Fail => bail!("ONNX: export failure"),
            ExportBehaviour::FailAfterPartialWrite => {
                let bytes = detection_model(config).encode_to_vec();
                fs::write(&exported, &bytes[..bytes.len() / 2])?;
                bail!("ONNX: simplifier crashed")
            }
        }
    }
}

/// Writes a file that passes the fake library's checkpoint check.
pub fn write_checkpoint(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"PK\x03\x04fake checkpoint").unwrap();
}

pub fn tensor_value(name: &str, elem_type: DataType, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|x| Dimension {
            value: Some(match x {
                Dim::Fixed(v) => dimension::Value::DimValue(*v),
                Dim::Param(p) => dimension::Value::DimParam(p.to_string()),
            }),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub enum Dim {
    Fixed(i64),
    Param(&'static str),
}

pub fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|x| x.to_string()).collect(),
        output: outputs.iter().map(|x| x.to_string()).collect(),
        name: format!("/model/{}", outputs.first().copied().unwrap_or(op_type)),
        op_type: op_type.to_string(),
        ..Default::default()
    }
}

/// A small graph shaped like an exported YOLO segmentation head.
pub fn detection_model(config: &ExportConfig) -> ModelProto {
    let batch = if config.dynamic { Dim::Param("batch") } else { Dim::Fixed(1) };
    let size = config.imgsz as i64;
    let graph = GraphProto {
        name: "main_graph".to_string(),
        input: vec![tensor_value("images", DataType::Float, &[batch, Dim::Fixed(3), Dim::Fixed(size), Dim::Fixed(size)])],
        node: vec![
            node("Conv", &["images"], &["features"]),
            node("Sigmoid", &["features"], &["output0"]),
            node("Identity", &["features"], &["output1"]),
        ],
        output: vec![
            tensor_value("output0", DataType::Float, &[Dim::Fixed(1), Dim::Fixed(300), Dim::Fixed(38)]),
            tensor_value("output1", DataType::Float, &[Dim::Fixed(1), Dim::Fixed(32), Dim::Fixed(160), Dim::Fixed(160)]),
        ],
        ..Default::default()
    };
    ModelProto {
        ir_version: 8,
        producer_name: "pytorch".to_string(),
        producer_version: "2.3.0".to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: config.opset as i64,
        }],
        graph: Some(graph),
        metadata_props: vec![
            StringStringEntryProto {
                key: "task".to_string(),
                value: "segment".to_string(),
            },
            StringStringEntryProto {
                key: "names".to_string(),
                value: "{0: 'pothole', 1: \"driver's side crack\"}".to_string(),
            },
        ],
        ..Default::default()
    }
}
