//! Structural validation of exported ONNX files.
//!
//! The checks mirror the core of `onnx.checker.check_model`: versioning,
//! opset imports, typed graph inputs/outputs, initializers, and SSA ordering
//! of node inputs and outputs, with subgraphs checked against their enclosing
//! scope.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use prost::{DecodeError, Message};
use serde::Serialize;

use crate::onnx::tensor_proto::{DataLocation, DataType};
use crate::onnx::tensor_shape_proto::dimension;
use crate::onnx::{GraphProto, ModelProto, TensorProto, TypeProto, ValueInfoProto, type_proto};

/// Newest IR version this checker understands (onnx 1.18).
pub const MAX_IR_VERSION: i64 = 11;

const DEFAULT_DOMAINS: [&str; 2] = ["", "ai.onnx"];

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Protobuf decoding error: {0}")]
    Decode(#[from] DecodeError),
    #[error("The model does not have an ir_version set properly")]
    MissingIrVersion,
    #[error("Model ir_version {0} is higher than the checker's ({max})", max = MAX_IR_VERSION)]
    UnsupportedIrVersion(i64),
    #[error("Model with IR version {0} must specify opset_import")]
    MissingOpsetImport(i64),
    #[error("Model imports domain \"{0}\" more than once")]
    DuplicateOpsetDomain(String),
    #[error("Opset version {version} for domain \"{domain}\" is invalid")]
    InvalidOpsetVersion { domain: String, version: i64 },
    #[error("Model does not import the default ONNX domain")]
    MissingDefaultOpset,
    #[error("Missing field \"{0}\"")]
    MissingField(&'static str),
    #[error("Graph {kind} at index {index} has an empty name")]
    EmptyName { kind: &'static str, index: usize },
    #[error("Value \"{0}\" has no type")]
    MissingType(String),
    #[error("Tensor \"{0}\" has an undefined element type")]
    UndefinedElemType(String),
    #[error("Tensor \"{name}\" has negative dimension {value}")]
    NegativeDimension { name: String, value: i64 },
    #[error("Name \"{0}\" is defined more than once in the graph")]
    DuplicateName(String),
    #[error("Node \"{0}\" has an empty op_type")]
    EmptyOpType(String),
    #[error("Node \"{node}\" uses domain \"{domain}\" which is not in opset_import")]
    UnimportedDomain { node: String, domain: String },
    #[error("Node \"{node}\" input \"{input}\" is not a graph input, initializer, or output of an earlier node")]
    UndefinedInput { node: String, input: String },
    #[error("Graph \"{0}\" has no outputs")]
    NoOutputs(String),
    #[error("Graph output \"{0}\" is not produced by any node")]
    UndefinedOutput(String),
    #[error("External data for tensor \"{name}\": {reason}")]
    ExternalData { name: String, reason: String },
}

pub fn load_model(path: &Path) -> Result<ModelProto, CheckError> {
    let bytes = fs::read(path).map_err(|source| CheckError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ModelProto::decode(bytes.as_slice())?)
}

/// Validates `model`. `base_dir` is the directory external tensor data is
/// resolved against; without it external data locations are not probed.
pub fn check_model(model: &ModelProto, base_dir: Option<&Path>) -> Result<(), CheckError> {
    if model.ir_version <= 0 {
        return Err(CheckError::MissingIrVersion);
    }
    if model.ir_version > MAX_IR_VERSION {
        return Err(CheckError::UnsupportedIrVersion(model.ir_version));
    }

    let mut domains = HashSet::new();
    for opset in &model.opset_import {
        let domain = canonical_domain(&opset.domain);
        if !domains.insert(domain) {
            return Err(CheckError::DuplicateOpsetDomain(opset.domain.clone()));
        }
        if opset.version <= 0 {
            return Err(CheckError::InvalidOpsetVersion {
                domain: opset.domain.clone(),
                version: opset.version,
            });
        }
    }
    if model.ir_version >= 3 {
        if model.opset_import.is_empty() {
            return Err(CheckError::MissingOpsetImport(model.ir_version));
        }
        if !domains.contains("") {
            return Err(CheckError::MissingDefaultOpset);
        }
    } else if model.opset_import.is_empty() {
        // Pre-opset models implicitly target the default domain.
        domains.insert("");
    }

    let graph = model.graph.as_ref().ok_or(CheckError::MissingField("graph"))?;
    let ctx = CheckContext { domains, base_dir };
    ctx.check_graph(graph, &HashSet::new(), true)
}

/// Loads `path`, checks it, and summarizes its interface.
pub fn verify_file(path: &Path) -> Result<ModelSummary, CheckError> {
    let model = load_model(path)?;
    check_model(&model, path.parent())?;
    Ok(ModelSummary::from_model(&model))
}

fn canonical_domain(domain: &str) -> &str {
    if DEFAULT_DOMAINS.contains(&domain) { "" } else { domain }
}

struct CheckContext<'a> {
    domains: HashSet<&'a str>,
    base_dir: Option<&'a Path>,
}

impl CheckContext<'_> {
    fn check_graph(
        &self,
        graph: &GraphProto,
        outer_scope: &HashSet<&str>,
        is_main_graph: bool,
    ) -> Result<(), CheckError> {
        if is_main_graph && graph.name.is_empty() {
            return Err(CheckError::MissingField("graph.name"));
        }

        let mut defined: HashSet<&str> = HashSet::new();

        for (index, input) in graph.input.iter().enumerate() {
            check_value_info(input, "input", index, is_main_graph)?;
            if !defined.insert(input.name.as_str()) {
                return Err(CheckError::DuplicateName(input.name.clone()));
            }
        }

        for (index, tensor) in graph.initializer.iter().enumerate() {
            if tensor.name.is_empty() {
                return Err(CheckError::EmptyName { kind: "initializer", index });
            }
            self.check_initializer(tensor)?;
            // Initializers may double as graph inputs for IR < 4.
            if !defined.insert(tensor.name.as_str())
                && !graph.input.iter().any(|x| x.name == tensor.name)
            {
                return Err(CheckError::DuplicateName(tensor.name.clone()));
            }
        }

        for (index, node) in graph.node.iter().enumerate() {
            let node_name = if node.name.is_empty() {
                format!("{}_{}", node.op_type, index)
            } else {
                node.name.clone()
            };
            if node.op_type.is_empty() {
                return Err(CheckError::EmptyOpType(node_name));
            }
            if !self.domains.contains(canonical_domain(&node.domain)) {
                return Err(CheckError::UnimportedDomain {
                    node: node_name,
                    domain: node.domain.clone(),
                });
            }
            for input in &node.input {
                if input.is_empty() {
                    continue;
                }
                if !defined.contains(input.as_str()) && !outer_scope.contains(input.as_str()) {
                    return Err(CheckError::UndefinedInput {
                        node: node_name,
                        input: input.clone(),
                    });
                }
            }

            let subgraphs = node
                .attribute
                .iter()
                .flat_map(|attr| attr.g.iter().chain(attr.graphs.iter()));
            let mut visible: Option<HashSet<&str>> = None;
            for subgraph in subgraphs {
                let scope = visible.get_or_insert_with(|| {
                    outer_scope.iter().chain(defined.iter()).copied().collect()
                });
                self.check_graph(subgraph, scope, false)?;
            }

            for output in &node.output {
                if output.is_empty() {
                    continue;
                }
                if !defined.insert(output.as_str()) {
                    return Err(CheckError::DuplicateName(output.clone()));
                }
            }
        }

        if graph.output.is_empty() {
            return Err(CheckError::NoOutputs(graph.name.clone()));
        }
        for (index, output) in graph.output.iter().enumerate() {
            check_value_info(output, "output", index, is_main_graph)?;
            if !defined.contains(output.name.as_str()) && !outer_scope.contains(output.name.as_str()) {
                return Err(CheckError::UndefinedOutput(output.name.clone()));
            }
        }

        Ok(())
    }

    fn check_initializer(&self, tensor: &TensorProto) -> Result<(), CheckError> {
        match DataType::try_from(tensor.data_type) {
            Ok(DataType::Undefined) | Err(_) => {
                return Err(CheckError::UndefinedElemType(tensor.name.clone()));
            }
            Ok(_) => {}
        }
        if let Some(value) = tensor.dims.iter().copied().find(|x| *x < 0) {
            return Err(CheckError::NegativeDimension {
                name: tensor.name.clone(),
                value,
            });
        }
        if tensor.data_location != DataLocation::External as i32 {
            return Ok(());
        }

        let location = tensor
            .external_data
            .iter()
            .find(|entry| entry.key == "location")
            .map(|entry| entry.value.as_str())
            .ok_or_else(|| CheckError::ExternalData {
                name: tensor.name.clone(),
                reason: "no location entry".to_string(),
            })?;
        let relative = Path::new(location);
        if relative.is_absolute() || relative.components().any(|c| c == std::path::Component::ParentDir) {
            return Err(CheckError::ExternalData {
                name: tensor.name.clone(),
                reason: format!("location {location:?} escapes the model directory"),
            });
        }
        if let Some(base_dir) = self.base_dir
            && !base_dir.join(relative).is_file()
        {
            return Err(CheckError::ExternalData {
                name: tensor.name.clone(),
                reason: format!("{} does not exist", base_dir.join(relative).display()),
            });
        }
        Ok(())
    }
}

fn check_value_info(
    value: &ValueInfoProto,
    kind: &'static str,
    index: usize,
    require_type: bool,
) -> Result<(), CheckError> {
    if value.name.is_empty() {
        return Err(CheckError::EmptyName { kind, index });
    }
    let Some(ty) = value.r#type.as_ref() else {
        if require_type {
            return Err(CheckError::MissingType(value.name.clone()));
        }
        return Ok(());
    };
    check_type(&value.name, ty, require_type)
}

fn check_type(name: &str, ty: &TypeProto, require_type: bool) -> Result<(), CheckError> {
    match &ty.value {
        None if require_type => Err(CheckError::MissingType(name.to_string())),
        None => Ok(()),
        Some(type_proto::Value::TensorType(tensor)) => {
            if tensor.elem_type == DataType::Undefined as i32 || !DataType::is_valid(tensor.elem_type) {
                return Err(CheckError::UndefinedElemType(name.to_string()));
            }
            let dims = tensor.shape.iter().flat_map(|shape| shape.dim.iter());
            for dim in dims {
                if let Some(dimension::Value::DimValue(value)) = &dim.value
                    && *value < 0
                {
                    return Err(CheckError::NegativeDimension {
                        name: name.to_string(),
                        value: *value,
                    });
                }
            }
            Ok(())
        }
        Some(type_proto::Value::SequenceType(seq)) => match &seq.elem_type {
            Some(elem) => check_type(name, elem, require_type),
            None => Err(CheckError::MissingType(name.to_string())),
        },
        Some(type_proto::Value::OptionalType(opt)) => match &opt.elem_type {
            Some(elem) => check_type(name, elem, require_type),
            None => Err(CheckError::MissingType(name.to_string())),
        },
        Some(type_proto::Value::MapType(map)) => match &map.value_type {
            Some(elem) => check_type(name, elem, require_type),
            None => Err(CheckError::MissingType(name.to_string())),
        },
        Some(type_proto::Value::SparseTensorType(sparse)) => {
            if sparse.elem_type == DataType::Undefined as i32 {
                return Err(CheckError::UndefinedElemType(name.to_string()));
            }
            Ok(())
        }
    }
}

/// One dimension of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
    Unknown,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(x) => write!(f, "{x}"),
            Dim::Symbolic(x) => write!(f, "{x}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueSummary {
    pub name: String,
    pub elem_type: String,
    pub shape: Vec<Dim>,
}

impl ValueSummary {
    fn from_value_info(value: &ValueInfoProto) -> Self {
        let (elem_type, shape) = match value.r#type.as_ref().and_then(|x| x.value.as_ref()) {
            Some(type_proto::Value::TensorType(tensor)) => {
                let elem_type = DataType::try_from(tensor.elem_type)
                    .map(|x| x.as_str_name().to_string())
                    .unwrap_or_else(|_| format!("UNKNOWN({})", tensor.elem_type));
                let shape = tensor
                    .shape
                    .iter()
                    .flat_map(|shape| shape.dim.iter())
                    .map(|dim| match &dim.value {
                        Some(dimension::Value::DimValue(x)) if *x > 0 => Dim::Fixed(*x),
                        Some(dimension::Value::DimParam(x)) if !x.is_empty() => Dim::Symbolic(x.clone()),
                        _ => Dim::Unknown,
                    })
                    .collect();
                (elem_type, shape)
            }
            Some(_) => ("NON_TENSOR".to_string(), vec![]),
            None => ("UNDEFINED".to_string(), vec![]),
        };
        ValueSummary {
            name: value.name.clone(),
            elem_type,
            shape,
        }
    }
}

impl fmt::Display for ValueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(|x| x.to_string()).collect();
        write!(f, "{}: {} [{}]", self.name, self.elem_type, dims.join(", "))
    }
}

/// Interface of a checked model, reported after a successful export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub ir_version: i64,
    pub opset: Option<i64>,
    pub producer: String,
    pub inputs: Vec<ValueSummary>,
    pub outputs: Vec<ValueSummary>,
    /// Class names from the exporter's `names` metadata entry, if any.
    pub class_names: Vec<String>,
}

impl ModelSummary {
    pub fn from_model(model: &ModelProto) -> Self {
        let opset = model
            .opset_import
            .iter()
            .find(|x| canonical_domain(&x.domain).is_empty())
            .map(|x| x.version);
        let producer = match (model.producer_name.as_str(), model.producer_version.as_str()) {
            (name, "") => name.to_string(),
            (name, version) => format!("{name} {version}"),
        };
        let (inputs, outputs) = match &model.graph {
            Some(graph) => {
                let initializers: HashSet<&str> =
                    graph.initializer.iter().map(|x| x.name.as_str()).collect();
                let inputs = graph
                    .input
                    .iter()
                    .filter(|x| !initializers.contains(x.name.as_str()))
                    .map(ValueSummary::from_value_info)
                    .collect();
                let outputs = graph.output.iter().map(ValueSummary::from_value_info).collect();
                (inputs, outputs)
            }
            None => (vec![], vec![]),
        };
        let class_names = model
            .metadata_props
            .iter()
            .find(|x| x.key == "names")
            .map(|x| parse_class_names(&x.value))
            .unwrap_or_default();
        ModelSummary {
            ir_version: model.ir_version,
            opset,
            producer,
            inputs,
            outputs,
            class_names,
        }
    }
}

/// Parses the `names` metadata Ultralytics embeds in exported graphs, a
/// Python dict repr such as `{0: 'pothole', 1: "driver's side"}`.
fn parse_class_names(repr: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = repr.chars();
    while let Some(c) = chars.next() {
        if c != ':' {
            continue;
        }
        let quote = match chars.by_ref().find(|c| !c.is_whitespace()) {
            Some(q @ ('\'' | '"')) => q,
            _ => continue,
        };
        names.push(chars.by_ref().take_while(|c| *c != quote).collect());
    }
    names
}
