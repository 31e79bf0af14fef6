mod common;

use std::fs;

use common::{Dim as TestDim, detection_model, node, tensor_value};
use prost::Message;
use yolo_onnx_convert::checker::{CheckError, Dim, ModelSummary, check_model, load_model, verify_file};
use yolo_onnx_convert::onnx::tensor_proto::{DataLocation, DataType};
use yolo_onnx_convert::onnx::{
    AttributeProto, GraphProto, ModelProto, OperatorSetIdProto, StringStringEntryProto, TensorProto,
};
use yolo_onnx_convert::ExportConfig;

fn model() -> ModelProto {
    detection_model(&ExportConfig::default())
}

fn graph(model: &mut ModelProto) -> &mut GraphProto {
    model.graph.as_mut().unwrap()
}

#[test]
fn accepts_exported_detection_graph() {
    check_model(&model(), None).unwrap();
}

#[test]
fn verify_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    fs::write(&path, model().encode_to_vec()).unwrap();

    let summary = verify_file(&path).unwrap();

    assert_eq!(summary.ir_version, 8);
    assert_eq!(summary.producer, "pytorch 2.3.0");
    assert_eq!(summary.outputs[1].to_string(), "output1: FLOAT [1, 32, 160, 160]");
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_model(&dir.path().join("absent.onnx")).unwrap_err();
    assert!(matches!(err, CheckError::Io { .. }));
}

#[test]
fn rejects_missing_ir_version() {
    let mut model = model();
    model.ir_version = 0;
    assert!(matches!(check_model(&model, None), Err(CheckError::MissingIrVersion)));
}

#[test]
fn rejects_future_ir_version() {
    let mut model = model();
    model.ir_version = 99;
    assert!(matches!(check_model(&model, None), Err(CheckError::UnsupportedIrVersion(99))));
}

#[test]
fn rejects_missing_opset_import() {
    let mut model = model();
    model.opset_import.clear();
    assert!(matches!(check_model(&model, None), Err(CheckError::MissingOpsetImport(8))));
}

#[test]
fn treats_ai_onnx_as_default_domain() {
    let mut model = model();
    model.opset_import[0].domain = "ai.onnx".to_string();
    check_model(&model, None).unwrap();

    model.opset_import.push(OperatorSetIdProto {
        domain: String::new(),
        version: 17,
    });
    assert!(matches!(check_model(&model, None), Err(CheckError::DuplicateOpsetDomain(_))));
}

#[test]
fn rejects_node_from_unimported_domain() {
    let mut model = model();
    let mut custom = node("EfficientNMS_TRT", &["features"], &["nms_out"]);
    custom.domain = "com.microsoft".to_string();
    graph(&mut model).node.push(custom);
    assert!(matches!(
        check_model(&model, None),
        Err(CheckError::UnimportedDomain { domain, .. }) if domain == "com.microsoft"
    ));

    model.opset_import.push(OperatorSetIdProto {
        domain: "com.microsoft".to_string(),
        version: 1,
    });
    check_model(&model, None).unwrap();
}

#[test]
fn rejects_use_before_definition() {
    let mut model = model();
    graph(&mut model).node.swap(0, 1);
    assert!(matches!(
        check_model(&model, None),
        Err(CheckError::UndefinedInput { input, .. }) if input == "features"
    ));
}

#[test]
fn rejects_redefined_name() {
    let mut model = model();
    graph(&mut model).node.push(node("Relu", &["images"], &["features"]));
    assert!(matches!(check_model(&model, None), Err(CheckError::DuplicateName(name)) if name == "features"));
}

#[test]
fn rejects_undefined_graph_output() {
    let mut model = model();
    graph(&mut model).output.push(tensor_value("output2", DataType::Float, &[TestDim::Fixed(1)]));
    assert!(matches!(check_model(&model, None), Err(CheckError::UndefinedOutput(name)) if name == "output2"));
}

#[test]
fn rejects_graph_without_outputs() {
    let mut model = model();
    graph(&mut model).output.clear();
    assert!(matches!(check_model(&model, None), Err(CheckError::NoOutputs(_))));
}

#[test]
fn rejects_untyped_graph_input() {
    let mut model = model();
    graph(&mut model).input[0].r#type = None;
    assert!(matches!(check_model(&model, None), Err(CheckError::MissingType(name)) if name == "images"));
}

#[test]
fn rejects_undefined_elem_type_and_negative_dims() {
    let mut model = model();
    graph(&mut model).input[0] = tensor_value("images", DataType::Undefined, &[TestDim::Fixed(1)]);
    assert!(matches!(check_model(&model, None), Err(CheckError::UndefinedElemType(_))));

    graph(&mut model).input[0] = tensor_value("images", DataType::Float, &[TestDim::Fixed(-3)]);
    assert!(matches!(
        check_model(&model, None),
        Err(CheckError::NegativeDimension { value: -3, .. })
    ));
}

#[test]
fn rejects_unnamed_graph() {
    let mut model = model();
    graph(&mut model).name.clear();
    assert!(matches!(check_model(&model, None), Err(CheckError::MissingField("graph.name"))));
}

#[test]
fn initializers_feed_nodes() {
    let mut model = model();
    let g = graph(&mut model);
    g.initializer.push(TensorProto {
        name: "conv.weight".to_string(),
        dims: vec![16, 3, 3, 3],
        data_type: DataType::Float as i32,
        ..Default::default()
    });
    g.node[0].input.push("conv.weight".to_string());
    check_model(&model, None).unwrap();

    let summary = ModelSummary::from_model(&model);
    assert_eq!(summary.inputs.len(), 1);
}

#[test]
fn external_data_must_exist_beside_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = model();
    let g = graph(&mut model);
    g.initializer.push(TensorProto {
        name: "conv.weight".to_string(),
        dims: vec![16, 3, 3, 3],
        data_type: DataType::Float as i32,
        data_location: DataLocation::External as i32,
        external_data: vec![StringStringEntryProto {
            key: "location".to_string(),
            value: "weights.bin".to_string(),
        }],
        ..Default::default()
    });
    g.node[0].input.push("conv.weight".to_string());

    assert!(matches!(check_model(&model, Some(dir.path())), Err(CheckError::ExternalData { .. })));
    fs::write(dir.path().join("weights.bin"), [0u8; 16]).unwrap();
    check_model(&model, Some(dir.path())).unwrap();
}

#[test]
fn subgraphs_see_enclosing_scope() {
    let mut model = model();
    let branch = |source: &str, output: &str| GraphProto {
        name: format!("{output}_branch"),
        node: vec![node("Identity", &[source], &[output])],
        output: vec![tensor_value(output, DataType::Float, &[])],
        ..Default::default()
    };
    let mut if_node = node("If", &["features"], &["selected"]);
    if_node.attribute = vec![
        AttributeProto {
            name: "then_branch".to_string(),
            g: Some(branch("features", "then_out")),
            ..Default::default()
        },
        AttributeProto {
            name: "else_branch".to_string(),
            g: Some(branch("output0", "else_out")),
            ..Default::default()
        },
    ];
    graph(&mut model).node.push(if_node.clone());
    check_model(&model, None).unwrap();

    if_node.attribute[1].g = Some(branch("not_yet_defined", "else_out"));
    graph(&mut model).node.pop();
    graph(&mut model).node.push(if_node);
    assert!(matches!(
        check_model(&model, None),
        Err(CheckError::UndefinedInput { input, .. }) if input == "not_yet_defined"
    ));
}

#[test]
fn summary_reports_symbolic_dimensions() {
    let model = detection_model(&ExportConfig {
        dynamic: true,
        ..ExportConfig::default()
    });
    let summary = ModelSummary::from_model(&model);
    assert_eq!(summary.inputs[0].shape[0], Dim::Symbolic("batch".to_string()));
    assert_eq!(summary.inputs[0].to_string(), "images: FLOAT [batch, 3, 640, 640]");
}

#[test]
fn summary_reads_class_names_metadata() {
    let summary = ModelSummary::from_model(&model());
    assert_eq!(summary.class_names, ["pothole", "driver's side crack"]);

    let mut model = model();
    model.metadata_props.clear();
    assert!(ModelSummary::from_model(&model).class_names.is_empty());
}
