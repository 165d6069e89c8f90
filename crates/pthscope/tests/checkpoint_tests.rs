mod common;

use common::{write_archive, write_safetensors, Module, Pickle};
use pthscope::prelude::*;
use pthscope::report::LOAD_ERROR_PREFIX;
use pthscope::state::ShapeEntry;
use tempfile::tempdir;

fn describe(path: &std::path::Path) -> serde_json::Value {
    let document = describe_file(path, &LoadConfig::default());
    serde_json::from_str(&document.to_json(ReportStyle::Compact).unwrap()).unwrap()
}

#[test]
fn test_training_checkpoint_archive() {
    let mut p = Pickle::new();
    p.empty_dict().op(b'(');
    p.str("epoch").int(12);
    p.str("state_dict").state_dict(&[
        ("conv1.weight", &[4, 3, 3, 3]),
        ("fc.weight", &[10, 4]),
        ("fc.bias", &[10]),
    ]);
    p.str("optimizer").empty_dict().op(b'(');
    p.str("state").empty_dict();
    p.str("param_groups").op(b']').put();
    p.op(b'u');
    p.str("arch").str("resnet18");
    p.op(b'u');

    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.pth");
    write_archive(&path, &p.finish());

    let json = describe(&path);
    assert_eq!(json["file_path"], path.display().to_string());
    assert_eq!(
        json["keys"],
        serde_json::json!(["epoch", "state_dict", "optimizer", "arch"])
    );

    let state = &json["details"]["state_dict"];
    assert_eq!(state["num_parameters"], 108 + 40 + 10);
    assert_eq!(state["parameter_shapes"]["conv1.weight"], serde_json::json!([4, 3, 3, 3]));
    let shape_keys: Vec<_> = state["parameter_shapes"].as_object().unwrap().keys().collect();
    assert_eq!(shape_keys, vec!["conv1.weight", "fc.weight", "fc.bias"]);
    assert_eq!(json["details"]["optimizer"]["keys"], serde_json::json!(["state", "param_groups"]));
    assert_eq!(json["details"]["epoch"], 12);
    assert_eq!(json["details"]["arch"], "resnet18");
    assert!(json["details"].get("params").is_none());

    assert_eq!(json["summary"]["num_keys"], 4);
    assert_eq!(json["summary"]["has_optimizer"], true);
    assert_eq!(json["summary"]["has_params"], false);
}

#[test]
fn test_flat_state_dict_archive() {
    let mut p = Pickle::new();
    p.state_dict(&[("0.weight", &[8, 4]), ("0.bias", &[8])]);

    let dir = tempdir().unwrap();
    let path = dir.path().join("weights.pt");
    write_archive(&path, &p.finish());

    let checkpoint = load_checkpoint(&path, &LoadConfig::default()).unwrap();
    assert!(matches!(CheckpointShape::of(&checkpoint), CheckpointShape::Flat(_)));

    let result = analyze_checkpoint(&checkpoint);
    assert_eq!(result.keys, vec!["state_dict"]);
    match result.details.get("state_dict") {
        Some(Detail::StateMapping(analysis)) => {
            assert_eq!(analysis.num_parameters, 40);
            assert_eq!(analysis.parameter_shapes.get("0.bias"), Some(&ShapeEntry::Shape(vec![8])));
            assert!(analysis.error.is_none());
        }
        other => panic!("unexpected detail: {:?}", other),
    }
}

#[test]
fn test_full_model_archive() {
    let model = Module::new("torch.nn.modules.container", "Sequential")
        .child("0", Module::linear(4, 16))
        .child("1", Module::new("torch.nn.modules.activation", "ReLU"))
        .child(
            "2",
            Module::new("torch.nn.modules.linear", "Linear")
                .param("weight", &[2, 16])
                .no_param("bias"),
        );
    let mut p = Pickle::new();
    p.module(&model);

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.pth");
    write_archive(&path, &p.finish());

    let json = describe(&path);
    assert_eq!(json["keys"], serde_json::json!(["state_dict"]));
    let model = &json["details"]["model"];
    assert_eq!(model["num_parameters"], 64 + 16 + 32);
    assert_eq!(model["layer_names"], serde_json::json!(["0", "1", "2"]));
    assert_eq!(model["num_layers"], 3);
    assert_eq!(
        model["module_hierarchy"],
        serde_json::json!([
            {"name": "", "type": "Sequential"},
            {"name": "0", "type": "Linear"},
            {"name": "1", "type": "ReLU"},
            {"name": "2", "type": "Linear"},
        ])
    );
}

#[test]
fn test_ema_weights_take_precedence() {
    let mut p = Pickle::new();
    p.empty_dict().op(b'(');
    p.str("params").state_dict(&[("w", &[2, 2])]);
    p.str("params_ema").state_dict(&[("w", &[3, 3])]);
    p.op(b'u');

    let dir = tempdir().unwrap();
    let path = dir.path().join("gan.pth");
    write_archive(&path, &p.finish());

    let json = describe(&path);
    assert_eq!(json["details"]["params_ema"]["num_parameters"], 9);
    assert!(json["details"].get("params").is_none());
    assert_eq!(json["summary"]["has_params"], true);
    assert_eq!(json["summary"]["has_params_ema"], true);
}

#[test]
fn test_safetensors_matches_flat_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    write_safetensors(
        &path,
        r#"{"fc.weight":{"dtype":"F16","shape":[10,5],"data_offsets":[0,100]},"fc.bias":{"dtype":"F16","shape":[10],"data_offsets":[100,120]}}"#,
    );

    let json = describe(&path);
    assert_eq!(json["keys"], serde_json::json!(["state_dict"]));
    assert_eq!(json["details"]["state_dict"]["num_parameters"], 60);
    assert_eq!(json["summary"]["has_optimizer"], false);
}

#[test]
fn test_explicit_format_overrides_detection() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weights.bin");
    write_safetensors(&path, r#"{"w":{"dtype":"F32","shape":[4],"data_offsets":[0,16]}}"#);

    let config = LoadConfig::new().format(CheckpointFormat::Safetensors).mmap(false);
    let document = describe_file(&path, &config);
    let result = document.result().expect("analysis");
    assert_eq!(result.num_parameters(), Some(4));

    let config = LoadConfig::new().format(CheckpointFormat::Pickle);
    assert!(describe_file(&path, &config).error().is_some());
}

#[test]
fn test_archive_without_data_pkl_is_load_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.pth");
    {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file("archive/version", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"3\n").unwrap();
        zip.finish().unwrap();
    }

    let document = describe_file(&path, &LoadConfig::default());
    let error = document.error().expect("load error");
    assert!(error.starts_with(LOAD_ERROR_PREFIX));
    assert!(error.contains("data.pkl"));
}

#[test]
fn test_legacy_serialization_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("old.pth");
    let mut bytes = vec![
        0x80, 0x02, 0x8a, 0x0a, 0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19,
    ];
    bytes.extend_from_slice(b".");
    std::fs::write(&path, bytes).unwrap();

    let document = describe_file(&path, &LoadConfig::default());
    assert!(document.error().expect("load error").contains("legacy"));
}

#[test]
fn test_unrecognized_file_is_load_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"not a checkpoint").unwrap();

    let json = describe(&path);
    assert_eq!(json.as_object().unwrap().len(), 1);
    assert!(json["error"].as_str().unwrap().starts_with(LOAD_ERROR_PREFIX));
}
