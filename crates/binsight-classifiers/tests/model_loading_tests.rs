//! Model loading integration tests
//!
//! Build reference networks with Candle, write their weights to disk or into synthetic
//! artifacts, and check which strategy picks them up.

use binsight_classifiers::{
    artifact::Artifact, Architecture, ImageModel, InferenceEngine, LoadStrategy, ModelAdapter, ModelConfig,
    PredictionCache, PreprocessConfig, Preprocessor,
};
use binsight_core::{ClassLabelSet, Error, InferenceOptions};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::Path;

fn weights_of(architecture: Architecture, num_classes: usize) -> Vec<(String, Tensor)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    architecture.build(vb, num_classes).unwrap();

    let data = varmap.data().lock().unwrap();
    let mut weights: Vec<(String, Tensor)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    weights.sort_by(|a, b| a.0.cmp(&b.0));
    weights
}

fn write_safetensors(path: &Path, weights: &[(String, Tensor)], prefix: &str) {
    let map: HashMap<String, Tensor> = weights
        .iter()
        .map(|(k, t)| (format!("{}{}", prefix, k), t.clone()))
        .collect();
    candle_core::safetensors::save(&map, path).unwrap();
}

fn mapping(weights: &[(String, Tensor)]) -> Artifact {
    Artifact::Mapping(
        weights
            .iter()
            .map(|(k, t)| (k.clone(), Artifact::Tensor(t.clone())))
            .collect(),
    )
}

fn adapter() -> ModelAdapter {
    ModelAdapter::new(ClassLabelSet::waste_categories(), Device::Cpu)
}

const RESNET18: Architecture = Architecture::ResNet { depth: 18 };
const EFFICIENTNET_B0: Architecture = Architecture::EfficientNet { variant: 0 };

#[test]
fn test_flat_weights_with_distributed_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resnet18_waste.safetensors");
    let weights = weights_of(RESNET18, 10);
    write_safetensors(&path, &weights, "module.");

    let handle = adapter().load(&ModelConfig::from_local(&path)).unwrap();

    assert_eq!(handle.strategy(), Some(&LoadStrategy::FlatWeights));
    assert_eq!(handle.architecture(), "resnet18");
    assert_eq!(handle.num_outputs(), Some(10));
    assert!(handle.identity().starts_with("resnet18_waste:"));

    let report = handle.load_report().unwrap();
    assert!(report.is_exact(), "unexpected report: {:?}", report);
    assert_eq!(report.loaded, weights.len());

    let batch = Tensor::zeros((2, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
    let logits = handle.forward(&batch).unwrap();
    assert_eq!(logits.dims(), &[2, 10]);
}

#[test]
fn test_loaded_weights_reproduce_reference_outputs() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let reference = RESNET18.build(vb, 10).unwrap();

    let weights: Vec<(String, Tensor)> = {
        let data = varmap.data().lock().unwrap();
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };
    let handle = adapter().load_artifact(&mapping(&weights), "reference:0").unwrap();

    let batch = Tensor::rand(0f32, 1f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
    let expected = reference.forward(&batch).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let actual = handle.forward(&batch).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();

    for (e, a) in expected.iter().zip(&actual) {
        assert!((e - a).abs() < 1e-4, "expected {}, got {}", e, a);
    }
}

#[test]
fn test_efficientnet_head_is_resized_non_strictly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("efficientnet_b0_imagenet.safetensors");
    // ImageNet head: 1000 outputs
    write_safetensors(&path, &weights_of(EFFICIENTNET_B0, 1000), "");

    let handle = adapter().load_path(&path).unwrap();
    assert_eq!(handle.architecture(), "efficientnet_b0");
    assert_eq!(handle.num_outputs(), Some(10));

    let report = handle.load_report().unwrap();
    assert_eq!(
        report.mismatched,
        vec!["classifier.1.bias".to_string(), "classifier.1.weight".to_string()]
    );
    assert!(report.unexpected.is_empty());
    assert!(report.missing.is_empty());
}

#[test]
fn test_nested_state_dict() {
    let weights = weights_of(RESNET18, 10);
    let checkpoint = Artifact::Mapping(vec![
        ("epoch".into(), Artifact::Opaque("int(30)".into())),
        ("optimizer".into(), Artifact::Mapping(vec![("lr".into(), Artifact::Opaque("float".into()))])),
        ("state_dict".into(), mapping(&weights)),
    ]);

    let handle = adapter().load_artifact(&checkpoint, "ckpt:0").unwrap();
    assert_eq!(
        handle.strategy(),
        Some(&LoadStrategy::NestedCheckpoint {
            key: "state_dict".into()
        })
    );
    assert_eq!(handle.architecture(), "resnet18");
}

#[test]
fn test_nested_key_priority() {
    let weights = weights_of(RESNET18, 10);
    let checkpoint = Artifact::Mapping(vec![
        ("model".into(), mapping(&weights)),
        ("model_state_dict".into(), mapping(&weights)),
    ]);

    let handle = adapter().load_artifact(&checkpoint, "ckpt:1").unwrap();
    assert_eq!(
        handle.strategy(),
        Some(&LoadStrategy::NestedCheckpoint {
            key: "model_state_dict".into()
        })
    );
}

#[test]
fn test_full_model_keeps_own_head() {
    let artifact = Artifact::Module {
        class_name: "torchvision.models.resnet.ResNet".into(),
        state: weights_of(RESNET18, 7),
    };

    let handle = adapter().load_artifact(&artifact, "full:0").unwrap();
    assert!(matches!(handle.strategy(), Some(LoadStrategy::FullModel { .. })));
    assert_eq!(handle.num_outputs(), Some(7));
    assert!(handle.load_report().unwrap().is_exact());
}

#[test]
fn test_unrecognized_artifact_lists_every_strategy() {
    let artifact = Artifact::Mapping(vec![
        ("epoch".into(), Artifact::Opaque("int(3)".into())),
        ("name".into(), Artifact::Opaque("str".into())),
    ]);

    let err = adapter().load_artifact(&artifact, "junk:0").unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, Error::ModelLoad(_)));
    for strategy in ["executable-graph", "flat-weights", "nested-checkpoint", "full-model"] {
        assert!(message.contains(strategy), "{} missing from {}", strategy, message);
    }
}

#[test]
fn test_garbage_file_is_model_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.pth");
    std::fs::write(&path, b"definitely not a checkpoint").unwrap();

    let err = adapter().load_path(&path).unwrap_err();
    assert!(matches!(err, Error::ModelLoad(_)));
}

#[test]
fn test_model_directory_picks_first_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_safetensors(&dir.path().join("a_resnet.safetensors"), &weights_of(RESNET18, 10), "");
    std::fs::write(dir.path().join("README.md"), b"weights").unwrap();

    let handle = adapter().load(&ModelConfig::from_local(dir.path())).unwrap();
    assert!(handle.identity().starts_with("a_resnet:"));
}

#[test]
fn test_engine_end_to_end_with_loaded_model() {
    let weights = weights_of(RESNET18, 10);
    let handle = adapter().load_artifact(&mapping(&weights), "resnet18:e2e").unwrap();
    let preprocessor = Preprocessor::new(PreprocessConfig {
        resize: 72,
        crop: 64,
        ..Default::default()
    })
    .unwrap();
    let engine = InferenceEngine::new(
        Some(handle),
        ClassLabelSet::waste_categories(),
        preprocessor,
        PredictionCache::new(4).unwrap(),
    );

    let image = RgbImage::from_fn(96, 80, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 90]));
    let options = InferenceOptions::default().with_threshold(0.01).with_augment(true);
    let result = engine.classify(Some(&image), &options).unwrap();

    let total: f32 = result.scores().unwrap().iter().map(|s| s.probability).sum();
    assert!((total - 1.0).abs() < 1e-5);
    assert_eq!(engine.forward_passes(), 1);
}
