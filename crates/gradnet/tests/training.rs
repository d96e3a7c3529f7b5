use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use gradnet::graph::ActivationKind;
use gradnet::nn::{Conv2d, Dense, Dropout, Flatten, MaxPooling2d};
use gradnet::params::ParamSpec;
use gradnet::tensor::{Context, Shape, Tensor};
use gradnet::train::{Accuracy, Loss, Metric, Sgd, TensorDataset};
use gradnet::Model;
use gradnet_engine_ref_cpu::CpuTensorEngine;

fn temp_path(tag: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("gradnet_{tag}_{timestamp}.params"))
}

/// Two well-separated 2D blobs, four examples per class.
fn blob_dataset() -> TensorDataset {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..4 {
        let jitter = 0.1 * i as f32;
        rows.extend_from_slice(&[-1.0 - jitter, -1.0 + jitter]);
        labels.push(0.0);
        rows.extend_from_slice(&[1.0 + jitter, 1.0 - jitter]);
        labels.push(1.0);
    }
    TensorDataset::new(
        Tensor::from_vec(Shape::new([8, 2]), rows).unwrap(),
        Tensor::from_vec(Shape::new([8]), labels).unwrap(),
    )
    .unwrap()
}

fn blob_mlp(seed: u64) -> Model {
    let mut model = Model::new(Shape::new([2]), Context::cpu()).with_seed(seed);
    model
        .add(Dense::new(8).with_activation(ActivationKind::Tanh))
        .unwrap();
    model.add(Dense::new(2)).unwrap();
    model
}

#[test]
fn mlp_learns_separable_blobs() {
    let engine = CpuTensorEngine::new();
    let mut model = blob_mlp(5);
    let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::new())];
    model
        .compile(
            Box::new(Sgd::new(0.5)),
            Loss::CategoricalCrossEntropy,
            metrics,
        )
        .unwrap();

    let mut train = blob_dataset();
    let mut val = blob_dataset();
    let report = model
        .fit(&engine, &mut train, 120, 4, Some(&mut val))
        .unwrap();

    let first = report.epochs.first().unwrap();
    let last = report.epochs.last().unwrap();
    assert!(
        last.train_loss < first.train_loss,
        "loss did not decrease: {} -> {}",
        first.train_loss,
        last.train_loss
    );
    assert_eq!(last.train_metrics[0].0, "accuracy");
    assert_eq!(last.train_metrics[0].1, 1.0);

    let val_metrics = last.val_metrics.as_ref().unwrap();
    assert_eq!(val_metrics[0], ("accuracy".to_string(), 1.0));
}

#[test]
fn cnn_stack_trains_end_to_end() {
    // Class 0 images light up the left half, class 1 the right half.
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..8 {
        let class = i % 2;
        for y in 0..6 {
            for x in 0..6 {
                let lit = if class == 0 { x < 3 } else { x >= 3 };
                let scale = 1.0 + 0.05 * (i / 2) as f32 + 0.01 * y as f32;
                rows.push(if lit { scale } else { 0.0 });
            }
        }
        labels.push(class as f32);
    }
    let mut train = TensorDataset::new(
        Tensor::from_vec(Shape::new([8, 1, 6, 6]), rows).unwrap(),
        Tensor::from_vec(Shape::new([8]), labels).unwrap(),
    )
    .unwrap();

    let engine = CpuTensorEngine::new();
    let mut model = Model::new(Shape::new([1, 6, 6]), Context::cpu()).with_seed(9);
    model
        .add(Conv2d::new(2, [3, 3]).with_activation(ActivationKind::Relu))
        .unwrap();
    model.add(MaxPooling2d::new([2, 2], [2, 2])).unwrap();
    model.add(Flatten::new()).unwrap();
    model.add(Dense::new(2)).unwrap();
    let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::new())];
    model
        .compile(
            Box::new(Sgd::new(0.2)),
            Loss::CategoricalCrossEntropy,
            metrics,
        )
        .unwrap();

    let report = model.fit(&engine, &mut train, 80, 4, None).unwrap();
    let first = report.epochs.first().unwrap();
    let last = report.epochs.last().unwrap();
    assert!(
        last.train_loss < first.train_loss,
        "conv stack failed to learn: {} -> {}",
        first.train_loss,
        last.train_loss
    );
}

#[test]
fn identical_seeds_build_identical_models() {
    let mut a = blob_mlp(21);
    let mut b = blob_mlp(21);
    for model in [&mut a, &mut b] {
        model
            .compile(
                Box::new(Sgd::new(0.1)),
                Loss::CategoricalCrossEntropy,
                Vec::new(),
            )
            .unwrap();
        model
            .parameters()
            .unwrap()
            .initialize(None, None, false, false)
            .unwrap();
    }
    let store_a = a.parameters().unwrap();
    let store_b = b.parameters().unwrap();
    assert_eq!(store_a.keys(), store_b.keys());
    for name in store_a.keys() {
        let pa = store_a.get(&name, ParamSpec::default()).unwrap();
        let pb = store_b.get(&name, ParamSpec::default()).unwrap();
        assert_eq!(
            pa.read().value().unwrap().data(),
            pb.read().value().unwrap().data(),
            "parameter '{name}' differs"
        );
    }
}

#[test]
fn saved_model_predicts_identically_after_restore() {
    let engine = CpuTensorEngine::new();
    let mut model = blob_mlp(13);
    model
        .compile(
            Box::new(Sgd::new(0.5)),
            Loss::CategoricalCrossEntropy,
            Vec::new(),
        )
        .unwrap();
    let mut train = blob_dataset();
    model.fit(&engine, &mut train, 20, 4, None).unwrap();

    let path = temp_path("model_restore");
    model.save_parameters(&path).unwrap();

    // Different seed: restored weights must come from the archive.
    let mut restored = blob_mlp(77);
    restored
        .compile(
            Box::new(Sgd::new(0.5)),
            Loss::CategoricalCrossEntropy,
            Vec::new(),
        )
        .unwrap();
    restored.load_parameters(&path, Default::default()).unwrap();
    fs::remove_file(&path).unwrap();

    let probe = Tensor::from_vec(Shape::new([3, 2]), vec![-1.0, -1.0, 1.0, 1.0, 0.2, -0.4])
        .unwrap();
    let original_preds = model.predict(&engine, &probe).unwrap();
    let restored_preds = restored.predict(&engine, &probe).unwrap();
    assert_eq!(original_preds.data(), restored_preds.data());
    assert_eq!(original_preds.shape().dims(), &[3, 2]);
}

#[test]
fn dropout_is_identity_at_prediction_time() {
    let engine = CpuTensorEngine::new();
    let mut model = Model::new(Shape::new([4]), Context::cpu()).with_seed(2);
    model.add(Dropout::new(0.5)).unwrap();
    model.add(Dense::new(2)).unwrap();
    model
        .compile(
            Box::new(Sgd::new(0.1)),
            Loss::CategoricalCrossEntropy,
            Vec::new(),
        )
        .unwrap();

    let probe = Tensor::from_vec(Shape::new([2, 4]), vec![0.25; 8]).unwrap();
    let first = model.predict(&engine, &probe).unwrap();
    let second = model.predict(&engine, &probe).unwrap();
    assert_eq!(first.data(), second.data());
}

#[test]
fn evaluate_reports_metrics_without_updating_parameters() {
    let engine = CpuTensorEngine::new();
    let mut model = blob_mlp(31);
    let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::new())];
    model
        .compile(
            Box::new(Sgd::new(0.5)),
            Loss::CategoricalCrossEntropy,
            metrics,
        )
        .unwrap();
    model
        .parameters()
        .unwrap()
        .initialize(None, None, false, false)
        .unwrap();

    let before = model
        .parameters()
        .unwrap()
        .get("dense1_weight", ParamSpec::default())
        .unwrap()
        .read()
        .value()
        .unwrap()
        .clone();

    let mut data = blob_dataset();
    let metrics = model.evaluate(&engine, &mut data, 4).unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].0, "accuracy");

    let after = model
        .parameters()
        .unwrap()
        .get("dense1_weight", ParamSpec::default())
        .unwrap()
        .read()
        .value()
        .unwrap()
        .clone();
    assert_eq!(before.data(), after.data());
}
