use anyhow::Result;
use gradnet::graph::ActivationKind;
use gradnet::nn::Dense;
use gradnet::tensor::{Context, Shape, Tensor};
use gradnet::train::{Accuracy, Loss, Metric, Sgd, TensorDataset};
use gradnet::Model;
use gradnet_engine_ref_cpu::CpuTensorEngine;

/// Trains a small MLP on two separable 2D blobs and prints the fit report.
fn main() -> Result<()> {
    let engine = CpuTensorEngine::new();

    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..16 {
        let jitter = 0.05 * (i % 4) as f32;
        if i % 2 == 0 {
            rows.extend_from_slice(&[-1.0 - jitter, -1.0 + jitter]);
            labels.push(0.0);
        } else {
            rows.extend_from_slice(&[1.0 + jitter, 1.0 - jitter]);
            labels.push(1.0);
        }
    }
    let mut train = TensorDataset::new(
        Tensor::from_vec(Shape::new([16, 2]), rows)?,
        Tensor::from_vec(Shape::new([16]), labels)?,
    )?;
    let mut val = TensorDataset::new(
        Tensor::from_vec(Shape::new([2, 2]), vec![-1.1, -0.9, 1.1, 0.9])?,
        Tensor::from_vec(Shape::new([2]), vec![0.0, 1.0])?,
    )?;

    let mut model = Model::new(Shape::new([2]), Context::cpu());
    model.add(Dense::new(8).with_activation(ActivationKind::Tanh))?;
    model.add(Dense::new(2))?;
    let metrics: Vec<Box<dyn Metric>> = vec![Box::new(Accuracy::new())];
    model.compile(
        Box::new(Sgd::new(0.5)),
        Loss::CategoricalCrossEntropy,
        metrics,
    )?;

    println!("{}", model.summary()?);

    let report = model.fit(&engine, &mut train, 50, 4, Some(&mut val))?;
    for epoch in report.epochs.iter().step_by(10) {
        println!(
            "epoch {:>3}  loss {:.4}  train {:?}  val {:?}",
            epoch.epoch, epoch.train_loss, epoch.train_metrics, epoch.val_metrics
        );
    }
    println!(
        "final loss: {:.4}",
        report.final_train_loss().unwrap_or(f32::NAN)
    );
    Ok(())
}
