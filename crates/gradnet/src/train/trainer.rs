//! Orchestration of the per-batch training cycle and validation passes.
//!
//! Batches run strictly sequentially: gradient accumulators and optimizer
//! state are not designed for concurrent mutation. Every engine call blocks,
//! and optimizer updates are applied only after the whole backward pass has
//! succeeded, so aborting a fit never leaves a half-applied step.

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{info, warn};

use crate::engine::spec::{Bindings, ExecMode, TensorEngine};
use crate::error::BatchError;
use crate::graph::Graph;
use crate::model::Model;
use crate::params::ParameterStore;
use crate::train::data::{Batch, DataSource};
use crate::train::metric::{Accumulator, Metric};
use crate::train::optim::{Optimizer, ParamMults};

/// What to do when a batch fails with a batch-scoped error
/// (shape mismatch or non-finite loss).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorPolicy {
    /// Abort the fit. The default.
    Halt,
    /// Log, count, and continue with the next batch.
    Skip,
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub on_batch_error: BatchErrorPolicy,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            on_batch_error: BatchErrorPolicy::Halt,
        }
    }
}

/// Per-epoch snapshot collected by [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_metrics: Vec<(String, f32)>,
    pub val_metrics: Option<Vec<(String, f32)>>,
    pub batches: usize,
    pub skipped_batches: usize,
}

#[derive(Debug, Default, Clone)]
pub struct FitReport {
    pub epochs: Vec<EpochRecord>,
}

impl FitReport {
    pub fn final_train_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train_loss)
    }
}

/// Drives epochs and batches over a compiled model through a tensor engine.
pub struct Trainer<'a> {
    model: &'a mut Model,
    engine: &'a dyn TensorEngine,
    options: TrainOptions,
}

impl<'a> Trainer<'a> {
    pub fn new(model: &'a mut Model, engine: &'a dyn TensorEngine) -> Self {
        Trainer {
            model,
            engine,
            options: TrainOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TrainOptions) -> Self {
        self.options = options;
        self
    }

    pub fn skip_on_batch_error(mut self) -> Self {
        self.options.on_batch_error = BatchErrorPolicy::Skip;
        self
    }

    /// Runs `epochs` passes over `train`, validating against `val` when given.
    pub fn fit(
        &mut self,
        train: &mut dyn DataSource,
        epochs: usize,
        batch_size: usize,
        mut val: Option<&mut dyn DataSource>,
    ) -> Result<FitReport> {
        let ctx = self.model.ctx();
        let options = self.options.clone();
        let engine = self.engine;
        let compiled = self.model.compiled_mut()?;
        compiled.store.initialize(None, Some(ctx), false, false)?;
        let crate::model::Compiled {
            graph,
            store,
            optimizer,
            metrics,
            ..
        } = compiled;

        let mut report = FitReport::default();
        for epoch in 0..epochs {
            for metric in metrics.iter_mut() {
                metric.reset();
            }
            train.reset();

            let mut loss_acc = Accumulator::default();
            let mut batches = 0usize;
            let mut skipped = 0usize;
            let mut batch_idx = 0usize;
            while let Some(batch) = train.next_batch(batch_size)? {
                let step = train_batch(
                    engine,
                    graph,
                    store,
                    optimizer.as_mut(),
                    metrics,
                    &batch,
                    epoch,
                    batch_idx,
                );
                match step {
                    Ok(loss) => {
                        loss_acc.add(loss);
                        batches += 1;
                    }
                    Err(err)
                        if options.on_batch_error == BatchErrorPolicy::Skip
                            && err.downcast_ref::<BatchError>().is_some() =>
                    {
                        warn!(epoch, batch = batch_idx, error = %err, "skipping failed batch");
                        skipped += 1;
                    }
                    Err(err) => return Err(err),
                }
                batch_idx += 1;
            }

            let train_loss = loss_acc.value();
            let train_metrics = metric_values(metrics);
            let val_metrics = match val.as_deref_mut() {
                Some(source) => Some(evaluate_source(
                    engine, graph, store, metrics, source, batch_size,
                )?),
                None => None,
            };

            info!(
                epoch,
                train_loss,
                batches,
                skipped,
                metrics = ?train_metrics,
                val = ?val_metrics,
                "epoch complete"
            );
            report.epochs.push(EpochRecord {
                epoch,
                train_loss,
                train_metrics,
                val_metrics,
                batches,
                skipped_batches: skipped,
            });
        }
        Ok(report)
    }

    /// Forward-plus-metrics pass with no gradients or updates.
    pub fn evaluate(
        &mut self,
        data: &mut dyn DataSource,
        batch_size: usize,
    ) -> Result<Vec<(String, f32)>> {
        let ctx = self.model.ctx();
        let engine = self.engine;
        let compiled = self.model.compiled_mut()?;
        compiled.store.initialize(None, Some(ctx), false, false)?;
        let crate::model::Compiled {
            graph,
            store,
            metrics,
            ..
        } = compiled;
        evaluate_source(engine, graph, store, metrics, data, batch_size)
    }
}

/// Rejects a batch whose example shape disagrees with the compiled input.
fn check_batch_shape(graph: &Graph, batch: &Batch, batch_idx: usize) -> Result<()> {
    let expected = &graph.node(graph.input()).shape;
    let got = batch.data.shape();
    let feature_match =
        got.rank() == expected.rank() + 1 && &got.dims()[1..] == expected.dims();
    if !feature_match || got.dims()[0] == 0 {
        bail!(BatchError::Shape {
            batch: batch_idx,
            expected: expected.dims().to_vec(),
            got: got.dims().to_vec(),
        });
    }
    if batch.label.shape().dims()[0] != got.dims()[0] {
        bail!(BatchError::Shape {
            batch: batch_idx,
            expected: vec![got.dims()[0]],
            got: batch.label.shape().dims().to_vec(),
        });
    }
    Ok(())
}

/// Binds the batch placeholders and every materialized parameter value.
fn bind_batch(store: &ParameterStore, batch: &Batch) -> Result<Bindings> {
    let mut bindings = Bindings::new();
    bindings.bind("data", batch.data.clone());
    bindings.bind("label", batch.label.clone());
    for (name, param) in store.params() {
        let value = param
            .read()
            .value()
            .with_context(|| format!("binding parameter '{name}'"))?
            .clone();
        bindings.bind(name, value);
    }
    Ok(bindings)
}

/// One full training step: zero-grad, forward, loss guard, backward,
/// per-parameter optimizer update, metric accounting.
#[allow(clippy::too_many_arguments)]
fn train_batch(
    engine: &dyn TensorEngine,
    graph: &Graph,
    store: &ParameterStore,
    optimizer: &mut dyn Optimizer,
    metrics: &mut [Box<dyn Metric>],
    batch: &Batch,
    epoch: usize,
    batch_idx: usize,
) -> Result<f32> {
    store.zero_grad();
    check_batch_shape(graph, batch, batch_idx)?;

    let bindings = bind_batch(store, batch)?;
    let artifacts = engine.forward(graph, &bindings, ExecMode::Train)?;

    let loss = artifacts.value(graph.loss())?.scalar()?;
    if !loss.is_finite() {
        bail!(BatchError::NonFiniteLoss {
            value: loss,
            epoch,
            batch: batch_idx,
        });
    }

    let grads = engine.backward(graph, &bindings, &artifacts)?;

    for (name, param) in store.params() {
        let mut param = param.write();
        if !param.is_trainable() {
            continue;
        }
        let grad = grads
            .get(&name)
            .ok_or_else(|| anyhow!("engine returned no gradient for parameter '{name}'"))?;
        param.accumulate_grad(grad)?;
        let accumulated = param
            .grad()
            .cloned()
            .ok_or_else(|| anyhow!("trainable parameter '{name}' has no gradient buffer"))?;
        let mults = ParamMults {
            lr_mult: param.lr_mult(),
            wd_mult: param.wd_mult(),
        };
        optimizer.update(&name, param.value_mut()?, &accumulated, mults)?;
    }

    let preds = artifacts.value(graph.prediction())?;
    for metric in metrics.iter_mut() {
        metric.update(engine, &batch.label, preds)?;
    }
    Ok(loss)
}

/// Streams a data source through forward-only execution, folding metrics.
fn evaluate_source(
    engine: &dyn TensorEngine,
    graph: &Graph,
    store: &ParameterStore,
    metrics: &mut [Box<dyn Metric>],
    data: &mut dyn DataSource,
    batch_size: usize,
) -> Result<Vec<(String, f32)>> {
    for metric in metrics.iter_mut() {
        metric.reset();
    }
    data.reset();
    let mut batch_idx = 0usize;
    while let Some(batch) = data.next_batch(batch_size)? {
        check_batch_shape(graph, &batch, batch_idx)?;
        let bindings = bind_batch(store, &batch)?;
        let artifacts = engine.forward(graph, &bindings, ExecMode::Eval)?;
        let preds = artifacts.value(graph.prediction())?;
        for metric in metrics.iter_mut() {
            metric.update(engine, &batch.label, preds)?;
        }
        batch_idx += 1;
    }
    Ok(metric_values(metrics))
}

fn metric_values(metrics: &[Box<dyn Metric>]) -> Vec<(String, f32)> {
    metrics
        .iter()
        .map(|m| (m.name().to_string(), m.value()))
        .collect()
}
