//! Running metrics accumulated over (label, prediction) batches.

use anyhow::Result;

use crate::engine::spec::TensorEngine;
use crate::tensor::Tensor;

/// Sum/count pair behind every running metric value.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    sum_metric: f32,
    num_inst: usize,
}

impl Accumulator {
    pub fn add(&mut self, value: f32) {
        self.sum_metric += value;
        self.num_inst += 1;
    }

    /// Running value; zero before the first update rather than a division error.
    pub fn value(&self) -> f32 {
        if self.num_inst == 0 {
            0.0
        } else {
            self.sum_metric / self.num_inst as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum_metric = 0.0;
        self.num_inst = 0;
    }
}

/// Stateful accumulator over per-batch (labels, predictions) pairs.
pub trait Metric {
    fn name(&self) -> &'static str;

    /// Folds one batch into the running value using engine primitives.
    fn update(
        &mut self,
        engine: &dyn TensorEngine,
        labels: &Tensor,
        preds: &Tensor,
    ) -> Result<()>;

    fn value(&self) -> f32;

    fn reset(&mut self);
}

/// Fraction of rows whose argmax channel matches the integer label.
#[derive(Debug, Default)]
pub struct Accuracy {
    acc: Accumulator,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &'static str {
        "accuracy"
    }

    fn update(
        &mut self,
        engine: &dyn TensorEngine,
        labels: &Tensor,
        preds: &Tensor,
    ) -> Result<()> {
        let picked = engine.argmax_channel(preds)?;
        let labels = labels.reshape(picked.shape().clone())?;
        let matches = engine.equal(&picked, &labels)?;
        self.acc.add(engine.mean(&matches)?.scalar()?);
        Ok(())
    }

    fn value(&self) -> f32 {
        self.acc.value()
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

/// Mean absolute percentage error `mean(|pred - label| / label)`.
#[derive(Debug, Default)]
pub struct Mape {
    acc: Accumulator,
}

impl Mape {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Mape {
    fn name(&self) -> &'static str {
        "mape"
    }

    fn update(
        &mut self,
        engine: &dyn TensorEngine,
        labels: &Tensor,
        preds: &Tensor,
    ) -> Result<()> {
        // An empty batch contributes a neutral value instead of failing.
        if preds.is_empty() || labels.is_empty() {
            self.acc.add(0.0);
            return Ok(());
        }
        let preds = preds.reshape(labels.shape().clone())?;
        let diff = engine.sub(&preds, labels)?;
        let ratio = engine.div(&diff, labels)?;
        let magnitude = engine.abs(&ratio)?;
        self.acc.add(engine.mean(&magnitude)?.scalar()?);
        Ok(())
    }

    fn value(&self) -> f32 {
        self.acc.value()
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}
