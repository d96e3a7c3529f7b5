//! Batch supply contract consumed by the fit loop.

use anyhow::{ensure, Result};

use crate::tensor::Tensor;

/// One mini-batch: inputs of shape `[N, ...]` and the matching labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Tensor,
    pub label: Tensor,
}

/// A lazy, finite, restartable sequence of batches.
///
/// Batches carry `batch_size` examples except possibly the last of an epoch,
/// which may be short. `reset` rewinds to the beginning for the next epoch.
pub trait DataSource {
    fn reset(&mut self);
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Batch>>;
}

/// In-memory data source backed by two pre-stacked tensors.
pub struct TensorDataset {
    data: Tensor,
    label: Tensor,
    position: usize,
}

impl TensorDataset {
    pub fn new(data: Tensor, label: Tensor) -> Result<Self> {
        ensure!(
            data.shape().dims()[0] == label.shape().dims()[0],
            "data and label example counts differ: {} vs {}",
            data.shape().dims()[0],
            label.shape().dims()[0]
        );
        Ok(TensorDataset {
            data,
            label,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.data.shape().dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for TensorDataset {
    fn reset(&mut self) {
        self.position = 0;
    }

    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Batch>> {
        ensure!(batch_size > 0, "batch size must be positive");
        let total = self.len();
        if self.position >= total {
            return Ok(None);
        }
        let end = (self.position + batch_size).min(total);
        let batch = Batch {
            data: self.data.slice_rows(self.position, end)?,
            label: self.label.slice_rows(self.position, end)?,
        };
        self.position = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    #[test]
    fn short_last_batch_and_reset() {
        let data = Tensor::from_vec(Shape::new([5, 2]), (0..10).map(|v| v as f32).collect())
            .unwrap();
        let label = Tensor::from_vec(Shape::new([5]), vec![0.0; 5]).unwrap();
        let mut source = TensorDataset::new(data, label).unwrap();

        let first = source.next_batch(2).unwrap().unwrap();
        assert_eq!(first.data.shape().dims(), &[2, 2]);
        let _ = source.next_batch(2).unwrap().unwrap();
        let last = source.next_batch(2).unwrap().unwrap();
        assert_eq!(last.data.shape().dims(), &[1, 2]);
        assert!(source.next_batch(2).unwrap().is_none());

        source.reset();
        assert_eq!(
            source.next_batch(2).unwrap().unwrap().data.data(),
            first.data.data()
        );
    }
}
