//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty, ensuring every tensor has at least one axis.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Prepends a leading batch axis, turning a per-example shape into a batch shape.
    pub fn batched(&self, batch: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.dims);
        Shape { dims }
    }

    /// Drops the leading batch axis, recovering the per-example shape.
    ///
    /// A rank-1 shape collapses to `[1]` so the result stays a valid shape.
    pub fn unbatched(&self) -> Shape {
        if self.dims.len() <= 1 {
            Shape { dims: vec![1] }
        } else {
            Shape {
                dims: self.dims[1..].to_vec(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_round_trip() {
        let per_example = Shape::new([1, 28, 28]);
        let batched = per_example.batched(32);
        assert_eq!(batched.dims(), &[32, 1, 28, 28]);
        assert_eq!(batched.unbatched(), per_example);
        assert_eq!(batched.num_elements(), 32 * 28 * 28);
    }
}
