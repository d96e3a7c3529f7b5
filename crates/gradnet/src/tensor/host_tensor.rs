//! Host-backed tensor used for parameter storage, batches, and engine results.
//!
//! The engine contract treats these as opaque value carriers; a real accelerator
//! engine would hold device handles behind the same surface.

use anyhow::{bail, ensure, Result};

use super::{Context, DType, Shape};

/// Typed payload of a host tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

/// Dense host tensor with a shape, dtype, and device placement tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
    ctx: Context,
}

impl Tensor {
    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        ensure!(
            data.len() == shape.num_elements(),
            "tensor data length ({}) does not match shape {:?}",
            data.len(),
            shape.dims()
        );
        Ok(Tensor {
            shape,
            data: TensorData::F32(data),
            ctx: Context::cpu(),
        })
    }

    /// Constructs an `I32` tensor, ensuring the payload matches the expected element count.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        ensure!(
            data.len() == shape.num_elements(),
            "tensor data length ({}) does not match shape {:?}",
            data.len(),
            shape.dims()
        );
        Ok(Tensor {
            shape,
            data: TensorData::I32(data),
            ctx: Context::cpu(),
        })
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![0.0; len]),
            ctx: Context::cpu(),
        }
    }

    /// Returns a one-initialized `F32` tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    /// Returns an `F32` tensor filled with a constant value.
    pub fn full(shape: Shape, value: f32) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![value; len]),
            ctx: Context::cpu(),
        }
    }

    /// Wraps a scalar in a rank-1 tensor, the conventional shape for reductions.
    pub fn scalar_value(value: f32) -> Self {
        Tensor {
            shape: Shape::new([1]),
            data: TensorData::F32(vec![value]),
            ctx: Context::cpu(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn ctx(&self) -> Context {
        self.ctx
    }

    /// Retags the tensor with a new device context.
    ///
    /// The reference host representation keeps the payload in place; an
    /// accelerator engine would migrate storage here.
    pub fn set_ctx(&mut self, ctx: Context) {
        self.ctx = ctx;
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the underlying `f32` data slice, panicking if the dtype differs.
    pub fn data(&self) -> &[f32] {
        match &self.data {
            TensorData::F32(values) => values,
            TensorData::I32(_) => panic!("tensor data is not stored as f32"),
        }
    }

    /// Mutably borrows the `f32` data slice, panicking if the dtype differs.
    pub fn data_mut(&mut self) -> &mut [f32] {
        match &mut self.data {
            TensorData::F32(values) => values,
            TensorData::I32(_) => panic!("tensor data is not stored as mutable f32"),
        }
    }

    /// Borrows the underlying `i32` data slice, panicking if the dtype differs.
    pub fn data_i32(&self) -> &[i32] {
        match &self.data {
            TensorData::I32(values) => values,
            TensorData::F32(_) => panic!("tensor data is not stored as i32"),
        }
    }

    /// Fills the tensor with a constant value.
    pub fn fill(&mut self, value: f32) {
        self.data_mut().fill(value);
    }

    /// Reinterprets the payload under a new shape with the same element count.
    pub fn reshape(&self, shape: Shape) -> Result<Tensor> {
        ensure!(
            shape.num_elements() == self.len(),
            "cannot reshape {:?} ({} elements) to {:?} ({} elements)",
            self.shape.dims(),
            self.len(),
            shape.dims(),
            shape.num_elements()
        );
        let mut out = self.clone();
        out.shape = shape;
        Ok(out)
    }

    /// Converts the payload to the requested dtype, rounding on float-to-int casts.
    pub fn cast(&self, dtype: DType) -> Tensor {
        if self.dtype() == dtype {
            return self.clone();
        }
        let data = match (&self.data, dtype) {
            (TensorData::F32(values), DType::I32) => {
                TensorData::I32(values.iter().map(|&v| v.round() as i32).collect())
            }
            (TensorData::I32(values), DType::F32) => {
                TensorData::F32(values.iter().map(|&v| v as f32).collect())
            }
            _ => unreachable!("dtype equality handled above"),
        };
        Tensor {
            shape: self.shape.clone(),
            data,
            ctx: self.ctx,
        }
    }

    /// Extracts the single element of a rank-1 singleton tensor.
    pub fn scalar(&self) -> Result<f32> {
        ensure!(
            self.len() == 1,
            "expected a scalar tensor, got shape {:?}",
            self.shape.dims()
        );
        match &self.data {
            TensorData::F32(values) => Ok(values[0]),
            TensorData::I32(values) => Ok(values[0] as f32),
        }
    }

    /// Copies a contiguous row range along the leading axis into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Tensor> {
        let dims = self.shape.dims();
        ensure!(
            start < end && end <= dims[0],
            "row slice {}..{} out of bounds for leading dimension {}",
            start,
            end,
            dims[0]
        );
        let row_len: usize = dims[1..].iter().product::<usize>().max(1);
        let mut out_dims = dims.to_vec();
        out_dims[0] = end - start;
        let shape = Shape::new(out_dims);
        let data = match &self.data {
            TensorData::F32(values) => {
                TensorData::F32(values[start * row_len..end * row_len].to_vec())
            }
            TensorData::I32(values) => {
                TensorData::I32(values[start * row_len..end * row_len].to_vec())
            }
        };
        Ok(Tensor {
            shape,
            data,
            ctx: self.ctx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_length_mismatch() {
        assert!(Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn slice_rows_keeps_trailing_dims() {
        let t = Tensor::from_vec(Shape::new([3, 2]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = t.slice_rows(1, 3).unwrap();
        assert_eq!(s.shape().dims(), &[2, 2]);
        assert_eq!(s.data(), &[3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn cast_round_trips_class_indices() {
        let t = Tensor::from_vec(Shape::new([3]), vec![0.0, 2.0, 1.0]).unwrap();
        let i = t.cast(DType::I32);
        assert_eq!(i.data_i32(), &[0, 2, 1]);
        assert_eq!(i.cast(DType::F32).data(), &[0.0, 2.0, 1.0]);
    }
}
