//! A named, shaped, lazily materialized tensor handle with an initialization
//! policy and a gradient accumulator.
//!
//! Shape resolution is a one-way transition: once a shape is known it can be
//! restated but never changed, and materialization requires it. The two-state
//! [`ParamData`] enum makes the lifecycle explicit instead of hiding it behind
//! nullable fields.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, ensure, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::StoreError;
use crate::init::Initializer;
use crate::tensor::{Context, DType, Shape, Tensor};

/// Whether gradient is computed and written for this parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradReq {
    Write,
    Null,
}

/// Physical layout of the parameter's tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Dense,
    RowSparse,
}

/// Which side wins when a loaded tensor's dtype differs from the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtypeSource {
    /// Cast the loaded tensor to the parameter's declared dtype.
    Current,
    /// Adopt the loaded tensor's dtype.
    Saved,
}

/// Declaration-time configuration for [`ParameterStore::get`].
///
/// [`ParameterStore::get`]: crate::params::store::ParameterStore::get
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub grad_req: GradReq,
    pub shape: Option<Shape>,
    pub dtype: DType,
    pub lr_mult: f32,
    pub wd_mult: f32,
    pub init: Option<Initializer>,
    pub allow_deferred: bool,
    pub differentiable: bool,
    pub storage: StorageKind,
}

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec {
            grad_req: GradReq::Write,
            shape: None,
            dtype: DType::F32,
            lr_mult: 1.0,
            wd_mult: 1.0,
            init: None,
            allow_deferred: false,
            differentiable: true,
            storage: StorageKind::Dense,
        }
    }
}

/// Lifecycle state of the parameter's tensor.
#[derive(Debug, Clone)]
pub enum ParamData {
    /// Declared, possibly shape-resolved, but not yet backed by a tensor.
    Deferred { shape: Option<Shape> },
    /// Backed by a live tensor; `grad` exists iff the parameter writes gradient.
    Materialized { value: Tensor, grad: Option<Tensor> },
}

#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    grad_req: GradReq,
    dtype: DType,
    lr_mult: f32,
    wd_mult: f32,
    init: Option<Initializer>,
    allow_deferred: bool,
    differentiable: bool,
    storage: StorageKind,
    constant: bool,
    data: ParamData,
}

impl Parameter {
    pub fn new(name: impl Into<String>, spec: ParamSpec) -> Self {
        Parameter {
            name: name.into(),
            grad_req: spec.grad_req,
            dtype: spec.dtype,
            lr_mult: spec.lr_mult,
            wd_mult: spec.wd_mult,
            init: spec.init,
            allow_deferred: spec.allow_deferred,
            differentiable: spec.differentiable,
            storage: spec.storage,
            constant: false,
            data: ParamData::Deferred { shape: spec.shape },
        }
    }

    /// A non-trainable fixed tensor. Constants are born materialized and are
    /// never re-initialized.
    pub fn constant(name: impl Into<String>, value: Tensor) -> Self {
        let dtype = value.dtype();
        Parameter {
            name: name.into(),
            grad_req: GradReq::Null,
            dtype,
            lr_mult: 1.0,
            wd_mult: 1.0,
            init: None,
            allow_deferred: false,
            differentiable: false,
            storage: StorageKind::Dense,
            constant: true,
            data: ParamData::Materialized { value, grad: None },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn grad_req(&self) -> GradReq {
        self.grad_req
    }

    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    pub fn lr_mult(&self) -> f32 {
        self.lr_mult
    }

    pub fn wd_mult(&self) -> f32 {
        self.wd_mult
    }

    /// Updates take part for this parameter: it writes gradient and is
    /// marked differentiable.
    pub fn is_trainable(&self) -> bool {
        !self.constant && self.differentiable && self.grad_req == GradReq::Write
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.data, ParamData::Materialized { .. })
    }

    /// The resolved shape, if any.
    pub fn shape(&self) -> Option<&Shape> {
        match &self.data {
            ParamData::Deferred { shape } => shape.as_ref(),
            ParamData::Materialized { value, .. } => Some(value.shape()),
        }
    }

    /// Records the shape on first resolution; re-resolution must restate the
    /// same shape, anything else is an error.
    pub fn resolve_shape(&mut self, shape: &Shape) -> Result<()> {
        match self.shape() {
            None => {
                self.data = ParamData::Deferred {
                    shape: Some(shape.clone()),
                };
                Ok(())
            }
            Some(resolved) if resolved == shape => Ok(()),
            Some(resolved) => bail!(StoreError::ShapeMismatch {
                name: self.name.clone(),
                resolved: resolved.dims().to_vec(),
                requested: shape.dims().to_vec(),
            }),
        }
    }

    /// Fills in shape and initializer from a repeated declaration; the first
    /// writer wins, and a conflicting shape is an error.
    pub fn merge_spec(&mut self, spec: &ParamSpec) -> Result<()> {
        if let Some(shape) = &spec.shape {
            self.resolve_shape(shape)?;
        }
        if self.init.is_none() {
            self.init = spec.init.clone();
        }
        Ok(())
    }

    /// Allocates and initializes the backing tensor.
    ///
    /// Already-materialized parameters are skipped unless `force_reinit`;
    /// constants are never reinitialized. A parameter without a resolved shape
    /// is skipped when it allows deferred initialization (first graph use will
    /// resolve it) and is an error otherwise.
    pub fn materialize(
        &mut self,
        default_init: &Initializer,
        ctx: Context,
        seed: u64,
        force_reinit: bool,
    ) -> Result<bool> {
        if self.constant {
            return Ok(false);
        }
        if self.is_materialized() && !force_reinit {
            return Ok(false);
        }
        let shape = match self.shape() {
            Some(shape) => shape.clone(),
            None if self.allow_deferred => return Ok(false),
            None => bail!(StoreError::UnresolvedShape {
                name: self.name.clone(),
            }),
        };
        let init = self.init.clone().unwrap_or_else(|| default_init.clone());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut value = init.generate(&shape, &mut rng);
        if value.dtype() != self.dtype {
            value = value.cast(self.dtype);
        }
        value.set_ctx(ctx);
        let grad = (self.grad_req == GradReq::Write).then(|| {
            let mut grad = Tensor::zeros(shape.clone());
            grad.set_ctx(ctx);
            grad
        });
        self.data = ParamData::Materialized { value, grad };
        Ok(true)
    }

    pub fn value(&self) -> Result<&Tensor> {
        match &self.data {
            ParamData::Materialized { value, .. } => Ok(value),
            ParamData::Deferred { .. } => bail!(StoreError::NotMaterialized {
                name: self.name.clone(),
            }),
        }
    }

    pub fn value_mut(&mut self) -> Result<&mut Tensor> {
        match &mut self.data {
            ParamData::Materialized { value, .. } => Ok(value),
            ParamData::Deferred { .. } => bail!(StoreError::NotMaterialized {
                name: self.name.clone(),
            }),
        }
    }

    pub fn grad(&self) -> Option<&Tensor> {
        match &self.data {
            ParamData::Materialized { grad, .. } => grad.as_ref(),
            ParamData::Deferred { .. } => None,
        }
    }

    /// Zeroes the gradient accumulator in place. The buffer is kept allocated.
    pub fn zero_grad(&mut self) {
        if let ParamData::Materialized {
            grad: Some(grad), ..
        } = &mut self.data
        {
            grad.fill(0.0);
        }
    }

    /// Adds an engine-produced gradient into the accumulator.
    pub fn accumulate_grad(&mut self, incoming: &Tensor) -> Result<()> {
        let name = self.name.clone();
        match &mut self.data {
            ParamData::Materialized {
                grad: Some(grad), ..
            } => {
                ensure!(
                    grad.shape() == incoming.shape(),
                    "gradient shape {:?} does not match parameter '{}' shape {:?}",
                    incoming.shape().dims(),
                    name,
                    grad.shape().dims()
                );
                for (g, i) in grad.data_mut().iter_mut().zip(incoming.data()) {
                    *g += i;
                }
                Ok(())
            }
            _ => bail!(StoreError::NotMaterialized { name }),
        }
    }

    /// Migrates the backing tensor to a new device context.
    ///
    /// This also zeroes the gradient accumulator; see DESIGN.md for why the
    /// two operations stay coupled.
    pub fn reset_context(&mut self, ctx: Context) {
        if let ParamData::Materialized { value, grad } = &mut self.data {
            value.set_ctx(ctx);
            if let Some(grad) = grad {
                grad.set_ctx(ctx);
                grad.fill(0.0);
            }
        }
    }

    /// Installs a restored tensor as the parameter value.
    ///
    /// The shape must match the resolved shape when one exists; an unresolved
    /// parameter adopts the loaded shape. Dtype mismatches are an error unless
    /// `cast_dtype`, in which case `dtype_source` picks the surviving dtype.
    pub fn load_value(
        &mut self,
        tensor: Tensor,
        ctx: Option<Context>,
        cast_dtype: bool,
        dtype_source: DtypeSource,
    ) -> Result<()> {
        if let Some(shape) = self.shape() {
            ensure!(
                shape == tensor.shape(),
                StoreError::ShapeMismatch {
                    name: self.name.clone(),
                    resolved: shape.dims().to_vec(),
                    requested: tensor.shape().dims().to_vec(),
                }
            );
        }
        let mut value = if tensor.dtype() == self.dtype {
            tensor
        } else if cast_dtype {
            match dtype_source {
                DtypeSource::Current => tensor.cast(self.dtype),
                DtypeSource::Saved => {
                    self.dtype = tensor.dtype();
                    tensor
                }
            }
        } else {
            bail!(
                "parameter '{}' declared dtype {:?} but file holds {:?} (set cast_dtype to convert)",
                self.name,
                self.dtype,
                tensor.dtype()
            );
        };
        if let Some(ctx) = ctx {
            value.set_ctx(ctx);
        }
        let ctx = value.ctx();
        let grad = (self.grad_req == GradReq::Write && !self.constant).then(|| {
            let mut grad = Tensor::zeros(value.shape().clone());
            grad.set_ctx(ctx);
            grad
        });
        self.data = ParamData::Materialized { value, grad };
        Ok(())
    }
}

/// Shared handle to a parameter. Cloning the handle aliases the same tensor and
/// gradient, which is how parameter sharing across stores is expressed.
#[derive(Debug, Clone)]
pub struct ParamRef(Arc<RwLock<Parameter>>);

impl ParamRef {
    pub fn new(parameter: Parameter) -> Self {
        ParamRef(Arc::new(RwLock::new(parameter)))
    }

    /// Read access. Poisoning is recovered from: the trainer is single-threaded
    /// by contract, so a poisoned lock only means a previous panic unwound here.
    pub fn read(&self) -> RwLockReadGuard<'_, Parameter> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Parameter> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity comparison: do two handles alias the same parameter?
    pub fn ptr_eq(&self, other: &ParamRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_re_resolution_to_different_shape_fails() {
        let mut p = Parameter::new("w", ParamSpec::default());
        p.resolve_shape(&Shape::new([4, 2])).unwrap();
        p.resolve_shape(&Shape::new([4, 2])).unwrap();
        let err = p.resolve_shape(&Shape::new([2, 4])).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }

    #[test]
    fn materialize_requires_shape_unless_deferred() {
        let mut strict = Parameter::new("w", ParamSpec::default());
        let err = strict
            .materialize(&Initializer::default(), Context::cpu(), 1, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnresolvedShape { .. })
        ));

        let mut lazy = Parameter::new(
            "w",
            ParamSpec {
                allow_deferred: true,
                ..Default::default()
            },
        );
        let done = lazy
            .materialize(&Initializer::default(), Context::cpu(), 1, false)
            .unwrap();
        assert!(!done);
    }

    #[test]
    fn zero_grad_keeps_buffer() {
        let mut p = Parameter::new(
            "w",
            ParamSpec {
                shape: Some(Shape::new([3])),
                ..Default::default()
            },
        );
        p.materialize(&Initializer::Ones, Context::cpu(), 1, false)
            .unwrap();
        p.accumulate_grad(&Tensor::ones(Shape::new([3]))).unwrap();
        p.zero_grad();
        assert_eq!(p.grad().unwrap().data(), &[0.0, 0.0, 0.0]);
    }
}
