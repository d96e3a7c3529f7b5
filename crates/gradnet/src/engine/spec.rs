//! Contract for the external tensor-computation engine.
//!
//! The training layer never implements tensor math itself. It hands the engine a
//! frozen [`Graph`] plus name-keyed tensor bindings and receives node values and
//! per-parameter gradients back. Engines may parallelize internally, but every
//! call here blocks until its result tensors are ready.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::graph::{Graph, NodeId};
use crate::tensor::{Context, DType, Shape, Tensor};

/// Whether stochastic nodes (dropout) are live or pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Train,
    Eval,
}

/// Name-keyed tensors bound to graph placeholders for one execution:
/// the input batch, the label batch, and every parameter value.
#[derive(Debug, Default)]
pub struct Bindings {
    map: BTreeMap<String, Tensor>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.map.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.map
            .get(name)
            .ok_or_else(|| anyhow!("no tensor bound for graph node '{name}'"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

/// Values produced by a forward pass, indexed by node, plus engine-private
/// saved tensors (dropout masks and the like) needed to replay backward.
#[derive(Debug)]
pub struct ForwardArtifacts {
    values: Vec<Option<Tensor>>,
    saved: BTreeMap<usize, Tensor>,
}

impl ForwardArtifacts {
    pub fn new(node_count: usize) -> Self {
        Self {
            values: vec![None; node_count],
            saved: BTreeMap::new(),
        }
    }

    pub fn set_value(&mut self, id: NodeId, tensor: Tensor) {
        self.values[id.index()] = Some(tensor);
    }

    pub fn value(&self, id: NodeId) -> Result<&Tensor> {
        self.values[id.index()]
            .as_ref()
            .ok_or_else(|| anyhow!("forward pass produced no value for node {}", id.index()))
    }

    /// Like [`value`], but absent values (e.g. a loss node skipped because no
    /// label was bound) return `None` instead of an error.
    ///
    /// [`value`]: ForwardArtifacts::value
    pub fn try_value(&self, id: NodeId) -> Option<&Tensor> {
        self.values[id.index()].as_ref()
    }

    /// Stashes an auxiliary tensor (e.g. a dropout mask) for the backward pass.
    pub fn save(&mut self, id: NodeId, tensor: Tensor) {
        self.saved.insert(id.index(), tensor);
    }

    pub fn saved(&self, id: NodeId) -> Option<&Tensor> {
        self.saved.get(&id.index())
    }
}

/// The narrow interface this layer consumes from the native tensor engine.
///
/// `forward`/`backward` cover graph execution and gradient computation; the
/// remaining operations are the primitive elementwise/reduction kernels used
/// only for metric accounting.
pub trait TensorEngine: Send + Sync {
    /// Allocates a zero-filled tensor on the given device.
    fn create_tensor(&self, shape: &Shape, dtype: DType, ctx: Context) -> Result<Tensor>;

    /// Evaluates every node of the graph against the bindings, returning all
    /// node values. Blocks until results are ready.
    fn forward(
        &self,
        graph: &Graph,
        bindings: &Bindings,
        mode: ExecMode,
    ) -> Result<ForwardArtifacts>;

    /// Differentiates the graph's loss node, returning gradients keyed by
    /// qualified parameter name.
    fn backward(
        &self,
        graph: &Graph,
        bindings: &Bindings,
        artifacts: &ForwardArtifacts,
    ) -> Result<BTreeMap<String, Tensor>>;

    /// Argmax over the channel axis (axis 1): `[N, K]` predictions to `[N]` indices.
    fn argmax_channel(&self, preds: &Tensor) -> Result<Tensor>;

    /// Elementwise equality, `1.0` where equal.
    fn equal(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor>;

    /// Elementwise absolute value.
    fn abs(&self, x: &Tensor) -> Result<Tensor>;

    /// Elementwise subtraction.
    fn sub(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor>;

    /// Elementwise division.
    fn div(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor>;

    /// Mean over every element, as a rank-1 singleton tensor.
    fn mean(&self, x: &Tensor) -> Result<Tensor>;
}
