//! Layer capability interface and the closed set of layer variants.
//!
//! A layer consumes one graph node, produces one graph node, and declares the
//! parameters it needs through the build context before returning. Layers are
//! stateless beyond their configuration; everything they allocate lives in the
//! model's parameter store.

mod activation;
mod conv;
mod dense;
mod dropout;
mod flatten;
mod pooling;

pub use activation::Activation;
pub use conv::Conv2d;
pub use dense::Dense;
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use pooling::{AvgPooling2d, GlobalPooling2d, GlobalPooling3d, MaxPooling2d};

use anyhow::{Context as _, Result};

use crate::error::ConfigError;
use crate::graph::{GraphBuilder, NodeId, OpKind};
use crate::params::{ParamSpec, ParameterStore};
use crate::tensor::Shape;

/// Build-time environment handed to [`Layer::build`]: the graph under
/// construction, the model's store, and the layer's assigned instance name
/// (e.g. `dense1`).
pub struct BuildContext<'a> {
    graph: &'a mut GraphBuilder,
    store: &'a ParameterStore,
    name: String,
}

impl<'a> BuildContext<'a> {
    pub fn new(graph: &'a mut GraphBuilder, store: &'a ParameterStore, name: String) -> Self {
        BuildContext { graph, store, name }
    }

    /// The layer instance name, used to derive node and parameter names.
    pub fn layer_name(&self) -> &str {
        &self.name
    }

    pub fn graph(&mut self) -> &mut GraphBuilder {
        self.graph
    }

    /// Per-example output shape of an already-built node.
    pub fn shape_of(&self, id: NodeId) -> &Shape {
        self.graph.shape_of(id)
    }

    /// Registers `<layer>_<role>` in the store and mirrors it as a parameter
    /// node in the graph. The returned node feeds the layer's operation.
    pub fn declare_param(&mut self, role: &str, spec: ParamSpec) -> Result<NodeId> {
        let local = format!("{}_{}", self.name, role);
        let shape = spec
            .shape
            .clone()
            .expect("layers declare parameters with a computed shape");
        let param = self.store.get(&local, spec)?;
        let qualified = param.read().name().to_string();
        self.graph
            .add(qualified.clone(), OpKind::Parameter, &[], shape)
            .map_err(|_| {
                ConfigError::DuplicateParameter { name: qualified }.into()
            })
    }

    /// Appends the layer's operation node under the layer's own name.
    pub fn add_op(&mut self, op: OpKind, inputs: &[NodeId], shape: Shape) -> Result<NodeId> {
        let name = self.name.clone();
        self.graph
            .add(name, op, inputs, shape)
            .with_context(|| format!("building layer '{}'", self.name))
    }

    /// Appends a suffixed helper node, e.g. the fused activation `dense1_act`.
    pub fn add_suffixed(&mut self, suffix: &str, op: OpKind, inputs: &[NodeId], shape: Shape) -> Result<NodeId> {
        let name = format!("{}_{}", self.name, suffix);
        self.graph
            .add(name, op, inputs, shape)
            .with_context(|| format!("building layer '{}'", self.name))
    }

    /// Fails the build with a configuration error naming this layer.
    pub fn incompatible_input<T>(&self, shape: &Shape, reason: impl Into<String>) -> Result<T> {
        Err(ConfigError::IncompatibleInput {
            layer: self.name.clone(),
            shape: shape.dims().to_vec(),
            reason: reason.into(),
        }
        .into())
    }
}

/// The capability every layer variant implements.
pub trait Layer {
    /// Short type tag used for instance naming, e.g. `"dense"` becomes `dense1`.
    fn kind(&self) -> &'static str;

    /// Extends the graph from `input`, declaring any parameters, and returns
    /// the layer's output node. Must be pure given the layer configuration.
    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId>;
}
