//! Arena-backed symbolic computation graph assembled from composed layers.
//!
//! Nodes are appended by `GraphBuilder` during compile and frozen into a `Graph`.
//! Because an operation may only reference nodes that already exist, the arena
//! order is a valid topological order and cycles cannot be expressed.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::tensor::Shape;
use crate::train::loss::Loss;

/// Index of a node inside its owning graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Nonlinearity applied by activation nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

/// Reduction applied inside a pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

/// Edge handling for pooling output arithmetic.
///
/// `Valid` floors the output extent; `Full` ceils it, letting the final window
/// overhang the input edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingConvention {
    Valid,
    Full,
}

/// Spatial padding policy for convolution layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPadding {
    /// No padding; output spatial extent shrinks by `kernel - 1`.
    Valid,
    /// Pads so that stride-1 output matches the input extent. Requires odd kernels.
    Same,
}

/// Operation performed by a graph node, with its operation-specific attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// The model's input placeholder, bound per batch.
    Input,
    /// The label placeholder consumed by the loss node.
    Label,
    /// A trainable or constant tensor registered in the parameter store under
    /// the node's name.
    Parameter,
    FullyConnected {
        units: usize,
    },
    Convolution {
        channels: usize,
        kernel: [usize; 2],
        stride: [usize; 2],
        /// Symmetric spatial padding resolved from the layer's padding policy.
        pad: [usize; 2],
    },
    Pooling {
        kind: PoolKind,
        window: Vec<usize>,
        stride: Vec<usize>,
        convention: PoolingConvention,
        /// Pool over the whole spatial extent, ignoring `window`/`stride`.
        global: bool,
    },
    Flatten,
    Dropout {
        rate: f32,
    },
    Activation {
        kind: ActivationKind,
    },
    Loss {
        loss: Loss,
    },
}

/// A single named operation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<NodeId>,
    /// Per-example (batch-free) output shape, resolved during shape inference.
    pub shape: Shape,
}

/// Mutable graph under construction. Consumed by [`GraphBuilder::finish`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node, rejecting duplicate names. Inputs must already exist in
    /// the arena, which keeps the node list topologically ordered by construction.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: &[NodeId],
        shape: Shape,
    ) -> Result<NodeId> {
        let name = name.into();
        ensure!(
            !self.by_name.contains_key(&name),
            "graph already contains a node named '{name}'"
        );
        for input in inputs {
            ensure!(
                input.0 < self.nodes.len(),
                "node '{name}' references an unknown input"
            );
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.clone(),
            op,
            inputs: inputs.to_vec(),
            shape,
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Returns the per-example output shape of an already-added node.
    pub fn shape_of(&self, id: NodeId) -> &Shape {
        &self.nodes[id.0].shape
    }

    /// Freezes the arena into an immutable graph.
    pub fn finish(self, input: NodeId, label: NodeId, prediction: NodeId, loss: NodeId) -> Graph {
        Graph {
            nodes: self.nodes,
            by_name: self.by_name,
            input,
            label,
            prediction,
            loss,
        }
    }
}

/// Immutable symbolic graph: the compiled form of a layer sequence.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    input: NodeId,
    label: NodeId,
    prediction: NodeId,
    loss: NodeId,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Nodes in arena (topological) order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node ids in arena (topological) order.
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn label(&self) -> NodeId {
        self.label
    }

    /// The node whose output is reported as the model's prediction.
    pub fn prediction(&self) -> NodeId {
        self.prediction
    }

    /// The scalar loss node appended at compile time.
    pub fn loss(&self) -> NodeId {
        self.loss
    }

    /// Iterates `(id, qualified parameter name)` for every parameter node.
    pub fn parameter_nodes(&self) -> impl Iterator<Item = (NodeId, &str)> {
        self.nodes.iter().enumerate().filter_map(|(i, node)| {
            matches!(node.op, OpKind::Parameter).then(|| (NodeId(i), node.name.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add("data", OpKind::Input, &[], Shape::new([4]))
            .unwrap();
        let err = builder
            .add("data", OpKind::Input, &[], Shape::new([4]))
            .unwrap_err();
        assert!(err.to_string().contains("data"));
    }
}
