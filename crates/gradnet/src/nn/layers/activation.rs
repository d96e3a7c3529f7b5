//! Standalone activation layer for nonlinearity between parameterized layers.

use anyhow::Result;

use crate::graph::{ActivationKind, NodeId, OpKind};
use crate::nn::layers::{BuildContext, Layer};

pub struct Activation {
    kind: ActivationKind,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Activation { kind }
    }
}

impl Layer for Activation {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        let shape = ctx.shape_of(input).clone();
        ctx.add_op(OpKind::Activation { kind: self.kind }, &[input], shape)
    }
}
