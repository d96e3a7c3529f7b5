//! Collapses every feature axis into one.

use anyhow::Result;

use crate::graph::{NodeId, OpKind};
use crate::nn::layers::{BuildContext, Layer};
use crate::tensor::Shape;

#[derive(Default)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Flatten
    }
}

impl Layer for Flatten {
    fn kind(&self) -> &'static str {
        "flatten"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        let len = ctx.shape_of(input).num_elements();
        ctx.add_op(OpKind::Flatten, &[input], Shape::new([len]))
    }
}
