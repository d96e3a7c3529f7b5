//! Inverted dropout; live in training mode, identity in evaluation.

use anyhow::Result;

use crate::error::ConfigError;
use crate::graph::{NodeId, OpKind};
use crate::nn::layers::{BuildContext, Layer};

pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Dropout { rate }
    }
}

impl Layer for Dropout {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        if !(0.0..1.0).contains(&self.rate) {
            return Err(ConfigError::InvalidLayer {
                layer: ctx.layer_name().to_string(),
                reason: format!("drop probability must be in [0, 1), got {}", self.rate),
            }
            .into());
        }
        let shape = ctx.shape_of(input).clone();
        ctx.add_op(OpKind::Dropout { rate: self.rate }, &[input], shape)
    }
}
