//! Fully connected layer `y = x W^T + b`, flattening any trailing input axes.

use anyhow::Result;

use crate::error::ConfigError;
use crate::graph::{ActivationKind, NodeId, OpKind};
use crate::init::Initializer;
use crate::nn::layers::{BuildContext, Layer};
use crate::params::ParamSpec;
use crate::tensor::Shape;

pub struct Dense {
    units: usize,
    activation: Option<ActivationKind>,
    init: Option<Initializer>,
    bias: bool,
}

impl Dense {
    pub fn new(units: usize) -> Self {
        Dense {
            units,
            activation: None,
            init: None,
            bias: true,
        }
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = Some(init);
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

impl Layer for Dense {
    fn kind(&self) -> &'static str {
        "dense"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        if self.units == 0 {
            return Err(ConfigError::InvalidLayer {
                layer: ctx.layer_name().to_string(),
                reason: "unit count must be positive".to_string(),
            }
            .into());
        }
        let in_units = ctx.shape_of(input).num_elements();

        let weight = ctx.declare_param(
            "weight",
            ParamSpec {
                shape: Some(Shape::new([self.units, in_units])),
                init: self.init.clone(),
                ..Default::default()
            },
        )?;
        let mut inputs = vec![input, weight];
        if self.bias {
            let bias = ctx.declare_param(
                "bias",
                ParamSpec {
                    shape: Some(Shape::new([self.units])),
                    init: Some(Initializer::Zeros),
                    ..Default::default()
                },
            )?;
            inputs.push(bias);
        }

        let out = ctx.add_op(
            OpKind::FullyConnected { units: self.units },
            &inputs,
            Shape::new([self.units]),
        )?;
        match self.activation {
            Some(kind) => ctx.add_suffixed(
                "act",
                OpKind::Activation { kind },
                &[out],
                Shape::new([self.units]),
            ),
            None => Ok(out),
        }
    }
}
