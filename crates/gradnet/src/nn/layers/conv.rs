//! 2D convolution layer over channel-first (C, H, W) feature maps.

use anyhow::Result;

use crate::error::ConfigError;
use crate::graph::{ActivationKind, ConvPadding, NodeId, OpKind};
use crate::init::Initializer;
use crate::nn::layers::{BuildContext, Layer};
use crate::nn::shape::conv_output;
use crate::params::ParamSpec;
use crate::tensor::Shape;

pub struct Conv2d {
    channels: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: ConvPadding,
    activation: Option<ActivationKind>,
    init: Option<Initializer>,
    bias: bool,
}

impl Conv2d {
    pub fn new(channels: usize, kernel: [usize; 2]) -> Self {
        Conv2d {
            channels,
            kernel,
            stride: [1, 1],
            padding: ConvPadding::Valid,
            activation: None,
            init: None,
            bias: true,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: ConvPadding) -> Self {
        self.padding = padding;
        self
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

impl Layer for Conv2d {
    fn kind(&self) -> &'static str {
        "conv2d"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        let in_shape = ctx.shape_of(input).clone();
        if in_shape.rank() != 3 {
            return ctx.incompatible_input(&in_shape, "conv2d expects (channels, height, width)");
        }
        let [kh, kw] = self.kernel;
        let pad = match self.padding {
            ConvPadding::Valid => [0, 0],
            ConvPadding::Same => {
                if kh % 2 == 0 || kw % 2 == 0 {
                    return Err(ConfigError::InvalidLayer {
                        layer: ctx.layer_name().to_string(),
                        reason: format!("same padding requires odd kernels, got {kh}x{kw}"),
                    }
                    .into());
                }
                [(kh - 1) / 2, (kw - 1) / 2]
            }
        };

        let dims = in_shape.dims();
        let (in_channels, in_h, in_w) = (dims[0], dims[1], dims[2]);
        let out_h = match conv_output(in_h, kh, pad[0], self.stride[0]) {
            Ok(extent) => extent,
            Err(err) => return ctx.incompatible_input(&in_shape, err.to_string()),
        };
        let out_w = match conv_output(in_w, kw, pad[1], self.stride[1]) {
            Ok(extent) => extent,
            Err(err) => return ctx.incompatible_input(&in_shape, err.to_string()),
        };

        let weight = ctx.declare_param(
            "weight",
            ParamSpec {
                shape: Some(Shape::new([self.channels, in_channels, kh, kw])),
                init: self.init.clone(),
                ..Default::default()
            },
        )?;
        let mut inputs = vec![input, weight];
        if self.bias {
            let bias = ctx.declare_param(
                "bias",
                ParamSpec {
                    shape: Some(Shape::new([self.channels])),
                    init: Some(Initializer::Zeros),
                    ..Default::default()
                },
            )?;
            inputs.push(bias);
        }

        let out_shape = Shape::new([self.channels, out_h, out_w]);
        let out = ctx.add_op(
            OpKind::Convolution {
                channels: self.channels,
                kernel: self.kernel,
                stride: self.stride,
                pad,
            },
            &inputs,
            out_shape.clone(),
        )?;
        match self.activation {
            Some(kind) => {
                ctx.add_suffixed("act", OpKind::Activation { kind }, &[out], out_shape)
            }
            None => Ok(out),
        }
    }
}
