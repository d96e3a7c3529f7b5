//! Windowed and global pooling layers over channel-first feature maps.

use anyhow::Result;

use crate::graph::{NodeId, OpKind, PoolKind, PoolingConvention};
use crate::nn::layers::{BuildContext, Layer};
use crate::nn::shape::pool_output;
use crate::tensor::Shape;

fn build_pool2d(
    ctx: &mut BuildContext<'_>,
    input: NodeId,
    kind: PoolKind,
    window: [usize; 2],
    stride: [usize; 2],
    convention: PoolingConvention,
) -> Result<NodeId> {
    let in_shape = ctx.shape_of(input).clone();
    if in_shape.rank() != 3 {
        return ctx.incompatible_input(&in_shape, "2D pooling expects (channels, height, width)");
    }
    let dims = in_shape.dims();
    let out_h = match pool_output(dims[1], window[0], stride[0], convention) {
        Ok(extent) => extent,
        Err(err) => return ctx.incompatible_input(&in_shape, err.to_string()),
    };
    let out_w = match pool_output(dims[2], window[1], stride[1], convention) {
        Ok(extent) => extent,
        Err(err) => return ctx.incompatible_input(&in_shape, err.to_string()),
    };
    ctx.add_op(
        OpKind::Pooling {
            kind,
            window: window.to_vec(),
            stride: stride.to_vec(),
            convention,
            global: false,
        },
        &[input],
        Shape::new([dims[0], out_h, out_w]),
    )
}

/// Collapses every spatial axis to extent 1, keeping the channel axis.
fn build_global_pool(
    ctx: &mut BuildContext<'_>,
    input: NodeId,
    kind: PoolKind,
    spatial_rank: usize,
) -> Result<NodeId> {
    let in_shape = ctx.shape_of(input).clone();
    if in_shape.rank() != spatial_rank + 1 {
        return ctx.incompatible_input(
            &in_shape,
            format!(
                "global {spatial_rank}D pooling expects channels plus {spatial_rank} spatial axes"
            ),
        );
    }
    let mut out_dims = vec![in_shape.dims()[0]];
    out_dims.extend(std::iter::repeat(1).take(spatial_rank));
    ctx.add_op(
        OpKind::Pooling {
            kind,
            window: Vec::new(),
            stride: Vec::new(),
            convention: PoolingConvention::Valid,
            global: true,
        },
        &[input],
        Shape::new(out_dims),
    )
}

pub struct MaxPooling2d {
    window: [usize; 2],
    stride: [usize; 2],
    convention: PoolingConvention,
}

impl MaxPooling2d {
    pub fn new(window: [usize; 2], stride: [usize; 2]) -> Self {
        MaxPooling2d {
            window,
            stride,
            convention: PoolingConvention::Valid,
        }
    }

    pub fn with_convention(mut self, convention: PoolingConvention) -> Self {
        self.convention = convention;
        self
    }
}

impl Layer for MaxPooling2d {
    fn kind(&self) -> &'static str {
        "maxpool2d"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        build_pool2d(
            ctx,
            input,
            PoolKind::Max,
            self.window,
            self.stride,
            self.convention,
        )
    }
}

pub struct AvgPooling2d {
    window: [usize; 2],
    stride: [usize; 2],
    convention: PoolingConvention,
}

impl AvgPooling2d {
    pub fn new(window: [usize; 2], stride: [usize; 2]) -> Self {
        AvgPooling2d {
            window,
            stride,
            convention: PoolingConvention::Valid,
        }
    }

    pub fn with_convention(mut self, convention: PoolingConvention) -> Self {
        self.convention = convention;
        self
    }
}

impl Layer for AvgPooling2d {
    fn kind(&self) -> &'static str {
        "avgpool2d"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        build_pool2d(
            ctx,
            input,
            PoolKind::Avg,
            self.window,
            self.stride,
            self.convention,
        )
    }
}

pub struct GlobalPooling2d {
    kind: PoolKind,
}

impl GlobalPooling2d {
    pub fn new(kind: PoolKind) -> Self {
        GlobalPooling2d { kind }
    }
}

impl Layer for GlobalPooling2d {
    fn kind(&self) -> &'static str {
        "globalpool2d"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        build_global_pool(ctx, input, self.kind, 2)
    }
}

pub struct GlobalPooling3d {
    kind: PoolKind,
}

impl GlobalPooling3d {
    pub fn new(kind: PoolKind) -> Self {
        GlobalPooling3d { kind }
    }
}

impl Layer for GlobalPooling3d {
    fn kind(&self) -> &'static str {
        "globalpool3d"
    }

    fn build(&self, ctx: &mut BuildContext<'_>, input: NodeId) -> Result<NodeId> {
        build_global_pool(ctx, input, self.kind, 3)
    }
}
