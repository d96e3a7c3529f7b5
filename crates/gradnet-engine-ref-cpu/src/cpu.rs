//! Reference CPU tensor engine: naive kernels plus reverse-mode gradients.
//!
//! Correctness over speed. Every kernel is a direct loop over the logical
//! index space, which keeps the implementation auditable and makes this engine
//! the fixture the core crate's integration tests run against.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gradnet::engine::spec::{Bindings, ExecMode, ForwardArtifacts, TensorEngine};
use gradnet::graph::{ActivationKind, Graph, NodeId, OpKind, PoolKind, PoolingConvention};
use gradnet::tensor::{Context, DType, Shape, Tensor};
use gradnet::train::loss::Loss;

/// Single-threaded reference engine. Dropout masks draw from an internal
/// seeded RNG so runs are reproducible for a fixed seed.
pub struct CpuTensorEngine {
    rng: Mutex<StdRng>,
}

impl CpuTensorEngine {
    pub fn new() -> Self {
        Self::with_seed(0x6372_6566)
    }

    pub fn with_seed(seed: u64) -> Self {
        CpuTensorEngine {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for CpuTensorEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorEngine for CpuTensorEngine {
    fn create_tensor(&self, shape: &Shape, dtype: DType, ctx: Context) -> Result<Tensor> {
        let mut tensor = match dtype {
            DType::F32 => Tensor::zeros(shape.clone()),
            DType::I32 => Tensor::from_i32(shape.clone(), vec![0; shape.num_elements()])?,
        };
        tensor.set_ctx(ctx);
        Ok(tensor)
    }

    fn forward(
        &self,
        graph: &Graph,
        bindings: &Bindings,
        mode: ExecMode,
    ) -> Result<ForwardArtifacts> {
        let mut artifacts = ForwardArtifacts::new(graph.nodes().len());
        for id in graph.ids() {
            let node = graph.node(id);
            let value = match &node.op {
                OpKind::Input => {
                    let batch = bindings.get(&node.name)?;
                    let dims = batch.shape().dims();
                    ensure!(
                        dims.len() == node.shape.rank() + 1 && &dims[1..] == node.shape.dims(),
                        "input batch shape {:?} does not match graph input {:?}",
                        dims,
                        node.shape.dims()
                    );
                    batch.clone()
                }
                // Prediction-only execution binds no label; the label and loss
                // nodes are simply skipped.
                OpKind::Label => {
                    if !bindings.contains(&node.name) {
                        continue;
                    }
                    bindings.get(&node.name)?.clone()
                }
                OpKind::Parameter => bindings.get(&node.name)?.clone(),
                OpKind::FullyConnected { units } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let w = artifacts.value(node.inputs[1])?;
                    let b = match node.inputs.get(2) {
                        Some(&id) => Some(artifacts.value(id)?),
                        None => None,
                    };
                    fully_connected(x, w, b, *units)?
                }
                OpKind::Convolution {
                    kernel,
                    stride,
                    pad,
                    ..
                } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let w = artifacts.value(node.inputs[1])?;
                    let b = match node.inputs.get(2) {
                        Some(&id) => Some(artifacts.value(id)?),
                        None => None,
                    };
                    conv2d(x, w, b, *kernel, *stride, *pad)?
                }
                OpKind::Pooling {
                    kind,
                    window,
                    stride,
                    convention,
                    global,
                } => {
                    let x = artifacts.value(node.inputs[0])?;
                    if *global {
                        global_pool(x, *kind, &node.shape)?
                    } else {
                        pool2d(x, *kind, window, stride, *convention, &node.shape)?
                    }
                }
                OpKind::Flatten => {
                    let x = artifacts.value(node.inputs[0])?;
                    let n = x.shape().dims()[0];
                    x.reshape(node.shape.batched(n))?
                }
                OpKind::Dropout { rate } => {
                    let x = artifacts.value(node.inputs[0])?;
                    match mode {
                        ExecMode::Eval => x.clone(),
                        ExecMode::Train => {
                            let (out, mask) = self.dropout(x, *rate)?;
                            artifacts.save(id, mask);
                            out
                        }
                    }
                }
                OpKind::Activation { kind } => {
                    let x = artifacts.value(node.inputs[0])?;
                    activation(x, *kind)?
                }
                OpKind::Loss { loss } => {
                    let Some(label) = artifacts.try_value(node.inputs[1]) else {
                        continue;
                    };
                    let pred = artifacts.value(node.inputs[0])?;
                    let (value, saved) = loss_forward(pred, label, *loss)?;
                    if let Some(saved) = saved {
                        artifacts.save(id, saved);
                    }
                    value
                }
            };
            artifacts.set_value(id, value);
        }
        Ok(artifacts)
    }

    fn backward(
        &self,
        graph: &Graph,
        _bindings: &Bindings,
        artifacts: &ForwardArtifacts,
    ) -> Result<BTreeMap<String, Tensor>> {
        ensure!(
            artifacts.try_value(graph.loss()).is_some(),
            "backward requires a forward pass that evaluated the loss node"
        );

        let mut grads: Vec<Option<Vec<f32>>> = vec![None; graph.nodes().len()];
        grads[graph.loss().index()] = Some(vec![1.0]);

        for id in graph.ids().rev() {
            let node = graph.node(id);
            let Some(gy) = grads[id.index()].clone() else {
                continue;
            };
            match &node.op {
                OpKind::Input | OpKind::Label | OpKind::Parameter => {}
                OpKind::FullyConnected { .. } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let w = artifacts.value(node.inputs[1])?;
                    let (dx, dw, db) = fully_connected_backward(x, w, &gy)?;
                    add_grad(&mut grads, node.inputs[0], dx);
                    add_grad(&mut grads, node.inputs[1], dw);
                    if let Some(&bias) = node.inputs.get(2) {
                        add_grad(&mut grads, bias, db);
                    }
                }
                OpKind::Convolution {
                    kernel,
                    stride,
                    pad,
                    ..
                } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let w = artifacts.value(node.inputs[1])?;
                    let y = artifacts.value(id)?;
                    let (dx, dw, db) =
                        conv2d_backward(x, w, y.shape(), &gy, *kernel, *stride, *pad)?;
                    add_grad(&mut grads, node.inputs[0], dx);
                    add_grad(&mut grads, node.inputs[1], dw);
                    if let Some(&bias) = node.inputs.get(2) {
                        add_grad(&mut grads, bias, db);
                    }
                }
                OpKind::Pooling {
                    kind,
                    window,
                    stride,
                    convention,
                    global,
                } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let y = artifacts.value(id)?;
                    let dx = if *global {
                        global_pool_backward(x, *kind, &gy)?
                    } else {
                        pool2d_backward(x, y.shape(), *kind, window, stride, *convention, &gy)?
                    };
                    add_grad(&mut grads, node.inputs[0], dx);
                }
                OpKind::Flatten => {
                    add_grad(&mut grads, node.inputs[0], gy);
                }
                OpKind::Dropout { .. } => {
                    let dx = match artifacts.saved(id) {
                        Some(mask) => gy.iter().zip(mask.data()).map(|(g, m)| g * m).collect(),
                        None => gy,
                    };
                    add_grad(&mut grads, node.inputs[0], dx);
                }
                OpKind::Activation { kind } => {
                    let x = artifacts.value(node.inputs[0])?;
                    let y = artifacts.value(id)?;
                    let dx = activation_backward(x, y, *kind, &gy)?;
                    add_grad(&mut grads, node.inputs[0], dx);
                }
                OpKind::Loss { loss } => {
                    let pred = artifacts.value(node.inputs[0])?;
                    let label = artifacts.value(node.inputs[1])?;
                    let dpred = loss_backward(pred, label, *loss, artifacts.saved(id), gy[0])?;
                    add_grad(&mut grads, node.inputs[0], dpred);
                }
            }
        }

        let mut by_name = BTreeMap::new();
        for (id, name) in graph.parameter_nodes() {
            if let Some(grad) = grads[id.index()].take() {
                let shape = graph.node(id).shape.clone();
                by_name.insert(name.to_string(), Tensor::from_vec(shape, grad)?);
            }
        }
        Ok(by_name)
    }

    fn argmax_channel(&self, preds: &Tensor) -> Result<Tensor> {
        let dims = preds.shape().dims();
        ensure!(
            dims.len() == 2,
            "argmax_channel expects [batch, channels], got {:?}",
            dims
        );
        let (n, k) = (dims[0], dims[1]);
        let data = preds.data();
        let mut out = Vec::with_capacity(n);
        for row in 0..n {
            let slice = &data[row * k..(row + 1) * k];
            let mut best = 0usize;
            for (i, &v) in slice.iter().enumerate() {
                if v > slice[best] {
                    best = i;
                }
            }
            out.push(best as f32);
        }
        Tensor::from_vec(Shape::new([n]), out)
    }

    fn equal(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            lhs.shape() == rhs.shape(),
            "equal expects matching shapes, got {:?} vs {:?}",
            lhs.shape().dims(),
            rhs.shape().dims()
        );
        let a = as_f32(lhs);
        let b = as_f32(rhs);
        let out = a
            .iter()
            .zip(&b)
            .map(|(x, y)| if x == y { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(lhs.shape().clone(), out)
    }

    fn abs(&self, x: &Tensor) -> Result<Tensor> {
        let out = x.data().iter().map(|v| v.abs()).collect();
        Tensor::from_vec(x.shape().clone(), out)
    }

    fn sub(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            lhs.shape() == rhs.shape(),
            "sub expects matching shapes, got {:?} vs {:?}",
            lhs.shape().dims(),
            rhs.shape().dims()
        );
        let out = lhs
            .data()
            .iter()
            .zip(rhs.data())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(lhs.shape().clone(), out)
    }

    fn div(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            lhs.shape() == rhs.shape(),
            "div expects matching shapes, got {:?} vs {:?}",
            lhs.shape().dims(),
            rhs.shape().dims()
        );
        let out = lhs
            .data()
            .iter()
            .zip(rhs.data())
            .map(|(a, b)| a / b)
            .collect();
        Tensor::from_vec(lhs.shape().clone(), out)
    }

    fn mean(&self, x: &Tensor) -> Result<Tensor> {
        ensure!(!x.is_empty(), "mean of an empty tensor");
        let sum: f32 = x.data().iter().sum();
        Ok(Tensor::scalar_value(sum / x.len() as f32))
    }
}

impl CpuTensorEngine {
    /// Inverted dropout: kept elements are scaled by `1/(1-rate)` so the
    /// expectation is unchanged. Returns `(output, mask)`.
    fn dropout(&self, x: &Tensor, rate: f32) -> Result<(Tensor, Tensor)> {
        let keep_scale = 1.0 / (1.0 - rate);
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mask: Vec<f32> = (0..x.len())
            .map(|_| {
                if rng.gen::<f32>() < rate {
                    0.0
                } else {
                    keep_scale
                }
            })
            .collect();
        let out = x.data().iter().zip(&mask).map(|(v, m)| v * m).collect();
        Ok((
            Tensor::from_vec(x.shape().clone(), out)?,
            Tensor::from_vec(x.shape().clone(), mask)?,
        ))
    }
}

fn as_f32(t: &Tensor) -> Vec<f32> {
    match t.dtype() {
        DType::F32 => t.data().to_vec(),
        DType::I32 => t.data_i32().iter().map(|&v| v as f32).collect(),
    }
}

fn add_grad(grads: &mut [Option<Vec<f32>>], id: NodeId, contribution: Vec<f32>) {
    match &mut grads[id.index()] {
        Some(existing) => {
            for (e, c) in existing.iter_mut().zip(contribution) {
                *e += c;
            }
        }
        slot => *slot = Some(contribution),
    }
}

/// `y = x W^T + b`, flattening trailing input axes into the feature axis.
fn fully_connected(x: &Tensor, w: &Tensor, b: Option<&Tensor>, units: usize) -> Result<Tensor> {
    let n = x.shape().dims()[0];
    let in_units = w.shape().dims()[1];
    ensure!(
        x.len() == n * in_units,
        "fully connected input {:?} does not flatten to {} features",
        x.shape().dims(),
        in_units
    );
    ensure!(
        w.shape().dims() == [units, in_units],
        "fully connected weight shape {:?} does not match [{}, {}]",
        w.shape().dims(),
        units,
        in_units
    );
    let xd = x.data();
    let wd = w.data();
    let mut out = vec![0.0f32; n * units];
    for row in 0..n {
        for u in 0..units {
            let mut acc = match b {
                Some(bias) => bias.data()[u],
                None => 0.0,
            };
            let x_row = &xd[row * in_units..(row + 1) * in_units];
            let w_row = &wd[u * in_units..(u + 1) * in_units];
            for (xv, wv) in x_row.iter().zip(w_row) {
                acc += xv * wv;
            }
            out[row * units + u] = acc;
        }
    }
    Tensor::from_vec(Shape::new([n, units]), out)
}

fn fully_connected_backward(
    x: &Tensor,
    w: &Tensor,
    gy: &[f32],
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>)> {
    let n = x.shape().dims()[0];
    let [units, in_units] = [w.shape().dims()[0], w.shape().dims()[1]];
    let xd = x.data();
    let wd = w.data();

    let mut dx = vec![0.0f32; n * in_units];
    let mut dw = vec![0.0f32; units * in_units];
    let mut db = vec![0.0f32; units];
    for row in 0..n {
        for u in 0..units {
            let g = gy[row * units + u];
            if g == 0.0 {
                continue;
            }
            db[u] += g;
            for i in 0..in_units {
                dx[row * in_units + i] += g * wd[u * in_units + i];
                dw[u * in_units + i] += g * xd[row * in_units + i];
            }
        }
    }
    Ok((dx, dw, db))
}

/// Direct NCHW convolution.
fn conv2d(
    x: &Tensor,
    w: &Tensor,
    b: Option<&Tensor>,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
) -> Result<Tensor> {
    let xd = x.shape().dims();
    ensure!(
        xd.len() == 4,
        "conv2d expects [batch, channels, height, width], got {:?}",
        xd
    );
    let (n, c, h, wd_in) = (xd[0], xd[1], xd[2], xd[3]);
    let wdims = w.shape().dims();
    ensure!(
        wdims.len() == 4 && wdims[1] == c && wdims[2] == kernel[0] && wdims[3] == kernel[1],
        "conv2d weight shape {:?} incompatible with input {:?} and kernel {:?}",
        wdims,
        xd,
        kernel
    );
    let oc = wdims[0];
    let oh = (h + 2 * pad[0] - kernel[0]) / stride[0] + 1;
    let ow = (wd_in + 2 * pad[1] - kernel[1]) / stride[1] + 1;

    let xv = x.data();
    let wv = w.data();
    let mut out = vec![0.0f32; n * oc * oh * ow];
    for ni in 0..n {
        for oci in 0..oc {
            let bias = match b {
                Some(bias) => bias.data()[oci],
                None => 0.0,
            };
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias;
                    for ci in 0..c {
                        for ky in 0..kernel[0] {
                            let iy = oy * stride[0] + ky;
                            if iy < pad[0] || iy - pad[0] >= h {
                                continue;
                            }
                            for kx in 0..kernel[1] {
                                let ix = ox * stride[1] + kx;
                                if ix < pad[1] || ix - pad[1] >= wd_in {
                                    continue;
                                }
                                let x_idx = ((ni * c + ci) * h + (iy - pad[0])) * wd_in
                                    + (ix - pad[1]);
                                let w_idx = ((oci * c + ci) * kernel[0] + ky) * kernel[1] + kx;
                                acc += xv[x_idx] * wv[w_idx];
                            }
                        }
                    }
                    out[((ni * oc + oci) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Tensor::from_vec(Shape::new([n, oc, oh, ow]), out)
}

#[allow(clippy::too_many_arguments)]
fn conv2d_backward(
    x: &Tensor,
    w: &Tensor,
    y_shape: &Shape,
    gy: &[f32],
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>)> {
    let xd = x.shape().dims();
    let (n, c, h, wd_in) = (xd[0], xd[1], xd[2], xd[3]);
    let od = y_shape.dims();
    let (oc, oh, ow) = (od[1], od[2], od[3]);

    let xv = x.data();
    let wv = w.data();
    let mut dx = vec![0.0f32; x.len()];
    let mut dw = vec![0.0f32; w.len()];
    let mut db = vec![0.0f32; oc];
    for ni in 0..n {
        for oci in 0..oc {
            for oy in 0..oh {
                for ox in 0..ow {
                    let g = gy[((ni * oc + oci) * oh + oy) * ow + ox];
                    if g == 0.0 {
                        continue;
                    }
                    db[oci] += g;
                    for ci in 0..c {
                        for ky in 0..kernel[0] {
                            let iy = oy * stride[0] + ky;
                            if iy < pad[0] || iy - pad[0] >= h {
                                continue;
                            }
                            for kx in 0..kernel[1] {
                                let ix = ox * stride[1] + kx;
                                if ix < pad[1] || ix - pad[1] >= wd_in {
                                    continue;
                                }
                                let x_idx = ((ni * c + ci) * h + (iy - pad[0])) * wd_in
                                    + (ix - pad[1]);
                                let w_idx = ((oci * c + ci) * kernel[0] + ky) * kernel[1] + kx;
                                dx[x_idx] += g * wv[w_idx];
                                dw[w_idx] += g * xv[x_idx];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((dx, dw, db))
}

/// Windowed pooling over NCHW input. `Full` convention windows may overhang
/// the edge; they are clipped, and averages divide by the clipped count.
fn pool2d(
    x: &Tensor,
    kind: PoolKind,
    window: &[usize],
    stride: &[usize],
    _convention: PoolingConvention,
    out_feature_shape: &Shape,
) -> Result<Tensor> {
    let xd = x.shape().dims();
    ensure!(
        xd.len() == 4,
        "pool2d expects [batch, channels, height, width], got {:?}",
        xd
    );
    let (n, c, h, w) = (xd[0], xd[1], xd[2], xd[3]);
    let od = out_feature_shape.dims();
    let (oh, ow) = (od[1], od[2]);

    let xv = x.data();
    let mut out = vec![0.0f32; n * c * oh * ow];
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let y0 = oy * stride[0];
                    let x0 = ox * stride[1];
                    let y1 = (y0 + window[0]).min(h);
                    let x1 = (x0 + window[1]).min(w);
                    let mut acc = match kind {
                        PoolKind::Max => f32::NEG_INFINITY,
                        PoolKind::Avg => 0.0,
                    };
                    for iy in y0..y1 {
                        for ix in x0..x1 {
                            let v = xv[((ni * c + ci) * h + iy) * w + ix];
                            match kind {
                                PoolKind::Max => acc = acc.max(v),
                                PoolKind::Avg => acc += v,
                            }
                        }
                    }
                    if kind == PoolKind::Avg {
                        acc /= ((y1 - y0) * (x1 - x0)) as f32;
                    }
                    out[((ni * c + ci) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Tensor::from_vec(Shape::new([n, c, oh, ow]), out)
}

fn pool2d_backward(
    x: &Tensor,
    y_shape: &Shape,
    kind: PoolKind,
    window: &[usize],
    stride: &[usize],
    _convention: PoolingConvention,
    gy: &[f32],
) -> Result<Vec<f32>> {
    let xd = x.shape().dims();
    let (n, c, h, w) = (xd[0], xd[1], xd[2], xd[3]);
    let od = y_shape.dims();
    let (oh, ow) = (od[2], od[3]);

    let xv = x.data();
    let mut dx = vec![0.0f32; x.len()];
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let g = gy[((ni * c + ci) * oh + oy) * ow + ox];
                    if g == 0.0 {
                        continue;
                    }
                    let y0 = oy * stride[0];
                    let x0 = ox * stride[1];
                    let y1 = (y0 + window[0]).min(h);
                    let x1 = (x0 + window[1]).min(w);
                    match kind {
                        PoolKind::Max => {
                            let mut best = (y0, x0);
                            let mut best_v = f32::NEG_INFINITY;
                            for iy in y0..y1 {
                                for ix in x0..x1 {
                                    let v = xv[((ni * c + ci) * h + iy) * w + ix];
                                    if v > best_v {
                                        best_v = v;
                                        best = (iy, ix);
                                    }
                                }
                            }
                            dx[((ni * c + ci) * h + best.0) * w + best.1] += g;
                        }
                        PoolKind::Avg => {
                            let share = g / ((y1 - y0) * (x1 - x0)) as f32;
                            for iy in y0..y1 {
                                for ix in x0..x1 {
                                    dx[((ni * c + ci) * h + iy) * w + ix] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(dx)
}

/// Reduces every spatial position of each channel to a single value.
fn global_pool(x: &Tensor, kind: PoolKind, out_feature_shape: &Shape) -> Result<Tensor> {
    let xd = x.shape().dims();
    ensure!(
        xd.len() >= 3,
        "global pooling expects at least [batch, channels, spatial...], got {:?}",
        xd
    );
    let (n, c) = (xd[0], xd[1]);
    let spatial: usize = xd[2..].iter().product();
    ensure!(spatial > 0, "global pooling over an empty spatial extent");

    let xv = x.data();
    let mut out = vec![0.0f32; n * c];
    for ni in 0..n {
        for ci in 0..c {
            let base = (ni * c + ci) * spatial;
            let plane = &xv[base..base + spatial];
            out[ni * c + ci] = match kind {
                PoolKind::Max => plane.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
                PoolKind::Avg => plane.iter().sum::<f32>() / spatial as f32,
            };
        }
    }
    Tensor::from_vec(out_feature_shape.batched(n), out)
}

fn global_pool_backward(x: &Tensor, kind: PoolKind, gy: &[f32]) -> Result<Vec<f32>> {
    let xd = x.shape().dims();
    let (n, c) = (xd[0], xd[1]);
    let spatial: usize = xd[2..].iter().product();

    let xv = x.data();
    let mut dx = vec![0.0f32; x.len()];
    for ni in 0..n {
        for ci in 0..c {
            let g = gy[ni * c + ci];
            let base = (ni * c + ci) * spatial;
            match kind {
                PoolKind::Max => {
                    let plane = &xv[base..base + spatial];
                    let mut best = 0usize;
                    for (i, &v) in plane.iter().enumerate() {
                        if v > plane[best] {
                            best = i;
                        }
                    }
                    dx[base + best] += g;
                }
                PoolKind::Avg => {
                    let share = g / spatial as f32;
                    for slot in &mut dx[base..base + spatial] {
                        *slot += share;
                    }
                }
            }
        }
    }
    Ok(dx)
}

fn activation(x: &Tensor, kind: ActivationKind) -> Result<Tensor> {
    let data = x.data();
    let out = match kind {
        ActivationKind::Relu => data.iter().map(|&v| v.max(0.0)).collect(),
        ActivationKind::Sigmoid => data.iter().map(|&v| 1.0 / (1.0 + (-v).exp())).collect(),
        ActivationKind::Tanh => data.iter().map(|&v| v.tanh()).collect(),
        ActivationKind::Softmax => {
            let k = *x.shape().dims().last().expect("non-empty shape");
            let mut out = vec![0.0f32; data.len()];
            for (row_in, row_out) in data.chunks_exact(k).zip(out.chunks_exact_mut(k)) {
                softmax_row(row_in, row_out);
            }
            out
        }
    };
    Tensor::from_vec(x.shape().clone(), out)
}

fn activation_backward(
    x: &Tensor,
    y: &Tensor,
    kind: ActivationKind,
    gy: &[f32],
) -> Result<Vec<f32>> {
    let out = match kind {
        ActivationKind::Relu => x
            .data()
            .iter()
            .zip(gy)
            .map(|(&xv, &g)| if xv > 0.0 { g } else { 0.0 })
            .collect(),
        ActivationKind::Sigmoid => y
            .data()
            .iter()
            .zip(gy)
            .map(|(&yv, &g)| g * yv * (1.0 - yv))
            .collect(),
        ActivationKind::Tanh => y
            .data()
            .iter()
            .zip(gy)
            .map(|(&yv, &g)| g * (1.0 - yv * yv))
            .collect(),
        ActivationKind::Softmax => {
            let k = *y.shape().dims().last().expect("non-empty shape");
            let yd = y.data();
            let mut out = vec![0.0f32; yd.len()];
            for row in 0..yd.len() / k {
                let ys = &yd[row * k..(row + 1) * k];
                let gs = &gy[row * k..(row + 1) * k];
                let dot: f32 = ys.iter().zip(gs).map(|(a, b)| a * b).sum();
                for i in 0..k {
                    out[row * k + i] = ys[i] * (gs[i] - dot);
                }
            }
            out
        }
    };
    Ok(out)
}

fn softmax_row(row_in: &[f32], row_out: &mut [f32]) {
    let max = row_in.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (o, &v) in row_out.iter_mut().zip(row_in) {
        let e = (v - max).exp();
        *o = e;
        sum += e;
    }
    let inv = 1.0 / sum.max(f32::MIN_POSITIVE);
    for o in row_out.iter_mut() {
        *o *= inv;
    }
}

/// Scalar loss over the batch. Cross-entropy returns the per-row softmax
/// probabilities as saved state for backward.
fn loss_forward(pred: &Tensor, label: &Tensor, loss: Loss) -> Result<(Tensor, Option<Tensor>)> {
    match loss {
        Loss::CategoricalCrossEntropy => {
            let dims = pred.shape().dims();
            ensure!(
                dims.len() == 2,
                "cross entropy expects [batch, classes] logits, got {:?}",
                dims
            );
            let (n, k) = (dims[0], dims[1]);
            let labels = as_f32(label);
            ensure!(
                labels.len() == n,
                "cross entropy expects one label per row: {} labels for {} rows",
                labels.len(),
                n
            );
            let logits = pred.data();
            let mut probs = vec![0.0f32; n * k];
            let mut total = 0.0f32;
            for row in 0..n {
                let row_in = &logits[row * k..(row + 1) * k];
                let row_out = &mut probs[row * k..(row + 1) * k];
                softmax_row(row_in, row_out);
                let target = labels[row] as usize;
                ensure!(
                    target < k,
                    "label {} out of range for {} classes",
                    target,
                    k
                );
                total -= row_out[target].max(f32::MIN_POSITIVE).ln();
            }
            let value = Tensor::scalar_value(total / n as f32);
            let saved = Tensor::from_vec(pred.shape().clone(), probs)?;
            Ok((value, Some(saved)))
        }
        Loss::MeanSquaredError => {
            let labels = label.reshape(pred.shape().clone())?;
            let total: f32 = pred
                .data()
                .iter()
                .zip(labels.data())
                .map(|(p, l)| (p - l) * (p - l))
                .sum();
            Ok((Tensor::scalar_value(total / pred.len() as f32), None))
        }
        Loss::MeanAbsoluteError => {
            let labels = label.reshape(pred.shape().clone())?;
            let total: f32 = pred
                .data()
                .iter()
                .zip(labels.data())
                .map(|(p, l)| (p - l).abs())
                .sum();
            Ok((Tensor::scalar_value(total / pred.len() as f32), None))
        }
    }
}

fn loss_backward(
    pred: &Tensor,
    label: &Tensor,
    loss: Loss,
    saved: Option<&Tensor>,
    gy: f32,
) -> Result<Vec<f32>> {
    match loss {
        Loss::CategoricalCrossEntropy => {
            let dims = pred.shape().dims();
            let (n, k) = (dims[0], dims[1]);
            let probs = saved
                .ok_or_else(|| anyhow!("cross entropy backward is missing saved probabilities"))?
                .data();
            let labels = as_f32(label);
            let scale = gy / n as f32;
            let mut dpred = vec![0.0f32; n * k];
            for row in 0..n {
                let target = labels[row] as usize;
                for i in 0..k {
                    let indicator = if i == target { 1.0 } else { 0.0 };
                    dpred[row * k + i] = scale * (probs[row * k + i] - indicator);
                }
            }
            Ok(dpred)
        }
        Loss::MeanSquaredError => {
            let labels = label.reshape(pred.shape().clone())?;
            let scale = gy * 2.0 / pred.len() as f32;
            Ok(pred
                .data()
                .iter()
                .zip(labels.data())
                .map(|(p, l)| scale * (p - l))
                .collect())
        }
        Loss::MeanAbsoluteError => {
            let labels = label.reshape(pred.shape().clone())?;
            let scale = gy / pred.len() as f32;
            Ok(pred
                .data()
                .iter()
                .zip(labels.data())
                .map(|(p, l)| scale * (p - l).signum())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_connected_matches_hand_computation() {
        // x = [[1, 2]], W = [[1, 0], [0, 1], [1, 1]], b = [0.5, 0.5, 0.5]
        let x = Tensor::from_vec(Shape::new([1, 2]), vec![1.0, 2.0]).unwrap();
        let w = Tensor::from_vec(Shape::new([3, 2]), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let b = Tensor::from_vec(Shape::new([3]), vec![0.5; 3]).unwrap();
        let y = fully_connected(&x, &w, Some(&b), 3).unwrap();
        assert_eq!(y.data(), &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn max_pool_routes_gradient_to_argmax() {
        let x = Tensor::from_vec(
            Shape::new([1, 1, 2, 2]),
            vec![1.0, 3.0, 2.0, 0.0],
        )
        .unwrap();
        let y_shape = Shape::new([1, 1, 1, 1]);
        let dx = pool2d_backward(
            &x,
            &y_shape,
            PoolKind::Max,
            &[2, 2],
            &[2, 2],
            PoolingConvention::Valid,
            &[1.0],
        )
        .unwrap();
        assert_eq!(dx, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn cross_entropy_gradient_sums_to_zero_per_row() {
        let pred = Tensor::from_vec(Shape::new([2, 3]), vec![0.2, 0.5, 0.1, 1.0, -1.0, 0.0])
            .unwrap();
        let label = Tensor::from_vec(Shape::new([2]), vec![1.0, 0.0]).unwrap();
        let (value, saved) = loss_forward(&pred, &label, Loss::CategoricalCrossEntropy).unwrap();
        assert!(value.scalar().unwrap() > 0.0);
        let dpred =
            loss_backward(&pred, &label, Loss::CategoricalCrossEntropy, saved.as_ref(), 1.0)
                .unwrap();
        for row in dpred.chunks_exact(3) {
            let sum: f32 = row.iter().sum();
            assert!(sum.abs() < 1e-6);
        }
    }
}
