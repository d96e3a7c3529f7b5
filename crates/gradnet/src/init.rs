//! Initialization policies for parameter tensors.
//!
//! Every policy draws from a caller-supplied seeded RNG, so a fixed seed gives
//! bit-identical tensors no matter where the parameter sits in the store.

use rand::rngs::StdRng;
use rand::Rng;

use crate::tensor::{Shape, Tensor};

/// Closed set of initialization distributions.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    /// Uniform on `[-scale, scale]`.
    Uniform { scale: f32 },
    /// Gaussian `N(0, sigma^2)`.
    Normal { sigma: f32 },
    /// Glorot/Xavier uniform: `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    Zeros,
    Ones,
    Constant { value: f32 },
}

impl Default for Initializer {
    /// The store-wide default applied when neither the parameter nor the
    /// `initialize` call names a policy.
    fn default() -> Self {
        Initializer::Uniform { scale: 0.07 }
    }
}

impl Initializer {
    /// Materializes a tensor of the given shape from this policy.
    pub fn generate(&self, shape: &Shape, rng: &mut StdRng) -> Tensor {
        let len = shape.num_elements();
        match self {
            Initializer::Uniform { scale } => {
                let values = (0..len)
                    .map(|_| rng.gen_range(-*scale..=*scale))
                    .collect::<Vec<f32>>();
                Tensor::from_vec(shape.clone(), values).expect("generated length matches shape")
            }
            Initializer::Normal { sigma } => {
                let values = sample_normal(len, *sigma, rng);
                Tensor::from_vec(shape.clone(), values).expect("generated length matches shape")
            }
            Initializer::GlorotUniform => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                let values = (0..len)
                    .map(|_| rng.gen_range(-limit..=limit))
                    .collect::<Vec<f32>>();
                Tensor::from_vec(shape.clone(), values).expect("generated length matches shape")
            }
            Initializer::Zeros => Tensor::zeros(shape.clone()),
            Initializer::Ones => Tensor::ones(shape.clone()),
            Initializer::Constant { value } => Tensor::full(shape.clone(), *value),
        }
    }
}

/// Fan-in/fan-out for a weight shape.
///
/// Rank-2 `[out, in]` reads directly; convolution kernels `[out, in, k...]`
/// multiply the receptive field into both fans; rank-1 treats the single axis
/// as both.
fn fans(shape: &Shape) -> (usize, usize) {
    let dims = shape.dims();
    match dims.len() {
        1 => (dims[0], dims[0]),
        2 => (dims[1], dims[0]),
        _ => {
            let receptive: usize = dims[2..].iter().product();
            (dims[1] * receptive, dims[0] * receptive)
        }
    }
}

/// Box-Muller sampling, two draws per iteration.
fn sample_normal(len: usize, sigma: f32, rng: &mut StdRng) -> Vec<f32> {
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.gen::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        values.push(r * theta.cos() * sigma);
        if values.len() < len {
            values.push(r * theta.sin() * sigma);
        }
    }
    values
}

/// Derives a per-parameter RNG seed from the store seed and the qualified name.
///
/// Hashing the name keeps initialization independent of registration order.
pub(crate) fn param_seed(store_seed: u64, name: &str) -> u64 {
    let hash = blake3::hash(name.as_bytes());
    let raw: [u8; 8] = hash.as_bytes()[0..8]
        .try_into()
        .expect("blake3 hash prefix length mismatch");
    store_seed ^ u64::from_le_bytes(raw)
}
