//! Optimizer update rules with per-parameter state keyed by qualified name.
//!
//! An update is a pure function of (old value, gradient, slot state), so two
//! optimizers fed identical inputs produce identical parameters.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::tensor::Tensor;

/// Per-parameter learning-rate and weight-decay multipliers.
#[derive(Debug, Clone, Copy)]
pub struct ParamMults {
    pub lr_mult: f32,
    pub wd_mult: f32,
}

impl Default for ParamMults {
    fn default() -> Self {
        ParamMults {
            lr_mult: 1.0,
            wd_mult: 1.0,
        }
    }
}

/// Stateful update rule mapping (parameter, gradient) to a new parameter value.
pub trait Optimizer {
    fn name(&self) -> &'static str;

    /// Applies one update step in place. `name` keys the optimizer's auxiliary
    /// state, which is created lazily on first use.
    fn update(
        &mut self,
        name: &str,
        value: &mut Tensor,
        grad: &Tensor,
        mults: ParamMults,
    ) -> Result<()>;
}

fn check_shapes(name: &str, value: &Tensor, grad: &Tensor) -> Result<()> {
    ensure!(
        value.shape() == grad.shape(),
        "optimizer update for '{}': value shape {:?} vs gradient shape {:?}",
        name,
        value.shape().dims(),
        grad.shape().dims()
    );
    Ok(())
}

/// Stochastic gradient descent with optional momentum and coupled weight decay.
pub struct Sgd {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: HashMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Sgd {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn update(
        &mut self,
        name: &str,
        value: &mut Tensor,
        grad: &Tensor,
        mults: ParamMults,
    ) -> Result<()> {
        check_shapes(name, value, grad)?;
        let lr = self.lr * mults.lr_mult;
        let wd = self.weight_decay * mults.wd_mult;
        let w = value.data_mut();
        let g = grad.data();

        if self.momentum == 0.0 {
            for (wi, &gi) in w.iter_mut().zip(g) {
                *wi -= lr * (gi + wd * *wi);
            }
            return Ok(());
        }

        let velocity = self
            .velocity
            .entry(name.to_string())
            .or_insert_with(|| vec![0.0; w.len()]);
        ensure!(
            velocity.len() == w.len(),
            "optimizer state for '{}' has stale length {}",
            name,
            velocity.len()
        );
        for ((wi, vi), &gi) in w.iter_mut().zip(velocity.iter_mut()).zip(g) {
            *vi = self.momentum * *vi + gi + wd * *wi;
            *wi -= lr * *vi;
        }
        Ok(())
    }
}

struct AdamSlot {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

/// Adam with decoupled weight decay.
pub struct AdamW {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    slots: HashMap<String, AdamSlot>,
}

impl AdamW {
    pub fn new(lr: f32) -> Self {
        AdamW {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            slots: HashMap::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn update(
        &mut self,
        name: &str,
        value: &mut Tensor,
        grad: &Tensor,
        mults: ParamMults,
    ) -> Result<()> {
        check_shapes(name, value, grad)?;
        let lr = self.lr * mults.lr_mult;
        let wd = self.weight_decay * mults.wd_mult;
        let w = value.data_mut();
        let g = grad.data();

        let slot = self.slots.entry(name.to_string()).or_insert_with(|| AdamSlot {
            m: vec![0.0; w.len()],
            v: vec![0.0; w.len()],
            t: 0,
        });
        ensure!(
            slot.m.len() == w.len(),
            "optimizer state for '{}' has stale length {}",
            name,
            slot.m.len()
        );
        slot.t += 1;
        let bc1 = 1.0 - self.beta1.powi(slot.t);
        let bc2 = 1.0 - self.beta2.powi(slot.t);

        let decay = 1.0 - lr * wd;
        for i in 0..w.len() {
            w[i] *= decay;
            slot.m[i] = self.beta1 * slot.m[i] + (1.0 - self.beta1) * g[i];
            slot.v[i] = self.beta2 * slot.v[i] + (1.0 - self.beta2) * g[i] * g[i];
            let m_hat = slot.m[i] / bc1;
            let v_hat = slot.v[i] / bc2;
            w[i] -= lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    #[test]
    fn identical_inputs_give_identical_updates() {
        let mut a = AdamW::new(0.01);
        let mut b = AdamW::new(0.01);
        let grad = Tensor::from_vec(Shape::new([2]), vec![0.5, -0.25]).unwrap();
        let mut x = Tensor::from_vec(Shape::new([2]), vec![1.0, -1.0]).unwrap();
        let mut y = x.clone();
        for _ in 0..10 {
            a.update("w", &mut x, &grad, ParamMults::default()).unwrap();
            b.update("w", &mut y, &grad, ParamMults::default()).unwrap();
        }
        assert_eq!(x.data(), y.data());
    }

    #[test]
    fn sgd_converges_on_quadratic() {
        // Minimize f(x) = x^2 with grad 2x.
        let mut opt = Sgd::new(0.1).with_momentum(0.9);
        let mut x = Tensor::from_vec(Shape::new([1]), vec![5.0]).unwrap();
        for _ in 0..200 {
            let g = Tensor::from_vec(Shape::new([1]), vec![2.0 * x.data()[0]]).unwrap();
            opt.update("x", &mut x, &g, ParamMults::default()).unwrap();
        }
        assert!(x.data()[0].abs() < 1e-3, "did not converge: {}", x.data()[0]);
    }

    #[test]
    fn lr_mult_scales_the_step() {
        let grad = Tensor::from_vec(Shape::new([1]), vec![1.0]).unwrap();
        let mut opt = Sgd::new(0.5);
        let mut frozen = Tensor::from_vec(Shape::new([1]), vec![1.0]).unwrap();
        opt.update(
            "w",
            &mut frozen,
            &grad,
            ParamMults {
                lr_mult: 0.0,
                wd_mult: 1.0,
            },
        )
        .unwrap();
        assert_eq!(frozen.data(), &[1.0]);
    }
}
