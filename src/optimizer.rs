/* ------------------------------------------------------------------ */
/* AdamW optimizer, LR schedule and gradient clipping                */
/* ------------------------------------------------------------------ */

use crate::config::{ModelConfig, TrainConfig};
use crate::model::Parameters;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub beta1:        f32,
    pub beta2:        f32,
    pub eps:          f32,
    pub weight_decay: f32,
}

impl From<&TrainConfig> for AdamWConfig {
    fn from(cfg: &TrainConfig) -> Self {
        Self { beta1: cfg.beta1, beta2: cfg.beta2, eps: cfg.eps, weight_decay: cfg.weight_decay }
    }
}

/// First/second moments in the parameter layout, plus the number of updates applied.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub step: u64,
    pub m:    Parameters,
    pub v:    Parameters,
}

impl OptimizerState {
    pub fn new(cfg: &ModelConfig) -> Self {
        Self { step: 0, m: Parameters::zeros(cfg), v: Parameters::zeros(cfg) }
    }
}

// AdamW step: Adam with decoupled weight decay.
// Bias corrections (powf) are precomputed once per call, not per-parameter.
#[allow(clippy::too_many_arguments)]
fn adam_tensor(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    bc1: f32,
    bc2: f32,
    cfg: &AdamWConfig,
) {
    let one_m_b1 = 1.0 - cfg.beta1;
    let one_m_b2 = 1.0 - cfg.beta2;

    for i in 0..params.len() {
        m[i] = cfg.beta1 * m[i] + one_m_b1 * grads[i];
        v[i] = cfg.beta2 * v[i] + one_m_b2 * grads[i] * grads[i];
        let m_hat = m[i] / bc1;
        let v_hat = v[i] / bc2;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + cfg.eps) + cfg.weight_decay * params[i]);
    }
}

/// One AdamW update of every tensor. Increments `state.step` first, so the
/// first update uses bias correction for t = 1.
pub fn adamw_step(params: &mut Parameters, grads: &Parameters, state: &mut OptimizerState, lr: f32, cfg: &AdamWConfig) {
    state.step += 1;
    let t = state.step as f32;
    let bc1 = 1.0 - cfg.beta1.powf(t);
    let bc2 = 1.0 - cfg.beta2.powf(t);

    let OptimizerState { m, v, .. } = state;
    for (((p, g), m), v) in params
        .tensors_mut()
        .into_iter()
        .zip(grads.tensors())
        .zip(m.tensors_mut())
        .zip(v.tensors_mut())
    {
        adam_tensor(p, g, m, v, lr, bc1, bc2, cfg);
    }
}

/// Scale `grads` so their global L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping (NaN / inf pass through unclipped).
pub fn clip_grad_norm(grads: &mut Parameters, max_norm: f32) -> f32 {
    let norm = grads.sq_norm().sqrt() as f32;
    if norm.is_finite() && norm > max_norm {
        grads.scale(max_norm / norm);
    }
    norm
}

/* ------------------------------------------------------------------ */
/* Learning rate schedule: linear warmup → cosine anneal → floor      */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub peak:   f32,
    pub min:    f32,
    pub warmup: u64,
    pub total:  u64,
}

impl From<&TrainConfig> for LrSchedule {
    fn from(cfg: &TrainConfig) -> Self {
        Self { peak: cfg.peak_lr, min: cfg.min_lr, warmup: cfg.warmup_steps, total: cfg.max_steps }
    }
}

impl LrSchedule {
    pub fn lr_at(&self, step: u64) -> f32 {
        if step < self.warmup {
            return self.peak * step as f32 / self.warmup as f32;
        }
        if step > self.total {
            return self.min;
        }
        let span = self.total.saturating_sub(self.warmup);
        if span == 0 {
            return self.peak;
        }
        let progress = (step - self.warmup) as f32 / span as f32;
        let cosine   = 0.5 * (1.0 + (progress * std::f32::consts::PI).cos());
        self.min + (self.peak - self.min) * cosine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    fn cfg() -> ModelConfig {
        ModelConfig { vocab_size: 5, n_embd: 4, n_head: 2, n_layer: 1, block_size: 4 }
    }

    #[test]
    fn schedule_warms_up_then_anneals() {
        let s = LrSchedule { peak: 1e-3, min: 1e-4, warmup: 10, total: 100 };
        assert_eq!(s.lr_at(0), 0.0);
        assert!((s.lr_at(5) - 5e-4).abs() < 1e-9);
        assert!((s.lr_at(10) - 1e-3).abs() < 1e-9);
        let mut prev = s.lr_at(10);
        for step in 11..=100 {
            let lr = s.lr_at(step);
            assert!(lr <= prev + 1e-12, "lr rose at step {step}");
            prev = lr;
        }
        assert!((s.lr_at(100) - 1e-4).abs() < 1e-9);
        assert_eq!(s.lr_at(500), 1e-4);
    }

    #[test]
    fn clipping_caps_large_norms_and_leaves_small_ones() {
        let mut g = Parameters::zeros(&cfg());
        g.wte[0] = 3.0;
        g.lm_head[1] = 4.0;
        let pre = clip_grad_norm(&mut g, 1.0);
        assert!((pre - 5.0).abs() < 1e-6);
        assert!((g.sq_norm().sqrt() - 1.0).abs() < 1e-6);
        assert!((g.wte[0] - 0.6).abs() < 1e-6);

        let mut small = Parameters::zeros(&cfg());
        small.wpe[2] = 0.5;
        let before = small.clone();
        assert!((clip_grad_norm(&mut small, 1.0) - 0.5).abs() < 1e-6);
        assert_eq!(small, before);
    }

    #[test]
    fn adamw_moves_against_the_gradient_and_counts_steps() {
        let c = cfg();
        let mut params = Parameters::init(&c, &mut Rng::new(1));
        let before = params.clone();
        let mut grads = Parameters::zeros(&c);
        grads.wte[3] = 1.0;
        let mut state = OptimizerState::new(&c);
        let adam = AdamWConfig { beta1: 0.9, beta2: 0.95, eps: 1e-8, weight_decay: 0.0 };
        adamw_step(&mut params, &grads, &mut state, 0.01, &adam);

        assert_eq!(state.step, 1);
        // first bias-corrected step moves by ~lr · sign(g)
        assert!((before.wte[3] - params.wte[3] - 0.01).abs() < 1e-5);
        assert_eq!(before.wpe, params.wpe);
        assert!(state.v.wte[3] > 0.0);
    }
}
