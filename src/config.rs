/* ------------------------------------------------------------------ */
/* Hyperparameters: compile-time defaults + runtime config structs    */
/* ------------------------------------------------------------------ */
//
// Presets live in configs/*.json and are loaded with RunConfig::from_path:
//   finlm train --config configs/tiny.json   (64 wide, 2 layers, ctx 32: code changes, CI)
//   finlm train --config configs/small.json  (128 wide, 4 layers, ctx 64)
//   finlm train --config configs/medium.json (256 wide, 6 layers, ctx 128)
//   finlm train --config configs/large.json  (512 wide, 12 layers, ctx 256)
//
// Any field left out of a preset falls back to the constants below.
// Checkpoints are NOT cross-compatible between sizes (different weight shapes);
// the checkpoint header records the ModelConfig and load() refuses a mismatch.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LmError, Result};

// ── Architecture ──────────────────────────────────────────────────────────

pub const N_EMBD:     usize = 116;
pub const N_HEAD:     usize = 4;
pub const N_LAYER:    usize = 3;
pub const BLOCK_SIZE: usize = 256;
pub const MLP_RATIO:  usize = 4;

// ── BPE tokenizer ─────────────────────────────────────────────────────────
pub const BPE_VOCAB_SIZE:    usize = 2000;
pub const BPE_MIN_FREQUENCY: usize = 2;
pub const BPE_VOCAB_PATH:    &str  = "vocab.json";

// ── Training ──────────────────────────────────────────────────────────────
pub const BATCH_SIZE:        usize = 16;
pub const LEARNING_RATE:     f32   = 3e-4;
pub const MIN_LEARNING_RATE: f32   = 3e-5;   // 10% of peak
pub const WARMUP_ITERS:      u64   = 100;
pub const WEIGHT_DECAY:      f32   = 0.1;
pub const BETA1:             f32   = 0.9;
pub const BETA2:             f32   = 0.95;
pub const EPSILON:           f32   = 1e-8;
pub const MAX_ITERS:         u64   = 1000;
pub const EVAL_INTERVAL:     u64   = 25;
pub const EVAL_BATCHES:      usize = 8;
pub const SAVE_INTERVAL:     u64   = 100;
pub const KEEP_LAST:         usize = 3;
pub const GRAD_CLIP:         f32   = 1.0;
pub const VAL_FRACTION:      f32   = 0.1;
pub const SEED:              u64   = 1337;

// ── Inference ─────────────────────────────────────────────────────────────
pub const DEFAULT_MAX_TOKENS: usize = 128;
pub const DEFAULT_TEMPERATURE: f32  = 0.8;

/* ------------------------------------------------------------------ */
/* Model shape                                                        */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Filled from the tokenizer when left at 0 in a preset.
    pub vocab_size: usize,
    pub n_embd:     usize,
    pub n_head:     usize,
    pub n_layer:    usize,
    pub block_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            n_embd:     N_EMBD,
            n_head:     N_HEAD,
            n_layer:    N_LAYER,
            block_size: BLOCK_SIZE,
        }
    }
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize { self.n_embd / self.n_head }
    pub fn mlp_dim(&self)  -> usize { MLP_RATIO * self.n_embd }

    pub fn with_vocab(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(LmError::Config("model.vocab_size must be > 0".into()));
        }
        if self.n_embd == 0 || self.n_head == 0 || self.n_layer == 0 || self.block_size == 0 {
            return Err(LmError::Config("model dimensions must be non-zero".into()));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(LmError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}

/* ------------------------------------------------------------------ */
/* Tokenizer training                                                 */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Target vocabulary size, control tokens included.
    pub vocab_size:    usize,
    /// Stop merging once the best pair occurs fewer times than this.
    pub min_frequency: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { vocab_size: BPE_VOCAB_SIZE, min_frequency: BPE_MIN_FREQUENCY }
    }
}

/* ------------------------------------------------------------------ */
/* Training                                                           */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size:    usize,
    pub max_steps:     u64,
    pub warmup_steps:  u64,
    pub peak_lr:       f32,
    pub min_lr:        f32,
    pub weight_decay:  f32,
    pub beta1:         f32,
    pub beta2:         f32,
    pub eps:           f32,
    pub grad_clip:     f32,
    pub eval_interval: u64,
    pub eval_batches:  usize,
    pub save_interval: u64,
    /// Regular checkpoints kept on disk (the best one is never pruned). 0 = keep all.
    pub keep_last:     usize,
    pub val_fraction:  f32,
    pub seed:          u64,
    /// Build batches on a background thread.
    pub prefetch:      bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size:    BATCH_SIZE,
            max_steps:     MAX_ITERS,
            warmup_steps:  WARMUP_ITERS,
            peak_lr:       LEARNING_RATE,
            min_lr:        MIN_LEARNING_RATE,
            weight_decay:  WEIGHT_DECAY,
            beta1:         BETA1,
            beta2:         BETA2,
            eps:           EPSILON,
            grad_clip:     GRAD_CLIP,
            eval_interval: EVAL_INTERVAL,
            eval_batches:  EVAL_BATCHES,
            save_interval: SAVE_INTERVAL,
            keep_last:     KEEP_LAST,
            val_fraction:  VAL_FRACTION,
            seed:          SEED,
            prefetch:      true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.batch_size == 0 { errors.push("batch_size must be > 0".to_string()); }
        if self.max_steps == 0 { errors.push("max_steps must be > 0".to_string()); }
        if self.warmup_steps > self.max_steps {
            errors.push(format!(
                "warmup_steps ({}) exceeds max_steps ({})",
                self.warmup_steps, self.max_steps
            ));
        }
        if !(self.peak_lr > 0.0) || self.min_lr < 0.0 || self.min_lr > self.peak_lr {
            errors.push("learning rates must satisfy 0 <= min_lr <= peak_lr, peak_lr > 0".to_string());
        }
        if !(self.grad_clip > 0.0) { errors.push("grad_clip must be > 0".to_string()); }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            errors.push("betas must lie in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            errors.push("val_fraction must lie in [0, 1)".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LmError::Config(errors.join("; ")))
        }
    }
}

/* ------------------------------------------------------------------ */
/* Generation                                                         */
/* ------------------------------------------------------------------ */

/// What to do with a prompt that leaves no room for `max_tokens` new tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Drop the oldest prompt tokens (the leading `<bos>` is kept).
    #[default]
    KeepLatest,
    /// Fail with `ContextOverflow`.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub truncation: TruncationPolicy,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { truncation: TruncationPolicy::KeepLatest, max_tokens: DEFAULT_MAX_TOKENS }
    }
}

/* ------------------------------------------------------------------ */
/* Preset file                                                        */
/* ------------------------------------------------------------------ */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model:      ModelConfig,
    pub tokenizer:  TokenizerConfig,
    pub train:      TrainConfig,
    pub generation: GenerationConfig,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&contents)?;
        config.train.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_preset_falls_back_to_defaults() {
        let cfg: RunConfig = serde_json::from_str(r#"{"model": {"n_layer": 2}, "train": {"max_steps": 50}}"#)
            .unwrap();
        assert_eq!(cfg.model.n_layer, 2);
        assert_eq!(cfg.model.n_embd, N_EMBD);
        assert_eq!(cfg.train.max_steps, 50);
        assert_eq!(cfg.train.batch_size, BATCH_SIZE);
        assert_eq!(cfg.generation.truncation, TruncationPolicy::KeepLatest);
    }

    #[test]
    fn model_config_rejects_indivisible_heads() {
        let cfg = ModelConfig { n_embd: 30, n_head: 4, ..ModelConfig::default() }.with_vocab(10);
        assert!(matches!(cfg.validate(), Err(LmError::Config(_))));
        assert!(ModelConfig::default().validate().is_err(), "vocab_size 0 must be rejected");
    }

    #[test]
    fn train_config_validation_collects_errors() {
        let cfg = TrainConfig { batch_size: 0, warmup_steps: 5, max_steps: 2, ..TrainConfig::default() };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("batch_size"));
        assert!(err.contains("warmup_steps"));
    }
}
