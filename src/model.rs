/* ------------------------------------------------------------------ */
/* Model structs: parameters, per-block weights, activations         */
/* ------------------------------------------------------------------ */
//
// Gradients and Adam moments reuse the `Parameters` layout, so the
// optimizer can walk params / grads / m / v tensor-by-tensor in lockstep
// and a checkpoint is just three `Parameters` written back to back.

use crate::config::ModelConfig;
use crate::error::{LmError, Result};
use crate::rng::Rng;

/* Weights for one transformer block (pre-LN attention + MLP) */
#[derive(Debug, Clone, PartialEq)]
pub struct BlockParams {
    pub ln1_g:  Vec<f32>, // [C]
    pub ln1_b:  Vec<f32>, // [C]
    pub w_qkv:  Vec<f32>, // [3C × C]  rows: q | k | v
    pub b_qkv:  Vec<f32>, // [3C]
    pub w_proj: Vec<f32>, // [C × C]
    pub b_proj: Vec<f32>, // [C]
    pub ln2_g:  Vec<f32>, // [C]
    pub ln2_b:  Vec<f32>, // [C]
    pub w_fc:   Vec<f32>, // [F × C]
    pub b_fc:   Vec<f32>, // [F]
    pub w_out:  Vec<f32>, // [C × F]
    pub b_out:  Vec<f32>, // [C]
}

const BLOCK_TENSORS: [&str; 12] = [
    "ln1.g", "ln1.b", "attn.w_qkv", "attn.b_qkv", "attn.w_proj", "attn.b_proj",
    "ln2.g", "ln2.b", "mlp.w_fc", "mlp.b_fc", "mlp.w_out", "mlp.b_out",
];

impl BlockParams {
    fn lengths(cfg: &ModelConfig) -> [usize; 12] {
        let (c, f) = (cfg.n_embd, cfg.mlp_dim());
        [c, c, 3 * c * c, 3 * c, c * c, c, c, c, f * c, f, c * f, c]
    }

    fn tensors(&self) -> [&Vec<f32>; 12] {
        [
            &self.ln1_g, &self.ln1_b, &self.w_qkv, &self.b_qkv, &self.w_proj, &self.b_proj,
            &self.ln2_g, &self.ln2_b, &self.w_fc, &self.b_fc, &self.w_out, &self.b_out,
        ]
    }

    fn tensors_mut(&mut self) -> [&mut Vec<f32>; 12] {
        [
            &mut self.ln1_g, &mut self.ln1_b, &mut self.w_qkv, &mut self.b_qkv,
            &mut self.w_proj, &mut self.b_proj, &mut self.ln2_g, &mut self.ln2_b,
            &mut self.w_fc, &mut self.b_fc, &mut self.w_out, &mut self.b_out,
        ]
    }

    fn zeros(cfg: &ModelConfig) -> Self {
        let [l0, l1, l2, l3, l4, l5, l6, l7, l8, l9, l10, l11] = Self::lengths(cfg);
        Self {
            ln1_g: vec![0.0; l0], ln1_b: vec![0.0; l1],
            w_qkv: vec![0.0; l2], b_qkv: vec![0.0; l3],
            w_proj: vec![0.0; l4], b_proj: vec![0.0; l5],
            ln2_g: vec![0.0; l6], ln2_b: vec![0.0; l7],
            w_fc: vec![0.0; l8], b_fc: vec![0.0; l9],
            w_out: vec![0.0; l10], b_out: vec![0.0; l11],
        }
    }

    fn init(cfg: &ModelConfig, rng: &mut Rng) -> Self {
        let mut make_params = |sz: usize, std: f32| -> Vec<f32> {
            (0..sz).map(|_| rng.gauss(0.0, std)).collect()
        };

        // GPT-2 style init: output projections scaled down by 1/sqrt(2*n_layer)
        let std_in  = 0.02;
        let std_out = 0.02 / (2.0 * cfg.n_layer as f32).sqrt();
        let (c, f) = (cfg.n_embd, cfg.mlp_dim());

        Self {
            ln1_g:  vec![1.0; c],
            ln1_b:  vec![0.0; c],
            w_qkv:  make_params(3 * c * c, std_in),
            b_qkv:  vec![0.0; 3 * c],
            w_proj: make_params(c * c, std_out),
            b_proj: vec![0.0; c],
            ln2_g:  vec![1.0; c],
            ln2_b:  vec![0.0; c],
            w_fc:   make_params(f * c, std_in),
            b_fc:   vec![0.0; f],
            w_out:  make_params(c * f, std_out),
            b_out:  vec![0.0; c],
        }
    }
}

/* Full parameter set: embeddings + blocks + final norm + LM head */
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub wte:     Vec<f32>, // Token embeddings    [V × C]
    pub wpe:     Vec<f32>, // Position embeddings [block × C]
    pub blocks:  Vec<BlockParams>,
    pub lnf_g:   Vec<f32>, // [C]
    pub lnf_b:   Vec<f32>, // [C]
    pub lm_head: Vec<f32>, // Final projection    [V × C]
}

impl Parameters {
    pub fn zeros(cfg: &ModelConfig) -> Self {
        let c = cfg.n_embd;
        Self {
            wte:     vec![0.0; cfg.vocab_size * c],
            wpe:     vec![0.0; cfg.block_size * c],
            blocks:  (0..cfg.n_layer).map(|_| BlockParams::zeros(cfg)).collect(),
            lnf_g:   vec![0.0; c],
            lnf_b:   vec![0.0; c],
            lm_head: vec![0.0; cfg.vocab_size * c],
        }
    }

    pub fn init(cfg: &ModelConfig, rng: &mut Rng) -> Self {
        let c = cfg.n_embd;
        let blocks: Vec<BlockParams> = (0..cfg.n_layer).map(|_| BlockParams::init(cfg, rng)).collect();
        let wte:     Vec<f32> = (0..cfg.vocab_size * c).map(|_| rng.gauss(0.0, 0.02)).collect();
        let wpe:     Vec<f32> = (0..cfg.block_size * c).map(|_| rng.gauss(0.0, 0.01)).collect();
        let lm_head: Vec<f32> = (0..cfg.vocab_size * c).map(|_| rng.gauss(0.0, 0.02)).collect();
        Self { wte, wpe, blocks, lnf_g: vec![1.0; c], lnf_b: vec![0.0; c], lm_head }
    }

    pub fn zeros_like(&self) -> Self {
        let z = |t: &Vec<f32>| vec![0.0; t.len()];
        Self {
            wte: z(&self.wte),
            wpe: z(&self.wpe),
            blocks: self.blocks.iter().map(|b| {
                let mut out = b.clone();
                out.tensors_mut().into_iter().for_each(|t| t.fill(0.0));
                out
            }).collect(),
            lnf_g: z(&self.lnf_g),
            lnf_b: z(&self.lnf_b),
            lm_head: z(&self.lm_head),
        }
    }

    /// (name, length) of every tensor for `cfg`, in serialisation order.
    pub fn layout(cfg: &ModelConfig) -> Vec<(String, usize)> {
        let c = cfg.n_embd;
        let mut out = vec![
            ("wte".to_string(), cfg.vocab_size * c),
            ("wpe".to_string(), cfg.block_size * c),
        ];
        for li in 0..cfg.n_layer {
            for (name, len) in BLOCK_TENSORS.iter().zip(BlockParams::lengths(cfg)) {
                out.push((format!("blocks.{li}.{name}"), len));
            }
        }
        out.push(("ln_f.g".to_string(), c));
        out.push(("ln_f.b".to_string(), c));
        out.push(("lm_head".to_string(), cfg.vocab_size * c));
        out
    }

    /// Every tensor with its name, in the same order as `layout`.
    pub fn named_tensors(&self) -> Vec<(String, &[f32])> {
        let mut out: Vec<(String, &[f32])> = vec![
            ("wte".to_string(), self.wte.as_slice()),
            ("wpe".to_string(), self.wpe.as_slice()),
        ];
        for (li, block) in self.blocks.iter().enumerate() {
            for (name, t) in BLOCK_TENSORS.iter().zip(block.tensors()) {
                out.push((format!("blocks.{li}.{name}"), t.as_slice()));
            }
        }
        out.push(("ln_f.g".to_string(), self.lnf_g.as_slice()));
        out.push(("ln_f.b".to_string(), self.lnf_b.as_slice()));
        out.push(("lm_head".to_string(), self.lm_head.as_slice()));
        out
    }

    pub fn tensors(&self) -> Vec<&[f32]> {
        self.named_tensors().into_iter().map(|(_, t)| t).collect()
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out: Vec<&mut [f32]> = vec![self.wte.as_mut_slice(), self.wpe.as_mut_slice()];
        for block in self.blocks.iter_mut() {
            out.extend(block.tensors_mut().into_iter().map(|t| t.as_mut_slice()));
        }
        out.push(self.lnf_g.as_mut_slice());
        out.push(self.lnf_b.as_mut_slice());
        out.push(self.lm_head.as_mut_slice());
        out
    }

    pub fn num_params(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    /// Rebuild from a flat buffer laid out as `layout(cfg)`.
    pub fn from_flat(cfg: &ModelConfig, flat: &[f32]) -> Result<Self> {
        let mut params = Self::zeros(cfg);
        let expected = params.num_params();
        if flat.len() != expected {
            return Err(LmError::invalid(format!(
                "flat parameter buffer has {} values, expected {}",
                flat.len(),
                expected
            )));
        }
        let mut offset = 0;
        for t in params.tensors_mut() {
            t.copy_from_slice(&flat[offset..offset + t.len()]);
            offset += t.len();
        }
        Ok(params)
    }

    pub fn add_assign(&mut self, other: &Parameters) {
        for (a, b) in self.tensors_mut().into_iter().zip(other.tensors()) {
            a.iter_mut().zip(b.iter()).for_each(|(x, y)| *x += y);
        }
    }

    pub fn scale(&mut self, s: f32) {
        for t in self.tensors_mut() {
            t.iter_mut().for_each(|x| *x *= s);
        }
    }

    /// Σ x² over every tensor, accumulated in f64.
    pub fn sq_norm(&self) -> f64 {
        self.tensors()
            .iter()
            .map(|t| t.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>())
            .sum()
    }
}

/* Decoder-only transformer. Read-only during inference (share via Arc). */
#[derive(Debug, Clone)]
pub struct GptModel {
    pub(crate) config: ModelConfig,
    pub(crate) params: Parameters,
}

impl GptModel {
    pub fn new(config: ModelConfig, rng: &mut Rng) -> Result<Self> {
        config.validate()?;
        let params = Parameters::init(&config, rng);
        Ok(Self { config, params })
    }

    pub fn from_parameters(config: ModelConfig, params: Parameters) -> Result<Self> {
        config.validate()?;
        if params.blocks.len() != config.n_layer {
            return Err(LmError::invalid(format!(
                "{} blocks supplied, config expects {}",
                params.blocks.len(),
                config.n_layer
            )));
        }
        for ((name, want), have) in Parameters::layout(&config).iter().zip(params.tensors()) {
            if *want != have.len() {
                return Err(LmError::invalid(format!(
                    "tensor {name} has {} values, config expects {want}",
                    have.len()
                )));
            }
        }
        Ok(Self { config, params })
    }

    pub fn config(&self) -> &ModelConfig { &self.config }
    pub fn params(&self) -> &Parameters { &self.params }
    pub fn params_mut(&mut self) -> &mut Parameters { &mut self.params }
    pub fn into_parameters(self) -> Parameters { self.params }

    /// Shared validation for every entry point that consumes token ids.
    pub(crate) fn check_tokens(&self, tokens: &[usize], start_pos: usize) -> Result<()> {
        if tokens.is_empty() {
            return Err(LmError::invalid("empty token sequence"));
        }
        let end = start_pos + tokens.len();
        if end > self.config.block_size {
            return Err(LmError::ContextOverflow { len: end, max: self.config.block_size });
        }
        if let Some(&id) = tokens.iter().find(|&&id| id >= self.config.vocab_size) {
            return Err(LmError::TokenOutOfRange { id, vocab_size: self.config.vocab_size });
        }
        Ok(())
    }
}

/* Activations of one block over a whole sequence, kept for backward */
#[derive(Debug, Clone)]
pub struct BlockActs {
    pub x_in:      Vec<f32>, // [T × C]
    pub ln1_out:   Vec<f32>, // [T × C]
    pub ln1_mean:  Vec<f32>, // [T]
    pub ln1_rstd:  Vec<f32>, // [T]
    pub qkv:       Vec<f32>, // [T × 3C]
    pub att:       Vec<f32>, // [T × H × T]  softmax weights, zero above the diagonal
    pub y:         Vec<f32>, // [T × C]  concatenated head outputs
    pub x_mid:     Vec<f32>, // [T × C]
    pub ln2_out:   Vec<f32>, // [T × C]
    pub ln2_mean:  Vec<f32>, // [T]
    pub ln2_rstd:  Vec<f32>, // [T]
    pub h_pre:     Vec<f32>, // [T × F]
    pub h:         Vec<f32>, // [T × F]
}

/* Activations of a full-sequence forward pass */
#[derive(Debug, Clone)]
pub struct Activations {
    pub seq_len:  usize,
    pub blocks:   Vec<BlockActs>,
    pub x_final:  Vec<f32>, // [T × C] input to ln_f
    pub lnf_mean: Vec<f32>,
    pub lnf_rstd: Vec<f32>,
    pub xf:       Vec<f32>, // [T × C] ln_f output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig { vocab_size: 11, n_embd: 8, n_head: 2, n_layer: 2, block_size: 12 }
    }

    #[test]
    fn layout_matches_allocated_tensors() {
        let cfg = tiny_config();
        let params = Parameters::init(&cfg, &mut Rng::new(1));
        let layout = Parameters::layout(&cfg);
        let named = params.named_tensors();
        assert_eq!(layout.len(), named.len());
        for ((ln, len), (nn, t)) in layout.iter().zip(named.iter()) {
            assert_eq!(ln, nn);
            assert_eq!(*len, t.len());
        }
        assert_eq!(named[2].0, "blocks.0.ln1.g");
    }

    #[test]
    fn flat_roundtrip_preserves_values() {
        let cfg = tiny_config();
        let params = Parameters::init(&cfg, &mut Rng::new(9));
        let flat: Vec<f32> = params.tensors().concat();
        let back = Parameters::from_flat(&cfg, &flat).unwrap();
        assert_eq!(params, back);
        assert!(Parameters::from_flat(&cfg, &flat[1..]).is_err());
    }

    #[test]
    fn init_is_seed_deterministic() {
        let cfg = tiny_config();
        let a = GptModel::new(cfg, &mut Rng::new(5)).unwrap();
        let b = GptModel::new(cfg, &mut Rng::new(5)).unwrap();
        assert_eq!(a.params(), b.params());
        assert!(a.params().blocks[0].ln1_g.iter().all(|&g| g == 1.0));
    }

    #[test]
    fn token_validation() {
        let model = GptModel::new(tiny_config(), &mut Rng::new(5)).unwrap();
        assert!(matches!(model.check_tokens(&[], 0), Err(LmError::InvalidInput(_))));
        assert!(matches!(model.check_tokens(&[11], 0), Err(LmError::TokenOutOfRange { id: 11, .. })));
        assert!(matches!(
            model.check_tokens(&[1; 13], 0),
            Err(LmError::ContextOverflow { len: 13, max: 12 })
        ));
        assert!(model.check_tokens(&[1; 12], 0).is_ok());
    }
}
