/* ------------------------------------------------------------------ */
/* Forward pass: full-sequence (training / prefill) and cached step   */
/* ------------------------------------------------------------------ */
//
// Both paths run the same per-row arithmetic (linear_fwd per row, the same
// attention kernel), so a prefill + N cached steps reproduces the logits of
// one full-sequence pass over the same tokens.

use rayon::prelude::*;

use crate::config::ModelConfig;
use crate::error::{LmError, Result};
use crate::kv_cache::KvCache;
use crate::model::{Activations, BlockActs, GptModel};
use crate::ops::{dot, gelu_fwd, layernorm_fwd, linear_fwd, matmul_fwd, softmax_fwd};

/// Causal attention for one query row over `n_ctx` key/value rows.
///
/// `keys` / `values` hold one row every `kv_stride` floats (heads side by
/// side); the per-head softmax weights land in `weights[h * w_stride ..]`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attend(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    kv_stride: usize,
    n_ctx: usize,
    cfg: &ModelConfig,
    weights: &mut [f32],
    w_stride: usize,
    y: &mut [f32],
) {
    let hd = cfg.head_dim();
    let scale = 1.0 / (hd as f32).sqrt();
    let mut scores = vec![0.0f32; n_ctx];

    for h in 0..cfg.n_head {
        let hs = h * hd;
        let qh = &q[hs..hs + hd];
        for (j, s) in scores.iter_mut().enumerate() {
            let kj = &keys[j * kv_stride + hs..j * kv_stride + hs + hd];
            *s = dot(qh, kj) * scale;
        }
        let w = &mut weights[h * w_stride..h * w_stride + n_ctx];
        softmax_fwd(&scores, n_ctx, w, 1.0);

        let yh = &mut y[hs..hs + hd];
        yh.fill(0.0);
        for (j, &wj) in w.iter().enumerate() {
            let vj = &values[j * kv_stride + hs..j * kv_stride + hs + hd];
            yh.iter_mut().zip(vj.iter()).for_each(|(o, v)| *o += wj * v);
        }
    }
}

impl GptModel {
    fn check_cache(&self, cache: &KvCache) -> Result<()> {
        if cache.n_layers() != self.config.n_layer {
            return Err(LmError::invalid(format!(
                "cache has {} layers, model has {}",
                cache.n_layers(),
                self.config.n_layer
            )));
        }
        Ok(())
    }

    fn embed_into(&self, token: usize, pos: usize, out: &mut [f32]) {
        let c = self.config.n_embd;
        let te = &self.params.wte[token * c..(token + 1) * c];
        let pe = &self.params.wpe[pos * c..(pos + 1) * c];
        for i in 0..c {
            out[i] = te[i] + pe[i];
        }
    }

    /// Full causal pass over `tokens` (positions 0..T). Keeps every
    /// intermediate for backward and, when given a cache, records K/V.
    fn run_sequence(&self, tokens: &[usize], mut cache: Option<&mut KvCache>) -> (Vec<f32>, Activations) {
        let cfg = &self.config;
        let p = &self.params;
        let (t, c, f, v, nh) = (tokens.len(), cfg.n_embd, cfg.mlp_dim(), cfg.vocab_size, cfg.n_head);

        let mut x = vec![0.0f32; t * c];
        for (pos, &tok) in tokens.iter().enumerate() {
            self.embed_into(tok, pos, &mut x[pos * c..(pos + 1) * c]);
        }

        let mut blocks = Vec::with_capacity(cfg.n_layer);
        for (li, bp) in p.blocks.iter().enumerate() {
            let x_in = std::mem::take(&mut x);

            // ── Attention ──
            let mut ln1_out  = vec![0.0f32; t * c];
            let mut ln1_mean = vec![0.0f32; t];
            let mut ln1_rstd = vec![0.0f32; t];
            layernorm_fwd(&x_in, &bp.ln1_g, &bp.ln1_b, t, c, &mut ln1_out, &mut ln1_mean, &mut ln1_rstd);

            let mut qkv = vec![0.0f32; t * 3 * c];
            matmul_fwd(&ln1_out, &bp.w_qkv, Some(&bp.b_qkv[..]), t, c, 3 * c, &mut qkv);

            if let Some(cache) = cache.as_deref_mut() {
                for row in qkv.chunks(3 * c) {
                    cache.append(li, &row[c..2 * c], &row[2 * c..]);
                }
            }

            let mut att = vec![0.0f32; t * nh * t];
            let mut y   = vec![0.0f32; t * c];
            att.par_chunks_mut(nh * t)
                .zip(y.par_chunks_mut(c))
                .enumerate()
                .for_each(|(i, (w, yr))| {
                    let q = &qkv[i * 3 * c..i * 3 * c + c];
                    attend(q, &qkv[c..], &qkv[2 * c..], 3 * c, i + 1, cfg, w, t, yr);
                });

            let mut attn_proj = vec![0.0f32; t * c];
            matmul_fwd(&y, &bp.w_proj, Some(&bp.b_proj[..]), t, c, c, &mut attn_proj);
            let x_mid: Vec<f32> = x_in.iter().zip(attn_proj.iter()).map(|(a, b)| a + b).collect();

            // ── MLP ──
            let mut ln2_out  = vec![0.0f32; t * c];
            let mut ln2_mean = vec![0.0f32; t];
            let mut ln2_rstd = vec![0.0f32; t];
            layernorm_fwd(&x_mid, &bp.ln2_g, &bp.ln2_b, t, c, &mut ln2_out, &mut ln2_mean, &mut ln2_rstd);

            let mut h_pre = vec![0.0f32; t * f];
            matmul_fwd(&ln2_out, &bp.w_fc, Some(&bp.b_fc[..]), t, c, f, &mut h_pre);
            let mut h = vec![0.0f32; t * f];
            gelu_fwd(&h_pre, &mut h);

            let mut mlp_out = vec![0.0f32; t * c];
            matmul_fwd(&h, &bp.w_out, Some(&bp.b_out[..]), t, f, c, &mut mlp_out);
            x = x_mid.iter().zip(mlp_out.iter()).map(|(a, b)| a + b).collect();

            blocks.push(BlockActs {
                x_in, ln1_out, ln1_mean, ln1_rstd, qkv, att, y,
                x_mid, ln2_out, ln2_mean, ln2_rstd, h_pre, h,
            });
        }

        let mut xf       = vec![0.0f32; t * c];
        let mut lnf_mean = vec![0.0f32; t];
        let mut lnf_rstd = vec![0.0f32; t];
        layernorm_fwd(&x, &p.lnf_g, &p.lnf_b, t, c, &mut xf, &mut lnf_mean, &mut lnf_rstd);

        let mut logits = vec![0.0f32; t * v];
        matmul_fwd(&xf, &p.lm_head, None, t, c, v, &mut logits);

        let acts = Activations { seq_len: t, blocks, x_final: x, lnf_mean, lnf_rstd, xf };
        (logits, acts)
    }

    /// Next-token logits for every position of `tokens`.
    pub fn forward(&self, tokens: &[usize]) -> Result<Vec<Vec<f32>>> {
        self.check_tokens(tokens, 0)?;
        let (logits, _) = self.run_sequence(tokens, None);
        Ok(logits.chunks(self.config.vocab_size).map(|r| r.to_vec()).collect())
    }

    /// Flat logits [T × V] plus the activations `backward` needs.
    pub fn forward_train(&self, tokens: &[usize]) -> Result<(Vec<f32>, Activations)> {
        self.check_tokens(tokens, 0)?;
        Ok(self.run_sequence(tokens, None))
    }

    /// Process a whole prompt into an empty cache; returns the logits of its last position.
    pub fn prefill(&self, tokens: &[usize], cache: &mut KvCache) -> Result<Vec<f32>> {
        self.check_cache(cache)?;
        if !cache.is_empty() {
            return Err(LmError::invalid("prefill requires an empty cache"));
        }
        self.check_tokens(tokens, 0)?;
        let (logits, _) = self.run_sequence(tokens, Some(cache));
        let v = self.config.vocab_size;
        Ok(logits[(tokens.len() - 1) * v..].to_vec())
    }

    /// One incremental step: process `token` at position `cache.len()`,
    /// append its K/V and return the next-token logits.
    pub fn forward_step(&self, token: usize, cache: &mut KvCache) -> Result<Vec<f32>> {
        self.check_cache(cache)?;
        let pos = cache.len();
        self.check_tokens(&[token], pos)?;

        let cfg = &self.config;
        let p = &self.params;
        let (c, f, v, nh) = (cfg.n_embd, cfg.mlp_dim(), cfg.vocab_size, cfg.n_head);
        let n_ctx = pos + 1;

        let mut x = vec![0.0f32; c];
        self.embed_into(token, pos, &mut x);

        let mut xn = vec![0.0f32; c];
        let (mut mean, mut rstd) = ([0.0f32], [0.0f32]);
        let mut qkv = vec![0.0f32; 3 * c];
        let mut weights = vec![0.0f32; nh * n_ctx];
        let mut y = vec![0.0f32; c];
        let mut proj = vec![0.0f32; c];
        let mut h_pre = vec![0.0f32; f];
        let mut h = vec![0.0f32; f];

        for (li, bp) in p.blocks.iter().enumerate() {
            layernorm_fwd(&x, &bp.ln1_g, &bp.ln1_b, 1, c, &mut xn, &mut mean, &mut rstd);
            linear_fwd(&xn, &bp.w_qkv, Some(&bp.b_qkv[..]), 3 * c, c, &mut qkv);
            cache.append(li, &qkv[c..2 * c], &qkv[2 * c..]);

            attend(&qkv[..c], cache.keys(li), cache.values(li), c, n_ctx, cfg, &mut weights, n_ctx, &mut y);
            linear_fwd(&y, &bp.w_proj, Some(&bp.b_proj[..]), c, c, &mut proj);
            x.iter_mut().zip(proj.iter()).for_each(|(a, b)| *a += b);

            layernorm_fwd(&x, &bp.ln2_g, &bp.ln2_b, 1, c, &mut xn, &mut mean, &mut rstd);
            linear_fwd(&xn, &bp.w_fc, Some(&bp.b_fc[..]), f, c, &mut h_pre);
            gelu_fwd(&h_pre, &mut h);
            linear_fwd(&h, &bp.w_out, Some(&bp.b_out[..]), c, f, &mut proj);
            x.iter_mut().zip(proj.iter()).for_each(|(a, b)| *a += b);
        }

        layernorm_fwd(&x, &p.lnf_g, &p.lnf_b, 1, c, &mut xn, &mut mean, &mut rstd);
        let mut logits = vec![0.0f32; v];
        linear_fwd(&xn, &p.lm_head, None, v, c, &mut logits);
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    fn model() -> GptModel {
        let cfg = ModelConfig { vocab_size: 13, n_embd: 8, n_head: 2, n_layer: 2, block_size: 10 };
        GptModel::new(cfg, &mut Rng::new(3)).unwrap()
    }

    #[test]
    fn logits_have_one_row_per_position() {
        let m = model();
        let out = m.forward(&[1, 2, 3]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.len() == 13 && r.iter().all(|x| x.is_finite())));
    }

    #[test]
    fn attention_rows_sum_to_one_and_respect_the_mask() {
        let m = model();
        let (_, acts) = m.forward_train(&[4, 5, 6, 7]).unwrap();
        let t = 4;
        let att = &acts.blocks[1].att;
        for i in 0..t {
            for h in 0..2 {
                let row = &att[(i * 2 + h) * t..(i * 2 + h + 1) * t];
                assert!((row[..=i].iter().sum::<f32>() - 1.0).abs() < 1e-5);
                assert!(row[i + 1..].iter().all(|&w| w == 0.0));
            }
        }
    }

    #[test]
    fn later_tokens_never_change_earlier_outputs() {
        let m = model();
        let tokens = vec![2, 9, 4, 11, 0, 7, 5, 12];
        let base = m.forward(&tokens).unwrap();
        for j in 1..tokens.len() {
            let mut changed = tokens.clone();
            changed[j] = (changed[j] + 3) % 13;
            let out = m.forward(&changed).unwrap();
            for i in 0..j {
                assert_eq!(out[i], base[i], "position {i} moved when token {j} changed");
            }
            assert_ne!(out[j], base[j]);
        }
    }

    #[test]
    fn prefill_then_steps_match_full_pass() {
        let m = model();
        let tokens = [2, 9, 4, 11, 0, 7];
        let full = m.forward(&tokens).unwrap();

        let mut cache = KvCache::new(m.config());
        let last = m.prefill(&tokens[..3], &mut cache).unwrap();
        for (a, b) in last.iter().zip(full[2].iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        for pos in 3..tokens.len() {
            let step = m.forward_step(tokens[pos], &mut cache).unwrap();
            for (a, b) in step.iter().zip(full[pos].iter()) {
                assert!((a - b).abs() < 1e-5, "pos {pos}: {a} vs {b}");
            }
        }
        assert_eq!(cache.len(), tokens.len());
    }

    #[test]
    fn step_past_context_overflows() {
        let m = model();
        let mut cache = KvCache::new(m.config());
        m.prefill(&[1; 10], &mut cache).unwrap();
        assert!(matches!(m.forward_step(1, &mut cache), Err(LmError::ContextOverflow { len: 11, max: 10 })));
        assert!(matches!(m.prefill(&[1], &mut cache), Err(LmError::InvalidInput(_))));
    }
}
