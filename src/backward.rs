/* ------------------------------------------------------------------ */
/* Backward pass: exact gradients through the full-sequence forward   */
/* ------------------------------------------------------------------ */
//
// Walks the graph of `forward_train` in reverse:
//   lm_head → ln_f → blocks (last to first) → token / position embeddings
// Attention gradients flow to every earlier position each query attended to.

use rayon::prelude::*;

use crate::config::ModelConfig;
use crate::model::{Activations, GptModel, Parameters};
use crate::ops::{dot, gelu_bwd, layernorm_bwd, matmul_bwd, softmax_bwd};

/// d(loss)/d(qkv) [T × 3C] given d(loss)/d(y) [T × C].
/// Heads are independent, so each one is processed on its own thread and the
/// per-head buffers are scattered back in head order.
fn attention_bwd(d_y: &[f32], qkv: &[f32], att: &[f32], t: usize, cfg: &ModelConfig) -> Vec<f32> {
    let (c, nh, hd) = (cfg.n_embd, cfg.n_head, cfg.head_dim());
    let scale = 1.0 / (hd as f32).sqrt();
    let row = 3 * c;

    let per_head: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = (0..nh)
        .into_par_iter()
        .map(|h| {
            let hs = h * hd;
            let mut dq = vec![0.0f32; t * hd];
            let mut dk = vec![0.0f32; t * hd];
            let mut dv = vec![0.0f32; t * hd];
            let mut d_att = vec![0.0f32; t];
            let mut d_s = vec![0.0f32; t];

            for i in 0..t {
                let w = &att[(i * nh + h) * t..(i * nh + h) * t + i + 1];
                let dyi = &d_y[i * c + hs..i * c + hs + hd];

                for (j, &wj) in w.iter().enumerate() {
                    let vj = &qkv[j * row + 2 * c + hs..j * row + 2 * c + hs + hd];
                    d_att[j] = dot(dyi, vj);
                    dv[j * hd..(j + 1) * hd].iter_mut().zip(dyi.iter()).for_each(|(d, g)| *d += wj * g);
                }
                softmax_bwd(w, &d_att, i + 1, &mut d_s);

                let qi = &qkv[i * row + hs..i * row + hs + hd];
                for j in 0..=i {
                    let g = d_s[j] * scale;
                    if g == 0.0 { continue; }
                    let kj = &qkv[j * row + c + hs..j * row + c + hs + hd];
                    dq[i * hd..(i + 1) * hd].iter_mut().zip(kj.iter()).for_each(|(d, k)| *d += g * k);
                    dk[j * hd..(j + 1) * hd].iter_mut().zip(qi.iter()).for_each(|(d, q)| *d += g * q);
                }
            }
            (dq, dk, dv)
        })
        .collect();

    let mut d_qkv = vec![0.0f32; t * row];
    for (h, (dq, dk, dv)) in per_head.iter().enumerate() {
        let hs = h * hd;
        for i in 0..t {
            let src = i * hd..(i + 1) * hd;
            let base = i * row + hs;
            d_qkv[base..base + hd].copy_from_slice(&dq[src.clone()]);
            d_qkv[base + c..base + c + hd].copy_from_slice(&dk[src.clone()]);
            d_qkv[base + 2 * c..base + 2 * c + hd].copy_from_slice(&dv[src]);
        }
    }
    d_qkv
}

impl GptModel {
    /// Gradients of the loss w.r.t. every parameter, given d(loss)/d(logits)
    /// [T × V] for the activations produced by `forward_train(tokens)`.
    pub fn backward(&self, tokens: &[usize], acts: &Activations, d_logits: &[f32]) -> Parameters {
        let cfg = &self.config;
        let p = &self.params;
        let (t, c, f, v) = (acts.seq_len, cfg.n_embd, cfg.mlp_dim(), cfg.vocab_size);
        let mut grads = Parameters::zeros(cfg);

        let mut d_xf = vec![0.0f32; t * c];
        matmul_bwd(d_logits, &acts.xf, &p.lm_head, t, c, v, &mut d_xf, &mut grads.lm_head, None);

        let mut d_x = vec![0.0f32; t * c];
        layernorm_bwd(
            &d_xf, &acts.x_final, &acts.lnf_mean, &acts.lnf_rstd, &p.lnf_g, t, c,
            &mut d_x, &mut grads.lnf_g, &mut grads.lnf_b,
        );

        for li in (0..cfg.n_layer).rev() {
            let bp = &p.blocks[li];
            let a = &acts.blocks[li];
            let g = &mut grads.blocks[li];

            // ── MLP: x_out = x_mid + W_out·gelu(W_fc·ln2(x_mid)) ──
            let mut d_h = vec![0.0f32; t * f];
            matmul_bwd(&d_x, &a.h, &bp.w_out, t, f, c, &mut d_h, &mut g.w_out, Some(&mut g.b_out[..]));
            let mut d_hpre = vec![0.0f32; t * f];
            gelu_bwd(&d_h, &a.h_pre, &mut d_hpre);
            let mut d_ln2 = vec![0.0f32; t * c];
            matmul_bwd(&d_hpre, &a.ln2_out, &bp.w_fc, t, c, f, &mut d_ln2, &mut g.w_fc, Some(&mut g.b_fc[..]));
            let mut d_mid = vec![0.0f32; t * c];
            layernorm_bwd(
                &d_ln2, &a.x_mid, &a.ln2_mean, &a.ln2_rstd, &bp.ln2_g, t, c,
                &mut d_mid, &mut g.ln2_g, &mut g.ln2_b,
            );
            d_mid.iter_mut().zip(d_x.iter()).for_each(|(a, b)| *a += b);

            // ── Attention: x_mid = x_in + W_proj·attn(W_qkv·ln1(x_in)) ──
            let mut d_y = vec![0.0f32; t * c];
            matmul_bwd(&d_mid, &a.y, &bp.w_proj, t, c, c, &mut d_y, &mut g.w_proj, Some(&mut g.b_proj[..]));
            let d_qkv = attention_bwd(&d_y, &a.qkv, &a.att, t, cfg);
            let mut d_ln1 = vec![0.0f32; t * c];
            matmul_bwd(&d_qkv, &a.ln1_out, &bp.w_qkv, t, c, 3 * c, &mut d_ln1, &mut g.w_qkv, Some(&mut g.b_qkv[..]));
            let mut d_in = vec![0.0f32; t * c];
            layernorm_bwd(
                &d_ln1, &a.x_in, &a.ln1_mean, &a.ln1_rstd, &bp.ln1_g, t, c,
                &mut d_in, &mut g.ln1_g, &mut g.ln1_b,
            );
            d_in.iter_mut().zip(d_mid.iter()).for_each(|(a, b)| *a += b);
            d_x = d_in;
        }

        for (pos, &tok) in tokens[..t].iter().enumerate() {
            let dr = &d_x[pos * c..(pos + 1) * c];
            grads.wte[tok * c..(tok + 1) * c].iter_mut().zip(dr.iter()).for_each(|(a, b)| *a += b);
            grads.wpe[pos * c..(pos + 1) * c].iter_mut().zip(dr.iter()).for_each(|(a, b)| *a += b);
        }
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    // Model with enlarged weights so every gradient is well above f32 noise.
    fn model() -> GptModel {
        let cfg = ModelConfig { vocab_size: 7, n_embd: 8, n_head: 2, n_layer: 2, block_size: 6 };
        let mut m = GptModel::new(cfg, &mut Rng::new(11)).unwrap();
        let mut rng = Rng::new(12);
        let layout = Parameters::layout(&cfg);
        for ((name, _), t) in layout.iter().zip(m.params_mut().tensors_mut()) {
            let is_norm = name.contains("ln");
            t.iter_mut().for_each(|x| {
                *x = if is_norm { *x + rng.gauss(0.0, 0.1) } else { *x * 5.0 };
            });
        }
        m
    }

    // L = Σ cot ⊙ logits, so d(L)/d(logits) = cot.
    fn loss(m: &GptModel, tokens: &[usize], cot: &[f32]) -> f64 {
        let (logits, _) = m.forward_train(tokens).unwrap();
        logits.iter().zip(cot.iter()).map(|(&a, &b)| a as f64 * b as f64).sum()
    }

    #[test]
    fn gradients_match_finite_differences() {
        let m = model();
        let tokens = [1, 4, 2, 6, 3];
        let mut rng = Rng::new(99);
        let cot: Vec<f32> = (0..tokens.len() * 7).map(|_| rng.gauss(0.0, 1.0)).collect();

        let (_, acts) = m.forward_train(&tokens).unwrap();
        let grads = m.backward(&tokens, &acts, &cot);

        let eps = 1e-2f32;
        for (ti, (name, g)) in grads.named_tensors().into_iter().enumerate() {
            // largest-magnitude entry of each tensor
            let (idx, &an) = g
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .unwrap();
            let mut plus = m.clone();
            plus.params_mut().tensors_mut()[ti][idx] += eps;
            let mut minus = m.clone();
            minus.params_mut().tensors_mut()[ti][idx] -= eps;
            let fd = ((loss(&plus, &tokens, &cot) - loss(&minus, &tokens, &cot)) / (2.0 * eps as f64)) as f32;
            let tol = 3e-2 * fd.abs().max(an.abs()) + 2e-3;
            assert!((fd - an).abs() <= tol, "{name}[{idx}]: analytic {an} vs numeric {fd}");
        }
    }

    #[test]
    fn unused_positions_and_tokens_get_no_gradient() {
        let m = model();
        let tokens = [2, 2, 5];
        let (_, acts) = m.forward_train(&tokens).unwrap();
        let grads = m.backward(&tokens, &acts, &vec![0.1; 3 * 7]);
        let c = 8;
        assert!(grads.wpe[3 * c..].iter().all(|&g| g == 0.0));
        assert!(grads.wte[..2 * c].iter().all(|&g| g == 0.0));
        assert!(grads.wte[2 * c..3 * c].iter().any(|&g| g != 0.0));
    }
}
