/* ------------------------------------------------------------------ */
/* Math primitives: linear layers, norms, activations, loss          */
/* ------------------------------------------------------------------ */
//
// Layout conventions (row-major everywhere):
//   activations  x   [rows × nin]
//   weights      W   [nout × nin]   (one output unit per row)
//   outputs      out [rows × nout]

use rayon::prelude::*;

pub const LN_EPS: f32 = 1e-5;

#[inline(always)]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    // zip-based dot product, LLVM auto-vectorizes it
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// Linear forward for one vector: out[nout] = W[nout×nin] · x[nin] (+ b)
pub fn linear_fwd(x: &[f32], w: &[f32], b: Option<&[f32]>, nout: usize, nin: usize, out: &mut [f32]) {
    for r in 0..nout {
        out[r] = dot(&w[r * nin..(r + 1) * nin], &x[..nin]) + b.map_or(0.0, |b| b[r]);
    }
}

// Batched linear forward: out[rows×nout] = x[rows×nin] · Wᵀ (+ b), rows in parallel.
pub fn matmul_fwd(
    x: &[f32],
    w: &[f32],
    b: Option<&[f32]>,
    rows: usize,
    nin: usize,
    nout: usize,
    out: &mut [f32],
) {
    #[cfg(feature = "metal")]
    if rows >= crate::accel::MIN_ROWS {
        if let Some(y) = crate::accel::matmul(x, w, rows, nin, nout) {
            out[..rows * nout].copy_from_slice(&y);
            if let Some(b) = b {
                for row in out[..rows * nout].chunks_mut(nout) {
                    row.iter_mut().zip(b.iter()).for_each(|(o, bi)| *o += bi);
                }
            }
            return;
        }
    }

    out[..rows * nout]
        .par_chunks_mut(nout)
        .zip(x[..rows * nin].par_chunks(nin))
        .for_each(|(o, xr)| linear_fwd(xr, w, b, nout, nin, o));
}

// Batched linear backward:
//   d_x[t,c]  = Σ_r d_out[t,r] · W[r,c]     (overwritten)
//   d_W[r,c] += Σ_t d_out[t,r] · x[t,c]
//   d_b[r]   += Σ_t d_out[t,r]
#[allow(clippy::too_many_arguments)]
pub fn matmul_bwd(
    d_out: &[f32],
    x: &[f32],
    w: &[f32],
    rows: usize,
    nin: usize,
    nout: usize,
    d_x: &mut [f32],
    d_w: &mut [f32],
    d_b: Option<&mut [f32]>,
) {
    d_x[..rows * nin]
        .par_chunks_mut(nin)
        .zip(d_out[..rows * nout].par_chunks(nout))
        .for_each(|(dx, dy)| {
            dx.fill(0.0);
            for r in 0..nout {
                let g = dy[r];
                if g == 0.0 { continue; }
                let wr = &w[r * nin..(r + 1) * nin];
                dx.iter_mut().zip(wr.iter()).for_each(|(d, wi)| *d += g * wi);
            }
        });

    d_w[..nout * nin]
        .par_chunks_mut(nin)
        .enumerate()
        .for_each(|(r, dw)| {
            for t in 0..rows {
                let g = d_out[t * nout + r];
                if g == 0.0 { continue; }
                let xr = &x[t * nin..(t + 1) * nin];
                dw.iter_mut().zip(xr.iter()).for_each(|(d, xi)| *d += g * xi);
            }
        });

    if let Some(d_b) = d_b {
        for t in 0..rows {
            let dy = &d_out[t * nout..(t + 1) * nout];
            d_b[..nout].iter_mut().zip(dy.iter()).for_each(|(d, g)| *d += g);
        }
    }
}

// LayerNorm over each row of x[rows×n] with gain g and bias b.
// Stores per-row mean and 1/std for the backward pass.
#[allow(clippy::too_many_arguments)]
pub fn layernorm_fwd(
    x: &[f32],
    g: &[f32],
    b: &[f32],
    rows: usize,
    n: usize,
    out: &mut [f32],
    mean: &mut [f32],
    rstd: &mut [f32],
) {
    for t in 0..rows {
        let xr = &x[t * n..(t + 1) * n];
        let mu = xr.iter().sum::<f32>() / n as f32;
        let var = xr.iter().map(|v| (v - mu) * (v - mu)).sum::<f32>() / n as f32;
        let rs = 1.0 / (var + LN_EPS).sqrt();
        let o = &mut out[t * n..(t + 1) * n];
        for i in 0..n {
            o[i] = (xr[i] - mu) * rs * g[i] + b[i];
        }
        mean[t] = mu;
        rstd[t] = rs;
    }
}

// LayerNorm backward. d_x is overwritten, d_g / d_b accumulate.
#[allow(clippy::too_many_arguments)]
pub fn layernorm_bwd(
    d_out: &[f32],
    x: &[f32],
    mean: &[f32],
    rstd: &[f32],
    g: &[f32],
    rows: usize,
    n: usize,
    d_x: &mut [f32],
    d_g: &mut [f32],
    d_b: &mut [f32],
) {
    let mut xhat = vec![0.0f32; n];
    let mut dxhat = vec![0.0f32; n];
    for t in 0..rows {
        let xr = &x[t * n..(t + 1) * n];
        let dy = &d_out[t * n..(t + 1) * n];
        for i in 0..n {
            xhat[i] = (xr[i] - mean[t]) * rstd[t];
            dxhat[i] = dy[i] * g[i];
            d_g[i] += dy[i] * xhat[i];
            d_b[i] += dy[i];
        }
        let mean_dxhat = dxhat.iter().sum::<f32>() / n as f32;
        let mean_dxhat_xhat = dot(&dxhat, &xhat) / n as f32;
        let dx = &mut d_x[t * n..(t + 1) * n];
        for i in 0..n {
            dx[i] = rstd[t] * (dxhat[i] - mean_dxhat - xhat[i] * mean_dxhat_xhat);
        }
    }
}

const GELU_K: f32 = 0.797_884_6; // sqrt(2/π)
const GELU_C: f32 = 0.044_715;

// GELU, tanh approximation
pub fn gelu_fwd(x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        let t = (GELU_K * (v + GELU_C * v * v * v)).tanh();
        *o = 0.5 * v * (1.0 + t);
    }
}

// d_x[i] = d_out[i] · gelu'(x[i])
pub fn gelu_bwd(d_out: &[f32], x: &[f32], d_x: &mut [f32]) {
    for i in 0..x.len() {
        let v = x[i];
        let t = (GELU_K * (v + GELU_C * v * v * v)).tanh();
        let dt = (1.0 - t * t) * GELU_K * (1.0 + 3.0 * GELU_C * v * v);
        d_x[i] = d_out[i] * (0.5 * (1.0 + t) + 0.5 * v * dt);
    }
}

// Softmax with temperature
pub fn softmax_fwd(logits: &[f32], n: usize, probs: &mut [f32], temp: f32) {
    let mx = logits[..n].iter().map(|&v| v / temp).fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for i in 0..n {
        probs[i] = ((logits[i] / temp) - mx).exp();
        sum += probs[i];
    }
    let inv = 1.0 / sum;
    for p in probs[..n].iter_mut() { *p *= inv; }
}

// Softmax backward: d_in[i] = probs[i] * (d_out[i] - dot(probs, d_out))
pub fn softmax_bwd(probs: &[f32], d_out: &[f32], n: usize, d_in: &mut [f32]) {
    let dot: f32 = dot(&probs[..n], &d_out[..n]);
    for i in 0..n { d_in[i] = probs[i] * (d_out[i] - dot); }
}

// Cross-entropy of one position computed from raw logits (log-sum-exp form,
// so a NaN/inf logit yields a non-finite loss instead of being clamped away).
// Leaves softmax(logits) in `probs` for the gradient.
pub fn cross_entropy_fwd(logits: &[f32], target: usize, probs: &mut [f32]) -> f32 {
    let n = logits.len();
    softmax_fwd(logits, n, probs, 1.0);
    let mx = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let lse = mx + logits.iter().map(|&v| (v - mx).exp()).sum::<f32>().ln();
    lse - logits[target]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool { (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs())) }

    #[test]
    fn matmul_matches_per_row_linear() {
        let x = [1.0, 2.0, 3.0, -1.0, 0.5, 0.0];
        let w = [0.1, 0.2, 0.3, -0.4, 0.5, 0.6];
        let b = [0.01, -0.02];
        let mut out = [0.0f32; 4];
        matmul_fwd(&x, &w, Some(&b[..]), 2, 3, 2, &mut out);
        let mut row = [0.0f32; 2];
        linear_fwd(&x[3..], &w, Some(&b[..]), 2, 3, &mut row);
        assert!(close(out[0], 0.1 + 0.4 + 0.9 + 0.01, 1e-6));
        assert_eq!(&out[2..], &row);
    }

    #[test]
    fn matmul_bwd_matches_finite_difference() {
        let x = [0.3, -0.7, 1.1, 0.2, 0.9, -0.4];
        let w = [0.5, -0.1, 0.2, 0.7, 0.3, -0.6];
        let d_out = [1.0, -2.0, 0.5, 0.25];
        let mut d_x = [0.0f32; 6];
        let mut d_w = [0.0f32; 6];
        let mut d_b = [0.0f32; 2];
        matmul_bwd(&d_out, &x, &w, 2, 3, 2, &mut d_x, &mut d_w, Some(&mut d_b[..]));

        // L = Σ d_out ⊙ (x Wᵀ)
        let loss = |x: &[f32], w: &[f32]| {
            let mut o = [0.0f32; 4];
            matmul_fwd(x, w, None, 2, 3, 2, &mut o);
            o.iter().zip(d_out.iter()).map(|(a, b)| a * b).sum::<f32>()
        };
        let eps = 1e-2;
        for i in 0..6 {
            let mut xp = x; xp[i] += eps;
            let mut xm = x; xm[i] -= eps;
            assert!(close((loss(&xp, &w) - loss(&xm, &w)) / (2.0 * eps), d_x[i], 1e-3));
            let mut wp = w; wp[i] += eps;
            let mut wm = w; wm[i] -= eps;
            assert!(close((loss(&x, &wp) - loss(&x, &wm)) / (2.0 * eps), d_w[i], 1e-3));
        }
        assert!(close(d_b[0], 1.5, 1e-6));
        assert!(close(d_b[1], -1.75, 1e-6));
    }

    #[test]
    fn layernorm_normalises_and_backprops() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let g = [1.0, 0.5, 2.0, 1.0];
        let b = [0.0, 0.1, 0.0, -0.1];
        let mut out = [0.0f32; 4];
        let (mut mean, mut rstd) = ([0.0f32; 1], [0.0f32; 1]);
        layernorm_fwd(&x, &[1.0; 4], &[0.0; 4], 1, 4, &mut out, &mut mean, &mut rstd);
        assert!(close(mean[0], 2.5, 1e-6));
        assert!(out.iter().sum::<f32>().abs() < 1e-5);

        let d_out = [0.3, -0.2, 0.5, 0.1];
        let mut d_x = [0.0f32; 4];
        let (mut d_g, mut d_b) = ([0.0f32; 4], [0.0f32; 4]);
        layernorm_fwd(&x, &g, &b, 1, 4, &mut out, &mut mean, &mut rstd);
        layernorm_bwd(&d_out, &x, &mean, &rstd, &g, 1, 4, &mut d_x, &mut d_g, &mut d_b);

        let loss = |x: &[f32]| {
            let mut o = [0.0f32; 4];
            let (mut m, mut r) = ([0.0f32; 1], [0.0f32; 1]);
            layernorm_fwd(x, &g, &b, 1, 4, &mut o, &mut m, &mut r);
            o.iter().zip(d_out.iter()).map(|(a, b)| a * b).sum::<f32>()
        };
        let eps = 1e-2;
        for i in 0..4 {
            let mut xp = x; xp[i] += eps;
            let mut xm = x; xm[i] -= eps;
            let fd = (loss(&xp) - loss(&xm)) / (2.0 * eps);
            assert!(close(fd, d_x[i], 1e-2), "d_x[{i}]: fd {fd} vs {}", d_x[i]);
        }
        assert_eq!(d_b, d_out);
    }

    #[test]
    fn gelu_derivative_matches_finite_difference() {
        let xs = [-2.0f32, -0.5, 0.0, 0.3, 1.7];
        let mut d = [0.0f32; 5];
        gelu_bwd(&[1.0; 5], &xs, &mut d);
        for (i, &v) in xs.iter().enumerate() {
            let (mut hi, mut lo) = ([0.0f32], [0.0f32]);
            gelu_fwd(&[v + 1e-3], &mut hi);
            gelu_fwd(&[v - 1e-3], &mut lo);
            assert!(close((hi[0] - lo[0]) / 2e-3, d[i], 1e-2));
        }
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_vocab() {
        let logits = [0.0f32; 8];
        let mut probs = [0.0f32; 8];
        let loss = cross_entropy_fwd(&logits, 3, &mut probs);
        assert!(close(loss, (8.0f32).ln(), 1e-6));
        assert!(close(probs[3], 0.125, 1e-6));
    }

    #[test]
    fn cross_entropy_propagates_nan() {
        let logits = [0.0, f32::NAN, 1.0];
        let mut probs = [0.0f32; 3];
        assert!(!cross_entropy_fwd(&logits, 0, &mut probs).is_finite());
    }
}
