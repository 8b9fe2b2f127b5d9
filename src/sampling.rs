/* ------------------------------------------------------------------ */
/* Next-token selection                                               */
/* ------------------------------------------------------------------ */

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TEMPERATURE;
use crate::error::{LmError, Result};
use crate::ops::softmax_fwd;
use crate::rng::Rng;

/// How the next token is picked from a row of logits.
///
/// JSON form: `{"type": "top_p", "p": 0.9, "temperature": 0.8}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionPolicy {
    Greedy,
    Temperature { temperature: f32 },
    TopK { k: usize, temperature: f32 },
    TopP { p: f32, temperature: f32 },
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::TopP { p: 0.9, temperature: DEFAULT_TEMPERATURE }
    }
}

impl SelectionPolicy {
    pub fn validate(&self) -> Result<()> {
        let temp_ok = |t: f32| t.is_finite() && t >= 0.0;
        match *self {
            SelectionPolicy::Greedy => Ok(()),
            SelectionPolicy::Temperature { temperature } if !temp_ok(temperature) => {
                Err(LmError::invalid(format!("temperature must be finite and >= 0, got {temperature}")))
            }
            SelectionPolicy::TopK { k, .. } if k == 0 => Err(LmError::invalid("top-k needs k >= 1")),
            SelectionPolicy::TopK { temperature, .. } if !temp_ok(temperature) => {
                Err(LmError::invalid(format!("temperature must be finite and >= 0, got {temperature}")))
            }
            SelectionPolicy::TopP { p, .. } if !(p > 0.0 && p <= 1.0) => {
                Err(LmError::invalid(format!("top-p needs 0 < p <= 1, got {p}")))
            }
            SelectionPolicy::TopP { temperature, .. } if !temp_ok(temperature) => {
                Err(LmError::invalid(format!("temperature must be finite and >= 0, got {temperature}")))
            }
            _ => Ok(()),
        }
    }

    pub fn is_greedy(&self) -> bool {
        match *self {
            SelectionPolicy::Greedy => true,
            SelectionPolicy::Temperature { temperature }
            | SelectionPolicy::TopK { temperature, .. }
            | SelectionPolicy::TopP { temperature, .. } => temperature <= 0.0,
        }
    }

    /// Pick a token id. Greedy (and any temperature of 0) is deterministic
    /// with ties going to the lowest id; the sampling policies draw from `rng`.
    pub fn select(&self, logits: &[f32], rng: &mut Rng) -> usize {
        if self.is_greedy() {
            return argmax(logits);
        }
        let n = logits.len();
        let mut probs = vec![0.0f32; n];
        match *self {
            SelectionPolicy::Greedy => argmax(logits),
            SelectionPolicy::Temperature { temperature } => {
                softmax_fwd(logits, n, &mut probs, temperature);
                let all: Vec<usize> = (0..n).collect();
                draw(&probs, &all, rng).unwrap_or_else(|| argmax(logits))
            }
            SelectionPolicy::TopK { k, temperature } => {
                softmax_fwd(logits, n, &mut probs, temperature);
                let mut order = ranked(&probs);
                order.truncate(k.min(n));
                draw(&probs, &order, rng).unwrap_or_else(|| argmax(logits))
            }
            SelectionPolicy::TopP { p, temperature } => {
                softmax_fwd(logits, n, &mut probs, temperature);
                let mut order = ranked(&probs);
                let mut cumulative = 0.0f32;
                let mut cutoff = order.len();
                for (i, &idx) in order.iter().enumerate() {
                    cumulative += probs[idx];
                    if cumulative >= p {
                        cutoff = i + 1;
                        break;
                    }
                }
                order.truncate(cutoff);
                draw(&probs, &order, rng).unwrap_or_else(|| argmax(logits))
            }
        }
    }
}

/// Index of the largest finite-or-infinite value; first one wins ties, NaN never wins.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_v {
            best = i;
            best_v = v;
        }
    }
    best
}

// Ids by descending probability, ascending id on ties.
fn ranked(probs: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
    order
}

// Renormalise over `candidates` and draw one. None if the mass is unusable.
fn draw(probs: &[f32], candidates: &[usize], rng: &mut Rng) -> Option<usize> {
    let total: f32 = candidates.iter().map(|&i| probs[i]).sum();
    if !(total.is_finite() && total > 0.0) {
        return None;
    }
    let mut r = rng.uniform() as f32 * total;
    for &idx in candidates {
        r -= probs[idx];
        if r <= 0.0 {
            return Some(idx);
        }
    }
    candidates.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_breaks_ties_toward_the_lowest_id() {
        let logits = [0.1, 2.0, -1.0, 2.0];
        assert_eq!(SelectionPolicy::Greedy.select(&logits, &mut Rng::new(1)), 1);
        assert_eq!(argmax(&[f32::NAN, 0.5, 0.5]), 1);
    }

    #[test]
    fn zero_temperature_degrades_to_greedy() {
        let logits = [0.3, 0.2, 0.9, 0.1];
        let mut rng = Rng::new(5);
        for policy in [
            SelectionPolicy::Temperature { temperature: 0.0 },
            SelectionPolicy::TopK { k: 3, temperature: 0.0 },
            SelectionPolicy::TopP { p: 0.5, temperature: 0.0 },
            SelectionPolicy::TopK { k: 1, temperature: 1.0 },
        ] {
            assert_eq!(policy.select(&logits, &mut rng), 2, "{policy:?}");
        }
    }

    #[test]
    fn sampling_is_reproducible_from_the_seed() {
        let logits: Vec<f32> = (0..20).map(|i| (i as f32 * 0.37).sin()).collect();
        let policy = SelectionPolicy::Temperature { temperature: 1.0 };
        let run = |seed| {
            let mut rng = Rng::new(seed);
            (0..32).map(|_| policy.select(&logits, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
        let distinct: std::collections::HashSet<_> = run(9).into_iter().collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn top_k_and_top_p_stay_inside_their_nucleus() {
        let logits = [5.0, 4.9, 0.0, -1.0, -2.0, 4.8];
        let mut rng = Rng::new(3);
        let top_k = SelectionPolicy::TopK { k: 2, temperature: 1.0 };
        let top_p = SelectionPolicy::TopP { p: 0.3, temperature: 1.0 };
        for _ in 0..200 {
            assert!(matches!(top_k.select(&logits, &mut rng), 0 | 1));
            assert_eq!(top_p.select(&logits, &mut rng), 0);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(SelectionPolicy::TopK { k: 0, temperature: 1.0 }.validate().is_err());
        assert!(SelectionPolicy::TopP { p: 0.0, temperature: 1.0 }.validate().is_err());
        assert!(SelectionPolicy::TopP { p: 1.5, temperature: 1.0 }.validate().is_err());
        assert!(SelectionPolicy::Temperature { temperature: -0.1 }.validate().is_err());
        assert!(SelectionPolicy::Temperature { temperature: f32::NAN }.validate().is_err());
        assert!(SelectionPolicy::default().validate().is_ok());
    }

    #[test]
    fn policies_parse_from_tagged_json() {
        let p: SelectionPolicy = serde_json::from_str(r#"{"type":"top_k","k":5,"temperature":0.7}"#).unwrap();
        assert_eq!(p, SelectionPolicy::TopK { k: 5, temperature: 0.7 });
        let g: SelectionPolicy = serde_json::from_str(r#"{"type":"greedy"}"#).unwrap();
        assert_eq!(g, SelectionPolicy::Greedy);
    }
}
