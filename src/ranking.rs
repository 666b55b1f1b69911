//! Ranking losses over a set of candidate paths (Mandi et al. 2022).
//!
//! Every candidate `y_k` has a true cost `t_k = ⟨c, y_k⟩` and a predicted cost
//! `p_k = ⟨w, y_k⟩`. A loss is a function of `p`; its gradient with respect to the
//! predicted weights is `Σ_k (∂L/∂p_k) y_k`.

use ndarray::Array2;

use crate::config::{RankingConfig, RankingKind};
use crate::error::Result;

/// Candidates of one example with their true and predicted costs.
///
/// The true path comes first; the remaining candidates are distinct cache entries.
#[derive(Debug, Clone)]
pub struct RankingBatch {
    pub(crate) candidates: Vec<Array2<f64>>,
    pub(crate) true_costs: Vec<f64>,
    pub(crate) predicted_costs: Vec<f64>,
}

/// Loss value and its gradient with respect to the predicted weights.
#[derive(Debug, Clone)]
pub struct RankingLoss {
    /// Scalar loss.
    pub value: f64,
    /// `∂loss/∂w`, same shape as the weights.
    pub gradient: Array2<f64>,
    /// Objective actually evaluated, after any fallback to pointwise.
    pub evaluated: RankingKind,
}

impl RankingBatch {
    /// Candidate paths, true path first.
    pub fn candidates(&self) -> &[Array2<f64>] {
        &self.candidates
    }

    /// `⟨c, y_k⟩` per candidate.
    pub fn true_costs(&self) -> &[f64] {
        &self.true_costs
    }

    /// `⟨w, y_k⟩` per candidate.
    pub fn predicted_costs(&self) -> &[f64] {
        &self.predicted_costs
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false: the true path is a candidate.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Pairs `(i, j)` with `t_i < t_j`: `i` should rank ahead of `j`.
    fn ordered_pairs(&self) -> Vec<(usize, usize)> {
        let t = &self.true_costs;
        let mut pairs = Vec::new();
        for i in 0..t.len() {
            for j in 0..t.len() {
                if t[i] < t[j] {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }

    /// Evaluates the configured objective.
    ///
    /// Pair- and list-based objectives need two candidates with different true costs;
    /// without them the pointwise objective is evaluated instead.
    pub fn loss(&self, config: &RankingConfig) -> Result<RankingLoss> {
        config.validate()?;
        let pairs = self.ordered_pairs();
        let kind = if pairs.is_empty() { RankingKind::Pointwise } else { config.loss };
        let (value, d_pred) = match kind {
            RankingKind::Pointwise => self.pointwise(),
            RankingKind::Pairwise => self.pairwise(&pairs, config.tau),
            RankingKind::PairwiseDiff => self.pairwise_diff(&pairs),
            RankingKind::Listwise => self.listwise(config.tau),
        };
        Ok(RankingLoss {
            value,
            gradient: self.pull_back(&d_pred),
            evaluated: kind,
        })
    }

    fn pull_back(&self, d_pred: &[f64]) -> Array2<f64> {
        let mut grad = Array2::zeros(self.candidates[0].dim());
        for (y, &d) in self.candidates.iter().zip(d_pred) {
            if d != 0.0 {
                grad.scaled_add(d, y);
            }
        }
        grad
    }

    fn pointwise(&self) -> (f64, Vec<f64>) {
        let k = self.len() as f64;
        let residuals: Vec<f64> = self
            .predicted_costs
            .iter()
            .zip(&self.true_costs)
            .map(|(p, t)| p - t)
            .collect();
        let value = residuals.iter().map(|r| r * r).sum::<f64>() / k;
        (value, residuals.iter().map(|r| 2.0 * r / k).collect())
    }

    fn pairwise(&self, pairs: &[(usize, usize)], tau: f64) -> (f64, Vec<f64>) {
        let p = &self.predicted_costs;
        let scale = 1.0 / pairs.len() as f64;
        let mut value = 0.0;
        let mut d = vec![0.0; p.len()];
        for &(i, j) in pairs {
            let margin = tau + p[i] - p[j];
            if margin > 0.0 {
                value += margin;
                d[i] += scale;
                d[j] -= scale;
            }
        }
        (value * scale, d)
    }

    fn pairwise_diff(&self, pairs: &[(usize, usize)]) -> (f64, Vec<f64>) {
        let (p, t) = (&self.predicted_costs, &self.true_costs);
        let scale = 1.0 / pairs.len() as f64;
        let mut value = 0.0;
        let mut d = vec![0.0; p.len()];
        for &(i, j) in pairs {
            let r = (p[i] - p[j]) - (t[i] - t[j]);
            value += r * r;
            d[i] += 2.0 * r * scale;
            d[j] -= 2.0 * r * scale;
        }
        (value * scale, d)
    }

    fn listwise(&self, tau: f64) -> (f64, Vec<f64>) {
        let target = softmax_neg(&self.true_costs, tau);
        let logits: Vec<f64> = self.predicted_costs.iter().map(|p| -p / tau).collect();
        let lse = log_sum_exp(&logits);
        let value = -target
            .iter()
            .zip(&logits)
            .map(|(q, l)| q * (l - lse))
            .sum::<f64>();
        let d = target
            .iter()
            .zip(&logits)
            .map(|(q, l)| (q - (l - lse).exp()) / tau)
            .collect();
        (value, d)
    }
}

fn log_sum_exp(xs: &[f64]) -> f64 {
    let m = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !m.is_finite() {
        return m;
    }
    let s: f64 = xs.iter().map(|x| (x - m).exp()).sum();
    m + s.ln()
}

/// `softmax(-x / τ)`.
fn softmax_neg(xs: &[f64], tau: f64) -> Vec<f64> {
    let logits: Vec<f64> = xs.iter().map(|x| -x / tau).collect();
    let lse = log_sum_exp(&logits);
    logits.iter().map(|l| (l - lse).exp()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn batch(true_costs: Vec<f64>, predicted_costs: Vec<f64>) -> RankingBatch {
        let candidates = (0..true_costs.len())
            .map(|k| Array2::from_shape_fn((2, 2), |(r, c)| ((r * 2 + c + k) % 2) as f64))
            .collect();
        RankingBatch {
            candidates,
            true_costs,
            predicted_costs,
        }
    }

    fn config(loss: RankingKind, tau: f64) -> RankingConfig {
        RankingConfig {
            loss,
            tau,
            ..Default::default()
        }
    }

    #[test]
    fn pointwise_is_mean_squared_error() {
        let b = batch(vec![1.0, 3.0], vec![2.0, 3.0]);
        let l = b.loss(&config(RankingKind::Pointwise, 0.0)).unwrap();
        assert!((l.value - 0.5).abs() < 1e-12);
        // ∂L/∂p = [1, 0], so the gradient is the first candidate.
        assert_eq!(l.gradient, b.candidates[0]);
    }

    #[test]
    fn pairwise_hinge_only_penalises_misranked_pairs() {
        let ranked = batch(vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0]);
        let l = ranked.loss(&config(RankingKind::Pairwise, 0.0)).unwrap();
        assert_eq!(l.value, 0.0);
        assert!(l.gradient.iter().all(|&v| v == 0.0));

        let with_margin = ranked.loss(&config(RankingKind::Pairwise, 1.5)).unwrap();
        // Pairs (0,1) and (1,2) have gap 1 < 1.5, pair (0,2) has gap 2.
        assert!((with_margin.value - (0.5 + 0.5) / 3.0).abs() < 1e-12);

        let misranked = batch(vec![1.0, 2.0], vec![5.0, 2.0]);
        let l = misranked.loss(&config(RankingKind::Pairwise, 0.0)).unwrap();
        assert!((l.value - 3.0).abs() < 1e-12);
        let expected = &misranked.candidates[0] - &misranked.candidates[1];
        assert_eq!(l.gradient, expected);
    }

    #[test]
    fn pairwise_diff_vanishes_for_shifted_costs() {
        let b = batch(vec![1.0, 2.0, 4.0], vec![11.0, 12.0, 14.0]);
        let l = b.loss(&config(RankingKind::PairwiseDiff, 0.0)).unwrap();
        assert!(l.value.abs() < 1e-12);
        assert_eq!(l.evaluated, RankingKind::PairwiseDiff);
    }

    #[test]
    fn listwise_matches_cross_entropy() {
        let b = batch(vec![0.0, 1.0], vec![0.0, 0.0]);
        let l = b.loss(&config(RankingKind::Listwise, 1.0)).unwrap();
        let q0 = 1.0 / (1.0 + (-1.0f64).exp());
        // Uniform prediction: cross-entropy is ln 2 whatever the target.
        assert!((l.value - 2f64.ln()).abs() < 1e-12);
        let expected = &b.candidates[0] * (q0 - 0.5) + &b.candidates[1] * ((1.0 - q0) - 0.5);
        for (a, e) in l.gradient.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12);
        }
    }

    #[test]
    fn degenerate_batches_fall_back_to_pointwise() {
        let single = batch(vec![3.0], vec![4.0]);
        for kind in [RankingKind::Pairwise, RankingKind::PairwiseDiff, RankingKind::Listwise] {
            let l = single.loss(&config(kind, 0.5)).unwrap();
            assert_eq!(l.evaluated, RankingKind::Pointwise);
            assert!((l.value - 1.0).abs() < 1e-12);
        }
        let ties = batch(vec![2.0, 2.0], vec![1.0, 3.0]);
        let l = ties.loss(&config(RankingKind::Pairwise, 0.5)).unwrap();
        assert_eq!(l.evaluated, RankingKind::Pointwise);
    }

    #[test]
    fn listwise_requires_positive_temperature() {
        let b = batch(vec![0.0, 1.0], vec![0.0, 0.0]);
        assert!(b.loss(&config(RankingKind::Listwise, 0.0)).is_err());
        assert!(b.loss(&config(RankingKind::Pairwise, -1.0)).is_err());
    }

    #[test]
    fn log_sum_exp_is_stable() {
        assert!((log_sum_exp(&[1000.0, 1000.0]) - (1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        let probs = softmax_neg(&[1e4, 1e4 + 1.0], 1.0);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(probs[0] > probs[1]);
    }

    proptest! {
        #[test]
        fn losses_are_non_negative_and_finite(
            t in prop::collection::vec(0.0f64..10.0, 1..6),
            shift in prop::collection::vec(-5.0f64..5.0, 6),
            tau in 0.1f64..2.0,
        ) {
            let p: Vec<f64> = t.iter().zip(&shift).map(|(a, b)| a + b).collect();
            let b = batch(t, p);
            for kind in [
                RankingKind::Pointwise,
                RankingKind::Pairwise,
                RankingKind::PairwiseDiff,
                RankingKind::Listwise,
            ] {
                let l = b.loss(&config(kind, tau)).unwrap();
                prop_assert!(l.value >= -1e-12 && l.value.is_finite());
                prop_assert!(l.gradient.iter().all(|v| v.is_finite()));
            }
        }
    }
}
