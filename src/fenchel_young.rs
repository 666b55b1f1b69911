//! Fenchel-Young loss with perturbation-induced regularisation (Berthet et al. 2020).
//!
//! In cost form (minimisation) with noise draws `Z_i`:
//! \[
//! \ell(w; y) = \langle w, y\rangle - \frac{1}{N}\sum_i \min_{y'} \langle w - \sigma Z_i, y'\rangle,
//! \qquad \nabla_w \ell = y - \hat y_\sigma(w).
//! \]
//! Equivalently, the gradient with respect to the scores `θ = -w` is `ŷ - y`.
//! The loss is non-negative up to the clamp that keeps perturbed grids in the oracle's
//! domain.

use ndarray::{Array2, ArrayView2};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::trace;

use crate::config::EstimatorKind;
use crate::error::{Error, Result};
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::grid::{self, Neighbourhood};
use crate::noise::{NoiseBuffer, NoiseKind};
use crate::perturbed::Sampler;

/// Perturbed Fenchel-Young loss.
#[derive(Debug, Clone)]
pub struct FenchelYoung {
    sampler: Sampler,
}

/// Mean loss and per-example gradients of a minibatch.
#[derive(Debug, Clone)]
pub struct BatchLoss {
    /// Mean of the per-example losses.
    pub loss: f64,
    /// Gradient of each example's loss with respect to its weights.
    pub gradients: Vec<Array2<f64>>,
}

impl FenchelYoung {
    /// `sigma > 0`, `num_samples ≥ 1`.
    pub fn new(
        sigma: f64,
        num_samples: usize,
        noise: NoiseKind,
        neighbourhood: Neighbourhood,
    ) -> Result<Self> {
        Ok(Self {
            sampler: Sampler::new(sigma, num_samples, noise, neighbourhood)?,
        })
    }

    /// Evaluates the loss on a minibatch in parallel.
    pub fn loss_batch(
        &self,
        weights: &[Array2<f64>],
        truths: &[GroundTruth<'_>],
        rng: &mut dyn RngCore,
    ) -> Result<BatchLoss> {
        if weights.is_empty() || weights.len() != truths.len() {
            return Err(Error::ShapeMismatch {
                expected: (weights.len(), 1),
                got: (truths.len(), 1),
            });
        }
        let seeds: Vec<u64> = weights.iter().map(|_| rng.next_u64()).collect();
        let per_example = weights
            .par_iter()
            .zip(truths.par_iter())
            .zip(seeds.par_iter())
            .map(|((w, t), &seed)| {
                let mut local = ChaCha8Rng::seed_from_u64(seed);
                self.evaluate(w.view(), *t, &mut local)
            })
            .collect::<Result<Vec<_>>>()?;

        let loss = per_example.iter().map(|(l, _, _)| l).sum::<f64>() / per_example.len() as f64;
        let gradients = per_example.into_iter().map(|(_, _, g)| g).collect();
        Ok(BatchLoss { loss, gradients })
    }

    /// Loss, perturbed mean path and gradient for one example.
    fn evaluate(
        &self,
        weights: ArrayView2<'_, f64>,
        truth: GroundTruth<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(f64, Array2<f64>, Array2<f64>)> {
        grid::validate_finite(&weights)?;
        truth.check_against(&weights)?;
        let (noise, paths) = self.sampler.sample(weights, rng)?;
        let sigma = self.sampler.sigma;
        let min_cost = perturbed_min_cost(&weights, sigma, &noise, &paths);
        let loss = grid::dot(&weights, &truth.path) - min_cost;
        let mean = grid::mean_of(&paths);
        let gradient = &truth.path - &mean;
        Ok((loss, mean, gradient))
    }
}

/// `mean_i ⟨max(w - σZ_i, 0), y_i⟩`: the smoothed minimum cost.
fn perturbed_min_cost(
    weights: &ArrayView2<'_, f64>,
    sigma: f64,
    noise: &NoiseBuffer,
    paths: &[Array2<f64>],
) -> f64 {
    let total: f64 = noise
        .samples()
        .iter()
        .zip(paths)
        .map(|(z, y)| {
            weights
                .iter()
                .zip(z.iter())
                .zip(y.iter())
                .map(|((w, z), y)| (w - sigma * z).max(0.0) * y)
                .sum::<f64>()
        })
        .sum();
    total / paths.len() as f64
}

impl Estimator for FenchelYoung {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::FenchelYoung
    }

    /// Output is the perturbed mean path; the loss is attached to the context.
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        truth: Option<GroundTruth<'_>>,
        rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        grid::validate_finite(&weights)?;
        let truth = truth.ok_or(Error::MissingGroundTruth("fenchel_young"))?;
        let (loss, mean, gradient) = self.evaluate(weights, truth, rng)?;
        trace!(loss, "fenchel-young forward");
        let saved = Saved::Direction {
            from: EstimatorKind::FenchelYoung,
            gradient,
        };
        Ok(Forward::new(mean, saved).with_loss(loss))
    }

    /// Gradient of the Fenchel-Young loss itself; `upstream` is only shape-checked.
    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        match forward.saved() {
            Saved::Direction { from: EstimatorKind::FenchelYoung, gradient } => {
                grid::ensure_same_shape(&gradient.view(), &upstream)?;
                Ok(gradient.clone())
            }
            _ => Err(context_mismatch(self.kind(), forward)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ShortestPath;
    use ndarray::array;

    fn toy() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let w = array![[1.0, 9.0, 9.0], [1.0, 9.0, 9.0], [1.0, 1.0, 1.0]];
        let c = array![[1.0, 1.0, 1.0], [9.0, 9.0, 1.0], [9.0, 9.0, 1.0]];
        let y = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        (w, c, y)
    }

    #[test]
    fn gradient_is_truth_minus_perturbed_mean() {
        let (w, c, y) = toy();
        let fy = FenchelYoung::new(0.5, 16, NoiseKind::Gaussian, Neighbourhood::Four).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let fwd = fy
            .forward(w.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
            .unwrap();
        let g = fy.backward(&fwd, y.view()).unwrap();
        let expected = &y - fwd.output();
        assert_eq!(g, expected);
        assert!(fwd.loss().unwrap() > 0.0);
    }

    #[test]
    fn loss_subtracts_the_minimum_over_downshifted_costs() {
        // Gumbel noise has a non-zero mean, so the sign of the shift shows in the value.
        let (w, c, y) = toy();
        let sigma = 0.7;
        let fy = FenchelYoung::new(sigma, 6, NoiseKind::Gumbel, Neighbourhood::Four).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let fwd = fy
            .forward(w.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
            .unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let noise = NoiseBuffer::draw(NoiseKind::Gumbel, 3, 6, &mut rng).unwrap();
        let oracle = ShortestPath::new(Neighbourhood::Four);
        let min_cost = |shift: f64| {
            noise
                .samples()
                .iter()
                .map(|z| {
                    let costs = grid::project_nonnegative(&w + &(z * shift));
                    oracle.solve_with_cost(costs.view()).unwrap().1
                })
                .sum::<f64>()
                / noise.len() as f64
        };
        let expected = grid::dot(&w.view(), &y.view()) - min_cost(-sigma);
        let loss = fwd.loss().unwrap();
        assert!((loss - expected).abs() < 1e-9, "{loss} vs {expected}");
        let upshifted = grid::dot(&w.view(), &y.view()) - min_cost(sigma);
        assert!((loss - upshifted).abs() > 1e-6);
    }

    #[test]
    fn loss_vanishes_when_truth_is_the_clear_optimum() {
        let (_, c, y) = toy();
        let fy = FenchelYoung::new(1e-6, 4, NoiseKind::Gaussian, Neighbourhood::Four).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let fwd = fy
            .forward(c.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
            .unwrap();
        assert!(fwd.loss().unwrap().abs() < 1e-4);
        let g = fy.backward(&fwd, y.view()).unwrap();
        assert!(g.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn descent_moves_prediction_to_truth() {
        let (mut w, c, y) = toy();
        let fy = FenchelYoung::new(0.5, 8, NoiseKind::Gaussian, Neighbourhood::Four).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..20 {
            let fwd = fy
                .forward(w.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
                .unwrap();
            let g = fy.backward(&fwd, y.view()).unwrap();
            w = grid::project_nonnegative(&w - &(g * 2.0));
        }
        assert_eq!(ShortestPath::new(Neighbourhood::Four).solve(w.view()).unwrap(), y);
    }

    #[test]
    fn batch_loss_matches_single_evaluations_in_size() {
        let (w, c, y) = toy();
        let fy = FenchelYoung::new(0.5, 4, NoiseKind::Gumbel, Neighbourhood::Four).unwrap();
        let truths = [GroundTruth::new(y.view(), c.view()), GroundTruth::new(y.view(), c.view())];
        let batch = vec![w.clone(), c.clone()];
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let out = fy.loss_batch(&batch, &truths, &mut rng).unwrap();
        assert_eq!(out.gradients.len(), 2);
        assert!(out.loss.is_finite());
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let again = fy.loss_batch(&batch, &truths, &mut rng).unwrap();
        assert_eq!(out.loss, again.loss);
        assert!(fy.loss_batch(&batch, &truths[..1], &mut rng).is_err());
    }
}
