//! Perturb-and-MAP optimizers (Berthet et al. 2020).
//!
//! With scores `θ = -w` (the oracle minimises cost, the perturbed optimizer maximises
//! score), noise draws `Z_1..Z_N` and scale `σ`:
//! \[
//! \hat y_\sigma(\theta) = \frac{1}{N}\sum_i y^*(\theta + \sigma Z_i), \qquad
//! \nabla_\theta \langle g, \hat y_\sigma\rangle \approx \frac{1}{N\sigma}\sum_i \langle y_i, g\rangle\, \nabla\nu(Z_i),
//! \]
//! where `∇ν(z) = z` for Gaussian and `1 - e^{-z}` for Gumbel noise. The gradient with
//! respect to the weights is the negation.

use ndarray::{Array2, ArrayView2};
use rand::RngCore;
use rayon::prelude::*;
use tracing::trace;

use crate::config::EstimatorKind;
use crate::error::{Error, Result};
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::grid::{self, Neighbourhood};
use crate::noise::{NoiseBuffer, NoiseKind};
use crate::oracle::ShortestPath;

/// Sampling parameters shared by the perturbation-based strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sampler {
    pub(crate) sigma: f64,
    pub(crate) num_samples: usize,
    pub(crate) noise: NoiseKind,
    pub(crate) oracle: ShortestPath,
}

impl Sampler {
    pub(crate) fn new(
        sigma: f64,
        num_samples: usize,
        noise: NoiseKind,
        neighbourhood: Neighbourhood,
    ) -> Result<Self> {
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "sigma",
                value: sigma,
                expected: "> 0 and finite",
            });
        }
        if num_samples == 0 {
            return Err(Error::InvalidParameter {
                name: "num_samples",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(Self {
            sigma,
            num_samples,
            noise,
            oracle: ShortestPath::new(neighbourhood),
        })
    }

    /// Draws the noise buffer and solves `w - σZ_i` (scores `θ + σZ_i`) per sample.
    pub(crate) fn sample(
        &self,
        weights: ArrayView2<'_, f64>,
        rng: &mut dyn RngCore,
    ) -> Result<(NoiseBuffer, Vec<Array2<f64>>)> {
        let n = grid::validate_finite(&weights)?;
        let noise = NoiseBuffer::draw(self.noise, n, self.num_samples, rng)?;
        let paths = noise
            .samples()
            .par_iter()
            .map(|z| {
                let perturbed = grid::project_nonnegative(&weights - &(z * self.sigma));
                self.oracle.solve(perturbed.view())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((noise, paths))
    }
}

/// Perturbed optimizer; the DPO preset uses Gumbel noise.
#[derive(Debug, Clone)]
pub struct Perturbed {
    sampler: Sampler,
}

impl Perturbed {
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

    /// Gumbel-noise perturbed optimizer with the given scale and sample count.
    pub fn dpo(sigma: f64, num_samples: usize, neighbourhood: Neighbourhood) -> Result<Self> {
        Self::new(sigma, num_samples, NoiseKind::Gumbel, neighbourhood)
    }

    /// Noise family.
    pub fn noise(&self) -> NoiseKind {
        self.sampler.noise
    }
}

impl Estimator for Perturbed {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Perturbed
    }

    /// Output is the mean of the per-sample oracle paths.
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        _truth: Option<GroundTruth<'_>>,
        rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        let (noise, paths) = self.sampler.sample(weights, rng)?;
        let output = grid::mean_of(&paths);
        trace!(samples = paths.len(), sigma = self.sampler.sigma, "perturbed forward");
        Ok(Forward::new(output, Saved::Perturbed { noise, paths }))
    }

    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let Saved::Perturbed { noise, paths } = forward.saved() else {
            return Err(context_mismatch(self.kind(), forward));
        };
        grid::ensure_same_shape(&forward.output().view(), &upstream)?;
        grid::validate_finite(&upstream)?;

        let kind = self.sampler.noise;
        let mut grad_scores = Array2::<f64>::zeros(upstream.dim());
        for (z, y) in noise.samples().iter().zip(paths) {
            let weight = grid::dot(&y.view(), &upstream);
            grad_scores.zip_mut_with(z, |g, &zi| *g += weight * kind.score(zi));
        }
        let scale = self.sampler.sigma * noise.len() as f64;
        Ok(grad_scores * (-1.0 / scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn grid5() -> Array2<f64> {
        Array2::from_shape_fn((5, 5), |(r, c)| {
            if r == c {
                1.0
            } else {
                4.0 + (r * 5 + c) as f64 % 3.0
            }
        })
    }

    #[test]
    fn rejects_bad_sampling_parameters() {
        assert!(Perturbed::new(0.0, 5, NoiseKind::Gaussian, Neighbourhood::Eight).is_err());
        assert!(Perturbed::new(-1.0, 5, NoiseKind::Gaussian, Neighbourhood::Eight).is_err());
        assert!(Perturbed::new(1.0, 0, NoiseKind::Gaussian, Neighbourhood::Eight).is_err());
    }

    #[test]
    fn vanishing_noise_recovers_the_exact_path() {
        let w = grid5();
        let exact = ShortestPath::new(Neighbourhood::Eight).solve(w.view()).unwrap();
        for noise in [NoiseKind::Gaussian, NoiseKind::Gumbel] {
            let est = Perturbed::new(1e-6, 8, noise, Neighbourhood::Eight).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(1);
            let fwd = est.forward(w.view(), None, &mut rng).unwrap();
            assert_eq!(fwd.output(), &exact);
        }
    }

    #[test]
    fn output_is_a_mean_of_paths() {
        let w = grid5();
        let est = Perturbed::dpo(3.0, 20, Neighbourhood::Eight).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let fwd = est.forward(w.view(), None, &mut rng).unwrap();
        let y = fwd.output();
        assert!(y.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(y[(0, 0)], 1.0);
        assert_eq!(y[(4, 4)], 1.0);
    }

    #[test]
    fn backward_reuses_forward_noise() {
        let w = grid5();
        let g = Array2::from_elem((5, 5), 0.3);
        let est = Perturbed::new(1.0, 6, NoiseKind::Gaussian, Neighbourhood::Eight).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let fwd = est.forward(w.view(), None, &mut rng).unwrap();
        // Two backward passes on one context agree exactly.
        let a = est.backward(&fwd, g.view()).unwrap();
        let b = est.backward(&fwd, g.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn score_function_matches_hand_computation() {
        let w = array![[1.0, 5.0], [5.0, 1.0]];
        let est = Perturbed::new(0.5, 2, NoiseKind::Gaussian, Neighbourhood::Eight).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let fwd = est.forward(w.view(), None, &mut rng).unwrap();
        let Saved::Perturbed { noise, paths } = fwd.saved() else { unreachable!() };
        let up = array![[0.0, 1.0], [2.0, 0.0]];
        let mut expected = Array2::<f64>::zeros((2, 2));
        for (z, y) in noise.samples().iter().zip(paths) {
            let s: f64 = y.iter().zip(up.iter()).map(|(a, b)| a * b).sum();
            expected = expected + z * s;
        }
        expected = expected * (-1.0 / (0.5 * 2.0));
        let got = est.backward(&fwd, up.view()).unwrap();
        for (a, b) in got.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
