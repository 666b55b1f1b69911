//! Implicit maximum-likelihood estimation (Niepert et al. 2021).
//!
//! Scores are `θ = -w`. Forward perturbs them with sum-of-Gamma noise `ε_i`
//! (`θ + T_in ε_i`, i.e. costs `w - T_in ε_i`) and solves. Backward builds the target
//! distribution `θ' = α θ - β g` from the upstream gradient `g`, perturbs it with the same
//! draws (`T_t ε_i`) and solves again. The gradient with respect to the weights is
//! \[
//! \nabla_w = \frac{1}{N}\sum_i \left(z'_i - z_i\right) \cdot \frac{1}{\beta}
//! \]
//! with the `1/β` factor applied when gradient scaling is on.

use ndarray::{Array2, ArrayView2};
use rand::RngCore;
use rayon::prelude::*;
use tracing::trace;

use crate::config::{EstimatorConfig, EstimatorKind};
use crate::error::Result;
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::grid::{self, Neighbourhood};
use crate::noise::{NoiseBuffer, SumOfGamma};
use crate::oracle::ShortestPath;

/// IMLE around the exact oracle.
#[derive(Debug, Clone)]
pub struct Imle {
    oracle: ShortestPath,
    noise: SumOfGamma,
    nb_samples: usize,
    input_noise_temperature: f64,
    target_noise_temperature: f64,
    alpha: f64,
    beta: f64,
    scale_gradient: bool,
}

impl Imle {
    /// Builds from the IMLE fields of `config` after validating them.
    pub fn from_config(config: &EstimatorConfig) -> Result<Self> {
        config.validate(EstimatorKind::Imle)?;
        Ok(Self {
            oracle: ShortestPath::new(config.neighbourhood),
            noise: SumOfGamma::new(config.k, config.nb_iterations)?,
            nb_samples: config.nb_samples,
            input_noise_temperature: config.input_noise_temperature,
            target_noise_temperature: config.target_noise_temperature,
            alpha: config.target_alpha,
            beta: config.target_beta,
            scale_gradient: config.imle_gradient_scaling,
        })
    }

    /// Neighbourhood of the wrapped oracle.
    pub fn neighbourhood(&self) -> Neighbourhood {
        self.oracle.neighbourhood()
    }

    fn solve_shifted(
        &self,
        base: &Array2<f64>,
        eps: &Array2<f64>,
        temperature: f64,
    ) -> Result<Array2<f64>> {
        let costs = grid::project_nonnegative(base - &(eps * temperature));
        self.oracle.solve(costs.view())
    }
}

impl Estimator for Imle {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Imle
    }

    /// Output is the mean of the perturbed MAP states.
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        _truth: Option<GroundTruth<'_>>,
        rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        let n = grid::validate_finite(&weights)?;
        let noise = NoiseBuffer::draw_sum_of_gamma(&self.noise, n, self.nb_samples, rng)?;
        let weights = weights.to_owned();
        let paths = noise
            .samples()
            .par_iter()
            .map(|eps| self.solve_shifted(&weights, eps, self.input_noise_temperature))
            .collect::<Result<Vec<_>>>()?;
        let output = grid::mean_of(&paths);
        Ok(Forward::new(output, Saved::Imle {
            weights,
            noise,
            paths,
        }))
    }

    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let Saved::Imle { weights, noise, paths } = forward.saved() else {
            return Err(context_mismatch(self.kind(), forward));
        };
        grid::ensure_same_shape(&weights.view(), &upstream)?;
        grid::validate_finite(&upstream)?;

        // θ' = αθ - βg with θ = -w, i.e. target costs αw + βg.
        let target = weights * self.alpha + &(&upstream * self.beta);
        let targets = noise
            .samples()
            .par_iter()
            .map(|eps| self.solve_shifted(&target, eps, self.target_noise_temperature))
            .collect::<Result<Vec<_>>>()?;

        let mut grad = Array2::<f64>::zeros(weights.dim());
        for (z_target, z) in targets.iter().zip(paths) {
            grad += &(z_target - z);
        }
        let mut scale = 1.0 / paths.len() as f64;
        if self.scale_gradient {
            scale /= self.beta;
        }
        trace!(samples = paths.len(), beta = self.beta, "imle backward");
        Ok(grad * scale)
    }
}
