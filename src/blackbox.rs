//! Blackbox differentiation of a combinatorial solver (Vlastelica et al. 2020).
//!
//! The piecewise-constant map `w ↦ y(w)` is replaced in the backward pass by a linear
//! interpolation: with upstream gradient \(g = \partial L/\partial y\),
//! \[
//! y_\lambda = y(w + \lambda g), \qquad \nabla_w f_\lambda = -\frac{1}{\lambda}\left(y(w) - y_\lambda\right).
//! \]
//! Larger `lambda` trades locality for a more informative (non-zero) signal.

use ndarray::{Array2, ArrayView2};
use rand::RngCore;
use tracing::trace;

use crate::config::EstimatorKind;
use crate::error::{Error, Result};
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::grid::{self, Neighbourhood};
use crate::oracle::ShortestPath;

/// Blackbox interpolation around the exact oracle.
#[derive(Debug, Clone)]
pub struct Blackbox {
    lambda: f64,
    oracle: ShortestPath,
}

impl Blackbox {
    /// `lambda` must be positive and finite.
    pub fn new(lambda: f64, neighbourhood: Neighbourhood) -> Result<Self> {
        if !(lambda > 0.0 && lambda.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "lambda",
                value: lambda,
                expected: "> 0 and finite",
            });
        }
        Ok(Self {
            lambda,
            oracle: ShortestPath::new(neighbourhood),
        })
    }

    /// Interpolation magnitude.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Estimator for Blackbox {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Blackbox
    }

    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        _truth: Option<GroundTruth<'_>>,
        _rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        let path = self.oracle.solve(weights)?;
        Ok(Forward::new(
            path.clone(),
            Saved::Blackbox {
                weights: weights.to_owned(),
                path,
            },
        ))
    }

    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let Saved::Blackbox { weights, path } = forward.saved() else {
            return Err(context_mismatch(self.kind(), forward));
        };
        grid::ensure_same_shape(&weights.view(), &upstream)?;
        grid::validate_finite(&upstream)?;

        let shifted = grid::project_nonnegative(weights + &(&upstream * self.lambda));
        let better = self.oracle.solve(shifted.view())?;
        trace!(
            lambda = self.lambda,
            changed = (&better - path).mapv(f64::abs).sum(),
            "blackbox interpolation"
        );
        Ok((path - &better) * (-1.0 / self.lambda))
    }
}
