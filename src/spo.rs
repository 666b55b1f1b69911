//! SPO+ subgradient (Elmachtoub & Grigas 2022), the "smart predict, then optimize" loss.
//!
//! For true costs `c` with optimal path `y*`, the SPO+ surrogate
//! \[
//! \ell(w) = \max_y \langle c - 2w, y\rangle + 2\langle w, y^*\rangle - \langle c, y^*\rangle
//! \]
//! is convex in `w` with subgradient `2(y* - y(2w - c))`. We drop the constant factor:
//! the gradient is `true_path - y(2w - c)`, whatever the downstream loss.

use ndarray::{Array2, ArrayView2};
use rand::RngCore;
use tracing::trace;

use crate::config::EstimatorKind;
use crate::error::{Error, Result};
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::grid::{self, Neighbourhood};
use crate::oracle::ShortestPath;

/// Loss-augmented double solve.
#[derive(Debug, Clone)]
pub struct Spo {
    oracle: ShortestPath,
}

impl Spo {
    /// SPO+ around the oracle for `neighbourhood`.
    pub fn new(neighbourhood: Neighbourhood) -> Self {
        Self {
            oracle: ShortestPath::new(neighbourhood),
        }
    }
}

impl Estimator for Spo {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Spo
    }

    /// Output is the oracle path for `weights`; the loss is SPO+ (up to the factor 2).
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        truth: Option<GroundTruth<'_>>,
        _rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        grid::validate_finite(&weights)?;
        let truth = truth.ok_or(Error::MissingGroundTruth("spo"))?;
        truth.check_against(&weights)?;

        let path = self.oracle.solve(weights)?;
        let augmented = grid::project_nonnegative(&weights * 2.0 - &truth.weights);
        let (aug_path, aug_cost) = self.oracle.solve_with_cost(augmented.view())?;

        // ℓ/2 = ⟨w, y*⟩ - ⟨2w - c, y_aug⟩/2 - ⟨c, y*⟩/2, evaluated on the clamped grid.
        let loss = grid::dot(&weights, &truth.path)
            - 0.5 * aug_cost
            - 0.5 * grid::dot(&truth.weights, &truth.path);
        let gradient = &truth.path - &aug_path;
        trace!(loss, disagreement = gradient.mapv(f64::abs).sum(), "spo+");

        let saved = Saved::Direction {
            from: EstimatorKind::Spo,
            gradient,
        };
        Ok(Forward::new(path, saved).with_loss(loss))
    }

    /// The subgradient does not depend on `upstream`; it is only shape-checked.
    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        match forward.saved() {
            Saved::Direction { from: EstimatorKind::Spo, gradient } => {
                grid::ensure_same_shape(&gradient.view(), &upstream)?;
                Ok(gradient.clone())
            }
            _ => Err(context_mismatch(self.kind(), forward)),
        }
    }
}
