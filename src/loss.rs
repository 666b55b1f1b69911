//! Path-quality losses: Hamming disagreement and normalized regret.
//!
//! Arguments follow one order throughout: predicted path, true path, true weights.

use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};
use crate::estimator::GroundTruth;
use crate::grid;

/// Mean elementwise disagreement `mean(ŷ(1-y) + (1-ŷ)y)`.
///
/// For 0/1 inputs this is the fraction of cells on exactly one of the two paths; for a
/// relaxed `ŷ` in `[0, 1]` it stays in `[0, 1]`.
pub fn hamming_loss(predicted: ArrayView2<'_, f64>, true_path: ArrayView2<'_, f64>) -> Result<f64> {
    let n = grid::validate_finite(&predicted)?;
    grid::ensure_same_shape(&predicted, &true_path)?;
    grid::validate_path(&true_path)?;
    let total: f64 = predicted
        .iter()
        .zip(true_path.iter())
        .map(|(p, y)| p * (1.0 - y) + (1.0 - p) * y)
        .sum();
    Ok(total / (n * n) as f64)
}

/// `∂ hamming / ∂ŷ = (1 - 2y) / N`: the upstream gradient handed to `backward`.
pub fn hamming_grad(
    predicted: ArrayView2<'_, f64>,
    true_path: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let n = grid::validate_finite(&predicted)?;
    grid::ensure_same_shape(&predicted, &true_path)?;
    grid::validate_path(&true_path)?;
    let scale = 1.0 / (n * n) as f64;
    Ok(true_path.mapv(|y| (1.0 - 2.0 * y) * scale))
}

/// Validates one example and returns `(⟨c, ŷ⟩, ⟨c, y*⟩)`.
fn costs(
    predicted: ArrayView2<'_, f64>,
    true_path: ArrayView2<'_, f64>,
    true_weights: ArrayView2<'_, f64>,
) -> Result<(f64, f64)> {
    grid::validate_finite(&predicted)?;
    grid::ensure_same_shape(&predicted, &true_path)?;
    grid::ensure_same_shape(&predicted, &true_weights)?;
    grid::validate_path(&true_path)?;
    grid::validate_finite(&true_weights)?;
    Ok((grid::dot(&true_weights, &predicted), grid::dot(&true_weights, &true_path)))
}

/// `(⟨c, ŷ⟩ - ⟨c, y*⟩) / ⟨c, y*⟩`, or `0` when the optimal path costs nothing.
///
/// Non-negative whenever `ŷ` is a feasible path and `y*` is optimal for `c`.
pub fn normalized_regret(
    predicted: ArrayView2<'_, f64>,
    true_path: ArrayView2<'_, f64>,
    true_weights: ArrayView2<'_, f64>,
) -> Result<f64> {
    let (pred_cost, opt_cost) = costs(predicted, true_path, true_weights)?;
    if opt_cost == 0.0 {
        return Ok(0.0);
    }
    Ok((pred_cost - opt_cost) / opt_cost)
}

/// `∂ regret / ∂ŷ = c / ⟨c, y*⟩`, zero under the zero-cost convention.
pub fn regret_grad(
    predicted: ArrayView2<'_, f64>,
    true_path: ArrayView2<'_, f64>,
    true_weights: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let (_, opt_cost) = costs(predicted, true_path, true_weights)?;
    if opt_cost == 0.0 {
        return Ok(Array2::zeros(true_weights.dim()));
    }
    Ok(true_weights.mapv(|c| c / opt_cost))
}

fn check_batch(predicted: usize, truths: usize) -> Result<()> {
    if predicted == 0 || predicted != truths {
        return Err(Error::ShapeMismatch {
            expected: (predicted, 1),
            got: (truths, 1),
        });
    }
    Ok(())
}

/// Mean Hamming loss over a minibatch.
pub fn hamming_loss_batch(predicted: &[Array2<f64>], truths: &[GroundTruth<'_>]) -> Result<f64> {
    check_batch(predicted.len(), truths.len())?;
    let mut total = 0.0;
    for (p, t) in predicted.iter().zip(truths) {
        total += hamming_loss(p.view(), t.path)?;
    }
    Ok(total / predicted.len() as f64)
}

/// Minibatch regret `Σ (⟨c, ŷ⟩ - ⟨c, y*⟩) / Σ ⟨c, y*⟩`, or `0` if every optimum is free.
pub fn normalized_regret_batch(
    predicted: &[Array2<f64>],
    truths: &[GroundTruth<'_>],
) -> Result<f64> {
    check_batch(predicted.len(), truths.len())?;
    let (mut excess, mut optimum) = (0.0, 0.0);
    for (p, t) in predicted.iter().zip(truths) {
        let (pred_cost, opt_cost) = costs(p.view(), t.path, t.weights)?;
        excess += pred_cost - opt_cost;
        optimum += opt_cost;
    }
    if optimum == 0.0 {
        return Ok(0.0);
    }
    Ok(excess / optimum)
}
