//! Grid geometry and input validation.
//!
//! Cells are addressed row-major: cell `(r, c)` of an `n×n` grid has index `r*n + c`.
//! The source is `(0, 0)` and the sink is `(n-1, n-1)`.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

/// Legal cell-to-cell moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Neighbourhood {
    /// Horizontal and vertical moves.
    #[serde(rename = "4-grid")]
    Four,
    /// Horizontal, vertical and diagonal moves.
    #[default]
    #[serde(rename = "8-grid")]
    Eight,
}

const FOUR: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
const EIGHT: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

impl Neighbourhood {
    /// Move offsets, in row-major order. The order is part of the oracle's tie-break.
    pub fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Neighbourhood::Four => &FOUR,
            Neighbourhood::Eight => &EIGHT,
        }
    }

    /// Row-major indices of the cells adjacent to `(r, c)` in an `n×n` grid.
    pub fn neighbours(self, n: usize, r: usize, c: usize) -> impl Iterator<Item = usize> {
        self.offsets().iter().filter_map(move |&(dr, dc)| {
            let rr = r.checked_add_signed(dr)?;
            let cc = c.checked_add_signed(dc)?;
            (rr < n && cc < n).then_some(rr * n + cc)
        })
    }

    /// Whether `a` and `b` (as `(row, col)`) are adjacent.
    pub fn adjacent(self, a: (usize, usize), b: (usize, usize)) -> bool {
        let dr = a.0.abs_diff(b.0);
        let dc = a.1.abs_diff(b.1);
        match self {
            Neighbourhood::Four => dr + dc == 1,
            Neighbourhood::Eight => dr.max(dc) == 1,
        }
    }
}

impl fmt::Display for Neighbourhood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Neighbourhood::Four => f.write_str("4-grid"),
            Neighbourhood::Eight => f.write_str("8-grid"),
        }
    }
}

impl FromStr for Neighbourhood {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4-grid" => Ok(Neighbourhood::Four),
            "8-grid" => Ok(Neighbourhood::Eight),
            other => Err(Error::Config(format!(
                "unknown neighbourhood {other:?}, expected \"4-grid\" or \"8-grid\""
            ))),
        }
    }
}

/// Checks that the grid is square, non-empty and finite. Returns `n`.
pub fn validate_finite(weights: &ArrayView2<'_, f64>) -> Result<usize> {
    let (rows, cols) = weights.dim();
    if rows == 0 || rows != cols {
        return Err(Error::InvalidShape { rows, cols });
    }
    for ((row, col), &value) in weights.indexed_iter() {
        if !value.is_finite() {
            return Err(Error::NonFiniteWeight { row, col, value });
        }
    }
    Ok(rows)
}

/// [`validate_finite`] plus non-negativity, the oracle's input contract.
pub fn validate_weights(weights: &ArrayView2<'_, f64>) -> Result<usize> {
    let n = validate_finite(weights)?;
    for ((row, col), &value) in weights.indexed_iter() {
        if value < 0.0 {
            return Err(Error::NegativeWeight { row, col, value });
        }
    }
    Ok(n)
}

/// Checks that every entry is exactly 0 or 1.
pub fn validate_path(path: &ArrayView2<'_, f64>) -> Result<usize> {
    let n = validate_finite(path)?;
    for ((row, col), &value) in path.indexed_iter() {
        if value != 0.0 && value != 1.0 {
            return Err(Error::InvalidPath { row, col, value });
        }
    }
    Ok(n)
}

/// Fails unless `b` has the same shape as `a`.
pub fn ensure_same_shape(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(Error::ShapeMismatch {
            expected: a.dim(),
            got: b.dim(),
        });
    }
    Ok(())
}

/// Frobenius inner product; `⟨weights, path⟩` is the path's cost.
pub fn dot(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Clamps every entry at zero so a perturbed grid is a legal oracle input.
pub fn project_nonnegative(mut grid: Array2<f64>) -> Array2<f64> {
    grid.mapv_inplace(|v| v.max(0.0));
    grid
}

/// Element-wise mean of equally shaped grids. `grids` must be non-empty.
pub(crate) fn mean_of(grids: &[Array2<f64>]) -> Array2<f64> {
    let mut acc = Array2::zeros(grids[0].dim());
    for g in grids {
        acc += g;
    }
    acc / grids.len() as f64
}
