//! Exact shortest path on a vertex-weighted grid (Dijkstra).
//!
//! The cost of a path is the sum of the weights of every cell it visits, source and
//! sink included. The oracle returns the minimising path from `(0, 0)` to `(n-1, n-1)`
//! as a 0/1 matrix.
//!
//! Tie-break: the frontier pops the smallest `(distance, row-major index)` pair, a
//! cell's predecessor only changes on a strict improvement, and neighbours are scanned
//! in [`Neighbourhood::offsets`] order. Equal inputs therefore give equal outputs.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::grid::{self, Neighbourhood};

/// Heap key ordered by distance, then by cell index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Frontier {
    dist: f64,
    cell: usize,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.cell.cmp(&other.cell))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shortest-path oracle over a fixed neighbourhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShortestPath {
    neighbourhood: Neighbourhood,
}

impl ShortestPath {
    /// Oracle over the given neighbourhood.
    pub fn new(neighbourhood: Neighbourhood) -> Self {
        Self { neighbourhood }
    }

    /// Neighbourhood this oracle searches.
    pub fn neighbourhood(&self) -> Neighbourhood {
        self.neighbourhood
    }

    /// Minimum-weight path as a 0/1 matrix.
    pub fn solve(&self, weights: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.solve_with_cost(weights).map(|(path, _)| path)
    }

    /// Minimum-weight path and its cost.
    pub fn solve_with_cost(&self, weights: ArrayView2<'_, f64>) -> Result<(Array2<f64>, f64)> {
        let n = grid::validate_weights(&weights)?;
        let v = n * n;
        let sink = v - 1;

        let mut dist = vec![f64::INFINITY; v];
        let mut prev = vec![usize::MAX; v];
        let mut done = vec![false; v];
        let mut heap = BinaryHeap::with_capacity(v);

        dist[0] = weights[(0, 0)];
        heap.push(Reverse(Frontier {
            dist: dist[0],
            cell: 0,
        }));

        while let Some(Reverse(Frontier { dist: d, cell: u })) = heap.pop() {
            if done[u] {
                continue;
            }
            done[u] = true;
            if u == sink {
                break;
            }
            let (r, c) = (u / n, u % n);
            for nb in self.neighbourhood.neighbours(n, r, c) {
                if done[nb] {
                    continue;
                }
                let cand = d + weights[(nb / n, nb % n)];
                if cand < dist[nb] {
                    dist[nb] = cand;
                    prev[nb] = u;
                    heap.push(Reverse(Frontier {
                        dist: cand,
                        cell: nb,
                    }));
                }
            }
        }

        // The grid is connected, so the sink is reached unless path sums overflow.
        if !dist[sink].is_finite() {
            return Err(Error::Numerical("path cost overflows f64"));
        }
        let mut path = Array2::zeros((n, n));
        let mut cur = sink;
        loop {
            path[(cur / n, cur % n)] = 1.0;
            if cur == 0 {
                break;
            }
            cur = prev[cur];
        }
        Ok((path, dist[sink]))
    }

    /// Solves independent grids on the rayon pool; output order follows input order.
    pub fn solve_batch(&self, batch: &[Array2<f64>]) -> Result<Vec<Array2<f64>>> {
        batch.par_iter().map(|w| self.solve(w.view())).collect()
    }
}

/// Exact minimum-weight path under `neighbourhood`.
pub fn oracle_solve(
    weights: ArrayView2<'_, f64>,
    neighbourhood: Neighbourhood,
) -> Result<Array2<f64>> {
    ShortestPath::new(neighbourhood).solve(weights)
}

/// Cost `⟨weights, path⟩` of a (possibly relaxed) path.
pub fn path_cost(weights: ArrayView2<'_, f64>, path: ArrayView2<'_, f64>) -> Result<f64> {
    grid::ensure_same_shape(&weights, &path)?;
    Ok(grid::dot(&weights, &path))
}
