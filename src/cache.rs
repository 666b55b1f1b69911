//! Growing pool of distinct solutions for ranking-based training.
//!
//! The cache starts from an optional seed set and grows by solving the model's current
//! prediction with probability `growth`. Entries are never removed and never repeated.

use std::collections::HashSet;

use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::config::RankingConfig;
use crate::error::{Error, Result};
use crate::estimator::GroundTruth;
use crate::grid::{self, Neighbourhood};
use crate::oracle::ShortestPath;
use crate::ranking::RankingBatch;

/// Packed-bit key of a 0/1 path.
fn path_key(path: &ArrayView2<'_, f64>) -> Vec<u64> {
    let mut key = vec![0u64; path.len().div_ceil(64)];
    for (i, &v) in path.iter().enumerate() {
        if v == 1.0 {
            key[i / 64] |= 1 << (i % 64);
        }
    }
    key
}

fn validate_growth(growth: f64) -> Result<()> {
    if (0.0..=1.0).contains(&growth) {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: "growth",
            value: growth,
            expected: "in [0, 1]",
        })
    }
}

/// Ordered set of distinct paths sharing one grid size.
#[derive(Debug, Clone)]
pub struct SolutionCache {
    paths: Vec<Array2<f64>>,
    keys: HashSet<Vec<u64>>,
    oracle: ShortestPath,
}

impl SolutionCache {
    /// Empty cache that grows with the oracle for `neighbourhood`.
    pub fn new(neighbourhood: Neighbourhood) -> Self {
        Self {
            paths: Vec::new(),
            keys: HashSet::new(),
            oracle: ShortestPath::new(neighbourhood),
        }
    }

    /// Cache seeded with `paths`, typically the training labels. Duplicates are dropped.
    pub fn from_paths(neighbourhood: Neighbourhood, paths: &[Array2<f64>]) -> Result<Self> {
        let mut cache = Self::new(neighbourhood);
        for p in paths {
            cache.insert(p.view())?;
        }
        Ok(cache)
    }

    /// Cache for a ranking run, seeded with `paths`. Validates `config` first.
    pub fn from_config(config: &RankingConfig, paths: &[Array2<f64>]) -> Result<Self> {
        config.validate()?;
        Self::from_paths(config.neighbourhood, paths)
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True until the first insertion.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Cached paths in insertion order.
    pub fn paths(&self) -> &[Array2<f64>] {
        &self.paths
    }

    /// Whether an identical path is cached.
    pub fn contains(&self, path: ArrayView2<'_, f64>) -> bool {
        self.keys.contains(&path_key(&path))
    }

    /// Inserts `path` unless already present. Returns whether the cache grew.
    ///
    /// The path must hold only 0/1 entries and match the size of existing entries.
    pub fn insert(&mut self, path: ArrayView2<'_, f64>) -> Result<bool> {
        grid::validate_path(&path)?;
        if let Some(first) = self.paths.first() {
            grid::ensure_same_shape(&first.view(), &path)?;
        }
        if !self.keys.insert(path_key(&path)) {
            return Ok(false);
        }
        self.paths.push(path.to_owned());
        Ok(true)
    }

    /// With probability `growth` (always, while empty), solves `weights` and caches the
    /// path. Returns whether the cache grew.
    pub fn maybe_grow<R: Rng + ?Sized>(
        &mut self,
        weights: ArrayView2<'_, f64>,
        growth: f64,
        rng: &mut R,
    ) -> Result<bool> {
        validate_growth(growth)?;
        if !self.is_empty() && rng.random::<f64>() >= growth {
            return Ok(false);
        }
        let path = self.oracle.solve(weights)?;
        let grew = self.insert(path.view())?;
        if grew {
            debug!(size = self.len(), "solution cache grew");
        }
        Ok(grew)
    }

    /// [`SolutionCache::maybe_grow`] over a minibatch: one draw decides for the whole
    /// batch (always grows while empty), then every grid is solved in parallel and
    /// inserted in example order. Returns the number of new entries; on error the cache
    /// is unchanged.
    pub fn maybe_grow_batch<R: Rng + ?Sized>(
        &mut self,
        weights: &[Array2<f64>],
        growth: f64,
        rng: &mut R,
    ) -> Result<usize> {
        validate_growth(growth)?;
        if !self.is_empty() && rng.random::<f64>() >= growth {
            return Ok(0);
        }
        let paths = weights
            .par_iter()
            .map(|w| self.oracle.solve(w.view()))
            .collect::<Result<Vec<_>>>()?;
        if let Some(first) = self.paths.first().or(paths.first()) {
            for p in &paths {
                grid::ensure_same_shape(&first.view(), &p.view())?;
            }
        }

        let mut added = 0;
        for p in &paths {
            if self.insert(p.view())? {
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, size = self.len(), "solution cache grew");
        }
        Ok(added)
    }

    /// Candidates for one example: the true path followed by every distinct cached path,
    /// each with its true cost `⟨c, y⟩` and predicted cost `⟨w, y⟩`.
    pub fn ranking_batch(
        &self,
        weights: ArrayView2<'_, f64>,
        truth: GroundTruth<'_>,
    ) -> Result<RankingBatch> {
        grid::validate_finite(&weights)?;
        truth.check_against(&weights)?;
        grid::validate_path(&truth.path)?;
        if let Some(first) = self.paths.first() {
            grid::ensure_same_shape(&first.view(), &weights)?;
        }

        let true_key = path_key(&truth.path);
        let mut candidates = vec![truth.path.to_owned()];
        candidates.extend(
            self.paths
                .iter()
                .filter(|p| path_key(&p.view()) != true_key)
                .cloned(),
        );
        let true_costs = candidates.iter().map(|y| grid::dot(&truth.weights, &y.view())).collect();
        let predicted_costs = candidates.iter().map(|y| grid::dot(&weights, &y.view())).collect();
        Ok(RankingBatch {
            candidates,
            true_costs,
            predicted_costs,
        })
    }
}
