//! Noise families for perturbation-based estimators.
//!
//! Noise is drawn once in `forward` into a [`NoiseBuffer`] that travels with the forward
//! context, so `backward` reuses the exact same draws. The RNG is always supplied by the
//! caller.

use ndarray::Array2;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Gamma, Gumbel, StandardNormal};

use crate::error::{Error, Result};

/// Distribution of additive perturbations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseKind {
    /// Standard normal.
    #[serde(alias = "normal")]
    Gaussian,
    /// Standard Gumbel (location 0, scale 1).
    Gumbel,
}

impl NoiseKind {
    /// Draws one `n×n` grid of i.i.d. noise.
    pub fn sample_grid<R: Rng + ?Sized>(self, n: usize, rng: &mut R) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((n, n));
        match self {
            NoiseKind::Gaussian => {
                for v in out.iter_mut() {
                    *v = StandardNormal.sample(rng);
                }
            }
            NoiseKind::Gumbel => {
                let g = Gumbel::new(0.0, 1.0).map_err(|_| Error::Numerical("gumbel(0, 1)"))?;
                for v in out.iter_mut() {
                    *v = g.sample(rng);
                }
            }
        }
        Ok(out)
    }

    /// `∇ν(z)`: gradient of the negative log-density, used by the score-function estimator.
    #[inline]
    pub fn score(self, z: f64) -> f64 {
        match self {
            NoiseKind::Gaussian => z,
            NoiseKind::Gumbel => 1.0 - (-z).exp(),
        }
    }
}

/// Sum-of-Gamma noise (Niepert et al., IMLE): with `κ = k`,
/// \(\varepsilon = \frac{1}{\kappa}\left(\sum_{i=1}^{s} \mathrm{Gamma}(1/\kappa, \kappa/i) - \log s\right)\).
///
/// `k` such grids summed together are distributed approximately as Gumbel noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SumOfGamma {
    k: f64,
    nb_iterations: usize,
}

impl SumOfGamma {
    /// Validated constructor: `k > 0`, `nb_iterations ≥ 1`.
    pub fn new(k: f64, nb_iterations: usize) -> Result<Self> {
        if !(k > 0.0 && k.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "k",
                value: k,
                expected: "> 0 and finite",
            });
        }
        if nb_iterations == 0 {
            return Err(Error::InvalidParameter {
                name: "nb_iterations",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(Self { k, nb_iterations })
    }

    /// Draws one `n×n` grid.
    pub fn sample_grid<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Array2<f64>> {
        let mut out = Array2::<f64>::zeros((n, n));
        let shape = 1.0 / self.k;
        for i in 1..=self.nb_iterations {
            let gamma = Gamma::new(shape, self.k / i as f64)
                .map_err(|_| Error::Numerical("gamma parameters"))?;
            for v in out.iter_mut() {
                *v += gamma.sample(rng);
            }
        }
        let shift = (self.nb_iterations as f64).ln();
        out.mapv_inplace(|s| (s - shift) / self.k);
        Ok(out)
    }
}

/// The noise realisations of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseBuffer {
    samples: Vec<Array2<f64>>,
}

impl NoiseBuffer {
    /// `count` grids from `kind`.
    pub fn draw(kind: NoiseKind, n: usize, count: usize, rng: &mut dyn RngCore) -> Result<Self> {
        let samples = (0..count)
            .map(|_| kind.sample_grid(n, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { samples })
    }

    /// `count` grids of sum-of-Gamma noise.
    pub fn draw_sum_of_gamma(
        dist: &SumOfGamma,
        n: usize,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Self> {
        let samples = (0..count)
            .map(|_| dist.sample_grid(n, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { samples })
    }

    /// Wraps explicit draws.
    pub fn from_samples(samples: Vec<Array2<f64>>) -> Self {
        Self { samples }
    }

    /// The draws, in sampling order.
    pub fn samples(&self) -> &[Array2<f64>] {
        &self.samples
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no draws were taken.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mean(a: &[Array2<f64>]) -> f64 {
        a.iter().map(|g| g.sum()).sum::<f64>() / a.iter().map(|g| g.len()).sum::<usize>() as f64
    }

    #[test]
    fn same_seed_same_buffer() {
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let x = NoiseBuffer::draw(NoiseKind::Gumbel, 4, 3, &mut a).unwrap();
        let y = NoiseBuffer::draw(NoiseKind::Gumbel, 4, 3, &mut b).unwrap();
        assert_eq!(x, y);
        assert_eq!(x.len(), 3);
    }

    #[test]
    fn sample_means_match_the_families() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let g = NoiseBuffer::draw(NoiseKind::Gaussian, 10, 200, &mut rng).unwrap();
        assert!(mean(g.samples()).abs() < 0.05);
        // Gumbel(0, 1) has mean equal to the Euler-Mascheroni constant.
        let u = NoiseBuffer::draw(NoiseKind::Gumbel, 10, 200, &mut rng).unwrap();
        assert!((mean(u.samples()) - 0.5772).abs() < 0.05);
    }

    #[test]
    fn scores_vanish_at_the_mode() {
        assert_eq!(NoiseKind::Gaussian.score(0.0), 0.0);
        assert_eq!(NoiseKind::Gumbel.score(0.0), 0.0);
        assert!(NoiseKind::Gumbel.score(1.0) > 0.0);
    }

    #[test]
    fn sum_of_gamma_is_finite_and_validated() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let d = SumOfGamma::new(5.0, 10).unwrap();
        let g = d.sample_grid(6, &mut rng).unwrap();
        assert!(g.iter().all(|v| v.is_finite()));
        assert!(SumOfGamma::new(0.0, 10).is_err());
        assert!(SumOfGamma::new(5.0, 0).is_err());
    }

    #[test]
    fn noise_kind_accepts_normal_alias() {
        #[derive(serde::Deserialize)]
        struct W {
            noise: NoiseKind,
        }
        let w: W = toml::from_str("noise = \"normal\"").unwrap();
        assert_eq!(w.noise, NoiseKind::Gaussian);
    }
}
