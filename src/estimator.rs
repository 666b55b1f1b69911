//! The forward/backward contract shared by every gradient-estimation strategy.
//!
//! `forward` returns a [`Forward`] holding the output path and everything `backward`
//! needs, including the exact noise draws of sampling strategies. Estimators hold only
//! their immutable configuration, so one instance can serve many threads.

use ndarray::{Array2, ArrayView2};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::blackbox::Blackbox;
use crate::config::{EstimatorConfig, EstimatorKind};
use crate::error::{Error, Result};
use crate::fenchel_young::FenchelYoung;
use crate::flow::FlowGraph;
use crate::grid;
use crate::imle::Imle;
use crate::noise::NoiseBuffer;
use crate::perturbed::Perturbed;
use crate::relaxation::Relaxation;
use crate::spo::Spo;

/// True path and true weights of one example.
#[derive(Debug, Clone, Copy)]
pub struct GroundTruth<'a> {
    /// 0/1 matrix of the optimal path under the true weights.
    pub path: ArrayView2<'a, f64>,
    /// True cell costs.
    pub weights: ArrayView2<'a, f64>,
}

impl<'a> GroundTruth<'a> {
    /// Pairs a true path with its weights.
    pub fn new(path: ArrayView2<'a, f64>, weights: ArrayView2<'a, f64>) -> Self {
        Self { path, weights }
    }

    /// Both grids must match `like` in shape; the weights must be finite.
    pub(crate) fn check_against(&self, like: &ArrayView2<'_, f64>) -> Result<()> {
        grid::ensure_same_shape(like, &self.path)?;
        grid::ensure_same_shape(like, &self.weights)?;
        grid::validate_finite(&self.weights)?;
        Ok(())
    }
}

/// What a strategy keeps between `forward` and `backward`.
#[derive(Debug, Clone)]
pub(crate) enum Saved {
    Blackbox {
        weights: Array2<f64>,
        path: Array2<f64>,
    },
    /// Loss-independent gradient computed during forward (SPO, Fenchel-Young).
    Direction {
        from: EstimatorKind,
        gradient: Array2<f64>,
    },
    Perturbed {
        noise: NoiseBuffer,
        paths: Vec<Array2<f64>>,
    },
    Imle {
        weights: Array2<f64>,
        noise: NoiseBuffer,
        paths: Vec<Array2<f64>>,
    },
    Relaxation {
        from: EstimatorKind,
        graph: FlowGraph,
        scaling: Vec<f64>,
    },
}

impl Saved {
    fn producer(&self) -> EstimatorKind {
        match self {
            Saved::Blackbox { .. } => EstimatorKind::Blackbox,
            Saved::Direction { from, .. } | Saved::Relaxation { from, .. } => *from,
            Saved::Perturbed { .. } => EstimatorKind::Perturbed,
            Saved::Imle { .. } => EstimatorKind::Imle,
        }
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct Forward {
    output: Array2<f64>,
    loss: Option<f64>,
    saved: Saved,
}

impl Forward {
    pub(crate) fn new(output: Array2<f64>, saved: Saved) -> Self {
        Self {
            output,
            loss: None,
            saved,
        }
    }

    pub(crate) fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Path (0/1) or relaxed path (entries in `[0, 1]`).
    pub fn output(&self) -> &Array2<f64> {
        &self.output
    }

    /// Surrogate loss, for strategies that define one (SPO+, Fenchel-Young).
    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    /// Strategy that produced this context.
    pub fn kind(&self) -> EstimatorKind {
        self.saved.producer()
    }

    pub(crate) fn saved(&self) -> &Saved {
        &self.saved
    }

    /// Consumes the context, keeping only the output.
    pub fn into_output(self) -> Array2<f64> {
        self.output
    }
}

/// Checks that a context came from `expected`.
pub(crate) fn context_mismatch(expected: EstimatorKind, fwd: &Forward) -> Error {
    Error::ContextMismatch {
        expected: expected.as_str(),
        got: fwd.kind().as_str(),
    }
}

/// Differentiable wrapper around the shortest-path oracle.
pub trait Estimator: Send + Sync + std::fmt::Debug {
    /// Which strategy this is.
    fn kind(&self) -> EstimatorKind;

    /// Path (or relaxed path) for `weights`.
    ///
    /// `truth` is required by [`EstimatorKind::needs_ground_truth`] strategies and ignored
    /// otherwise. `rng` feeds sampling strategies; deterministic ones never touch it.
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        truth: Option<GroundTruth<'_>>,
        rng: &mut dyn RngCore,
    ) -> Result<Forward>;

    /// Gradient with respect to the weights given `upstream = ∂loss/∂output`.
    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// `forward` over a minibatch on the rayon pool.
    ///
    /// Each example gets its own RNG seeded from `rng` in example order, so the result
    /// does not depend on scheduling.
    fn forward_batch(
        &self,
        weights: &[Array2<f64>],
        truths: Option<&[GroundTruth<'_>]>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Forward>> {
        if let Some(t) = truths {
            if t.len() != weights.len() {
                return Err(Error::ShapeMismatch {
                    expected: (weights.len(), 1),
                    got: (t.len(), 1),
                });
            }
        }
        let seeds: Vec<u64> = weights.iter().map(|_| rng.next_u64()).collect();
        weights
            .par_iter()
            .zip(seeds.par_iter())
            .enumerate()
            .map(|(i, (w, &seed))| {
                let mut local = ChaCha8Rng::seed_from_u64(seed);
                self.forward(w.view(), truths.map(|t| t[i]), &mut local)
            })
            .collect()
    }

    /// `backward` over a minibatch on the rayon pool.
    fn backward_batch(
        &self,
        forwards: &[Forward],
        upstream: &[Array2<f64>],
    ) -> Result<Vec<Array2<f64>>> {
        if forwards.len() != upstream.len() {
            return Err(Error::ShapeMismatch {
                expected: (forwards.len(), 1),
                got: (upstream.len(), 1),
            });
        }
        forwards
            .par_iter()
            .zip(upstream.par_iter())
            .map(|(f, g)| self.backward(f, g.view()))
            .collect()
    }
}

/// Builds the strategy `kind` from `config`, validating the parameters it reads.
pub fn make_estimator(kind: EstimatorKind, config: &EstimatorConfig) -> Result<Box<dyn Estimator>> {
    config.validate(kind)?;
    let nb = config.neighbourhood;
    Ok(match kind {
        EstimatorKind::Blackbox => Box::new(Blackbox::new(config.lambda, nb)?),
        EstimatorKind::Spo => Box::new(Spo::new(nb)),
        EstimatorKind::Perturbed => Box::new(Perturbed::new(
            config.sigma,
            config.num_samples,
            config.noise_for(kind),
            nb,
        )?),
        EstimatorKind::FenchelYoung => Box::new(FenchelYoung::new(
            config.sigma,
            config.num_samples,
            config.noise_for(kind),
            nb,
        )?),
        EstimatorKind::Imle => Box::new(Imle::from_config(config)?),
        EstimatorKind::ConvexRelax
        | EstimatorKind::InteriorPoint
        | EstimatorKind::QuadraticProgram => Box::new(Relaxation::from_config(kind, config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let w = array![[1.0, 9.0, 9.0], [1.0, 9.0, 9.0], [1.0, 1.0, 1.0]];
        let c = array![[1.0, 1.0, 1.0], [9.0, 9.0, 1.0], [9.0, 9.0, 1.0]];
        let y = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
        (w, c, y)
    }

    #[test]
    fn every_kind_builds_and_runs_forward_backward() {
        let (w, c, y) = toy();
        let config = EstimatorConfig {
            neighbourhood: crate::Neighbourhood::Four,
            max_iterations: 200,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for kind in EstimatorKind::ALL {
            let est = make_estimator(kind, &config).unwrap();
            assert_eq!(est.kind(), kind);
            let fwd = est
                .forward(w.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
                .unwrap();
            assert_eq!(fwd.kind(), kind);
            assert_eq!(fwd.output().dim(), (3, 3));
            assert!(fwd.output().iter().all(|v| v.is_finite()));
            let g = est.backward(&fwd, c.view()).unwrap();
            assert_eq!(g.dim(), (3, 3));
            assert!(g.iter().all(|v| v.is_finite()), "{kind}: {g:?}");
        }
    }

    #[test]
    fn ground_truth_strategies_refuse_to_run_without_it() {
        let (w, _, _) = toy();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for kind in EstimatorKind::ALL.into_iter().filter(|k| k.needs_ground_truth()) {
            let est = make_estimator(kind, &EstimatorConfig::default()).unwrap();
            let err = est.forward(w.view(), None, &mut rng).unwrap_err();
            assert!(matches!(err, Error::MissingGroundTruth(_)));
        }
    }

    #[test]
    fn non_finite_weights_fail_every_strategy() {
        let (mut w, c, y) = toy();
        w[(1, 1)] = f64::NAN;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for kind in EstimatorKind::ALL {
            let est = make_estimator(kind, &EstimatorConfig::default()).unwrap();
            let err = est
                .forward(w.view(), Some(GroundTruth::new(y.view(), c.view())), &mut rng)
                .unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidWeight, "{kind}");
        }
    }

    #[test]
    fn backward_rejects_foreign_context() {
        let (w, _, _) = toy();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let bb = make_estimator(EstimatorKind::Blackbox, &EstimatorConfig::default()).unwrap();
        let pt = make_estimator(EstimatorKind::Perturbed, &EstimatorConfig::default()).unwrap();
        let fwd = bb.forward(w.view(), None, &mut rng).unwrap();
        let err = pt.backward(&fwd, w.view()).unwrap_err();
        assert_eq!(
            err,
            Error::ContextMismatch {
                expected: "perturbed",
                got: "blackbox",
            }
        );
    }

    #[test]
    fn invalid_configuration_is_rejected_at_construction() {
        let cfg = EstimatorConfig {
            sigma: -1.0,
            ..Default::default()
        };
        let err = make_estimator(EstimatorKind::Perturbed, &cfg).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn batch_forward_is_reproducible_and_ordered() {
        let (w, c, _) = toy();
        let est = make_estimator(EstimatorKind::Perturbed, &EstimatorConfig {
            neighbourhood: crate::Neighbourhood::Four,
            sigma: 1.0,
            ..Default::default()
        })
        .unwrap();
        let batch = vec![w.clone(), c.clone(), w.clone()];
        let a = est
            .forward_batch(&batch, None, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        let b = est
            .forward_batch(&batch, None, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.output(), y.output());
        }
        let ups = vec![c.clone(), c.clone(), c];
        let ga = est.backward_batch(&a, &ups).unwrap();
        let gb = est.backward_batch(&b, &ups).unwrap();
        assert_eq!(ga, gb);
    }
}
