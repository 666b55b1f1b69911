//! Continuous relaxations of the shortest path, differentiated implicitly.
//!
//! All three strategies solve the node-split flow problem of [`crate::flow`] with a barrier
//! method and return the relaxed cell occupancy:
//!
//! - `convex_relax`: box `[0, 1]`, ridge `regularization`, solved to optimality.
//! - `interior_point`: box `[0, 1]`, no ridge, stopped on the central path at barrier
//!   level `thr` (Mandi & Guns 2020).
//! - `quadratic_program`: no upper bound, ridge `mu` (Amos & Kolter 2017).
//!
//! Occupancy is carried by cell arcs, so the boxed variants never exceed one. The
//! quadratic program's optimum holds no circulating flow and stays within `[0, 1]` up
//! to tolerance.
//!
//! Backward differentiates the optimality conditions at the returned point.

use ndarray::{Array2, ArrayView2};
use rand::RngCore;
use tracing::debug;

use crate::config::{EstimatorConfig, EstimatorKind};
use crate::error::{Error, Result};
use crate::estimator::{context_mismatch, Estimator, Forward, GroundTruth, Saved};
use crate::flow::{self, BarrierSettings, FlowGraph};
use crate::grid::{self, Neighbourhood};

/// Barrier-solved relaxation of the flow polytope.
#[derive(Debug, Clone)]
pub struct Relaxation {
    kind: EstimatorKind,
    neighbourhood: Neighbourhood,
    settings: BarrierSettings,
}

impl Relaxation {
    /// Builds one of the three relaxation strategies from `config`.
    pub fn from_config(kind: EstimatorKind, config: &EstimatorConfig) -> Result<Self> {
        config.validate(kind)?;
        let base = BarrierSettings {
            ridge: 0.0,
            damping: 0.0,
            upper: Some(1.0),
            barrier_floor: 0.0,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
        };
        let settings = match kind {
            EstimatorKind::ConvexRelax => BarrierSettings {
                ridge: config.regularization,
                ..base
            },
            EstimatorKind::InteriorPoint => BarrierSettings {
                damping: config.damping,
                barrier_floor: config.thr,
                ..base
            },
            EstimatorKind::QuadraticProgram => BarrierSettings {
                ridge: config.mu,
                upper: None,
                ..base
            },
            other => return Err(Error::Config(format!("{other} is not a relaxation strategy"))),
        };
        Ok(Self {
            kind,
            neighbourhood: config.neighbourhood,
            settings,
        })
    }

    /// Solver settings derived from the configuration.
    pub fn settings(&self) -> &BarrierSettings {
        &self.settings
    }
}

impl Estimator for Relaxation {
    fn kind(&self) -> EstimatorKind {
        self.kind
    }

    /// Output is the relaxed occupancy, entries in `[0, 1]` up to solver tolerance.
    /// Negative weights are clamped to zero first.
    fn forward(
        &self,
        weights: ArrayView2<'_, f64>,
        _truth: Option<GroundTruth<'_>>,
        _rng: &mut dyn RngCore,
    ) -> Result<Forward> {
        let n = grid::validate_finite(&weights)?;
        let costs_grid = grid::project_nonnegative(weights.to_owned());
        let graph = FlowGraph::new(n, self.neighbourhood);
        let costs = graph.gather_cells(&costs_grid.view());
        let solution = flow::solve_barrier(&graph, &costs, &self.settings)?;
        debug!(
            strategy = %self.kind,
            n,
            arcs = graph.num_arcs(),
            iterations = solution.iterations,
            "relaxation solved"
        );
        let output = graph.occupancy(&solution.flow);
        Ok(Forward::new(
            output,
            Saved::Relaxation {
                from: self.kind,
                graph,
                scaling: solution.scaling,
            },
        ))
    }

    fn backward(&self, forward: &Forward, upstream: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let Saved::Relaxation { from, graph, scaling } = forward.saved() else {
            return Err(context_mismatch(self.kind, forward));
        };
        if *from != self.kind {
            return Err(context_mismatch(self.kind, forward));
        }
        grid::ensure_same_shape(&forward.output().view(), &upstream)?;
        grid::validate_finite(&upstream)?;
        flow::implicit_backward(graph, scaling, &upstream)
    }
}
