//! Strategy configuration, loadable from TOML.
//!
//! One flat parameter set covers every strategy; each strategy reads the fields it needs
//! and [`EstimatorConfig::validate`] checks only those. Defaults follow the values the
//! Warcraft shortest-path experiments were run with.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::grid::Neighbourhood;
use crate::noise::NoiseKind;

/// Which gradient-estimation strategy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Blackbox interpolation (finite difference through the solver).
    Blackbox,
    /// SPO+ subgradient on the loss-augmented grid.
    Spo,
    /// Perturb-and-MAP with a score-function backward.
    Perturbed,
    /// Fenchel-Young loss with perturbed regularisation.
    FenchelYoung,
    /// Implicit maximum-likelihood estimation.
    Imle,
    /// Box-constrained ridge relaxation of the flow polytope.
    ConvexRelax,
    /// Early-stopped log-barrier solve of the flow LP.
    InteriorPoint,
    /// Ridge-regularised flow QP.
    QuadraticProgram,
}

impl EstimatorKind {
    /// Every strategy, in declaration order.
    pub const ALL: [EstimatorKind; 8] = [
        EstimatorKind::Blackbox,
        EstimatorKind::Spo,
        EstimatorKind::Perturbed,
        EstimatorKind::FenchelYoung,
        EstimatorKind::Imle,
        EstimatorKind::ConvexRelax,
        EstimatorKind::InteriorPoint,
        EstimatorKind::QuadraticProgram,
    ];

    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            EstimatorKind::Blackbox => "blackbox",
            EstimatorKind::Spo => "spo",
            EstimatorKind::Perturbed => "perturbed",
            EstimatorKind::FenchelYoung => "fenchel_young",
            EstimatorKind::Imle => "imle",
            EstimatorKind::ConvexRelax => "convex_relax",
            EstimatorKind::InteriorPoint => "interior_point",
            EstimatorKind::QuadraticProgram => "quadratic_program",
        }
    }

    /// Whether `forward` needs the true path and weights.
    pub fn needs_ground_truth(self) -> bool {
        matches!(self, EstimatorKind::Spo | EstimatorKind::FenchelYoung)
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EstimatorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown estimator kind {s:?}")))
    }
}

/// Parameters for every strategy. Immutable once an estimator is built.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Legal moves of the underlying grid graph.
    #[serde(default)]
    pub neighbourhood: Neighbourhood,

    /// Interpolation magnitude for blackbox differentiation.
    #[serde(default = "default_lambda")]
    pub lambda: f64,

    /// Perturbation scale for perturbed and Fenchel-Young strategies.
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    /// Monte-Carlo samples for perturbed and Fenchel-Young strategies.
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    /// Noise family; `None` picks Gumbel for `perturbed` and Gaussian for `fenchel_young`.
    #[serde(default)]
    pub noise: Option<NoiseKind>,

    /// Sum-of-Gamma shape parameter (IMLE).
    #[serde(default = "default_k")]
    pub k: f64,

    /// Gamma terms per sum-of-Gamma draw (IMLE).
    #[serde(default = "default_nb_iterations")]
    pub nb_iterations: usize,

    /// Samples per step (IMLE).
    #[serde(default = "default_nb_samples")]
    pub nb_samples: usize,

    /// Scale of the noise added to the input scores (IMLE).
    #[serde(default = "default_one")]
    pub input_noise_temperature: f64,

    /// Scale of the noise added to the target scores (IMLE).
    #[serde(default = "default_one")]
    pub target_noise_temperature: f64,

    /// Weight of the current scores in the IMLE target.
    #[serde(default = "default_one")]
    pub target_alpha: f64,

    /// Step along the upstream gradient in the IMLE target.
    #[serde(default = "default_target_beta")]
    pub target_beta: f64,

    /// Divide the IMLE gradient by `target_beta`.
    #[serde(default = "default_true")]
    pub imle_gradient_scaling: bool,

    /// Barrier parameter at which the interior-point relaxation stops.
    #[serde(default = "default_thr")]
    pub thr: f64,

    /// Diagonal damping of the interior-point Newton system.
    #[serde(default = "default_damping")]
    pub damping: f64,

    /// Ridge coefficient of the quadratic-program relaxation.
    #[serde(default = "default_mu")]
    pub mu: f64,

    /// Ridge coefficient of the box-constrained convex relaxation.
    #[serde(default = "default_regularization")]
    pub regularization: f64,

    /// Iteration budget of the relaxation solvers.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Residual tolerance of the relaxation solvers.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_lambda() -> f64 {
    20.0
}
fn default_sigma() -> f64 {
    0.1
}
fn default_num_samples() -> usize {
    10
}
fn default_k() -> f64 {
    5.0
}
fn default_nb_iterations() -> usize {
    100
}
fn default_nb_samples() -> usize {
    1
}
fn default_one() -> f64 {
    1.0
}
fn default_target_beta() -> f64 {
    10.0
}
fn default_true() -> bool {
    true
}
fn default_thr() -> f64 {
    0.1
}
fn default_damping() -> f64 {
    1e-3
}
fn default_mu() -> f64 {
    1e-3
}
fn default_regularization() -> f64 {
    0.1
}
fn default_max_iterations() -> usize {
    100
}
fn default_tolerance() -> f64 {
    1e-8
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            neighbourhood: Neighbourhood::default(),
            lambda: default_lambda(),
            sigma: default_sigma(),
            num_samples: default_num_samples(),
            noise: None,
            k: default_k(),
            nb_iterations: default_nb_iterations(),
            nb_samples: default_nb_samples(),
            input_noise_temperature: default_one(),
            target_noise_temperature: default_one(),
            target_alpha: default_one(),
            target_beta: default_target_beta(),
            imle_gradient_scaling: default_true(),
            thr: default_thr(),
            damping: default_damping(),
            mu: default_mu(),
            regularization: default_regularization(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            value,
            expected: "> 0 and finite",
        })
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            value,
            expected: ">= 0 and finite",
        })
    }
}

fn at_least_one(name: &'static str, value: usize) -> Result<()> {
    if value >= 1 {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            value: value as f64,
            expected: ">= 1",
        })
    }
}

impl EstimatorConfig {
    /// Parses a TOML table. Missing fields take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Noise family used by `kind`.
    pub fn noise_for(&self, kind: EstimatorKind) -> NoiseKind {
        self.noise.unwrap_or(match kind {
            EstimatorKind::FenchelYoung => NoiseKind::Gaussian,
            _ => NoiseKind::Gumbel,
        })
    }

    /// Rejects the parameters `kind` reads when they are out of range.
    pub fn validate(&self, kind: EstimatorKind) -> Result<()> {
        match kind {
            EstimatorKind::Blackbox => positive("lambda", self.lambda),
            EstimatorKind::Spo => Ok(()),
            EstimatorKind::Perturbed | EstimatorKind::FenchelYoung => {
                positive("sigma", self.sigma)?;
                at_least_one("num_samples", self.num_samples)
            }
            EstimatorKind::Imle => {
                positive("k", self.k)?;
                at_least_one("nb_iterations", self.nb_iterations)?;
                at_least_one("nb_samples", self.nb_samples)?;
                non_negative("input_noise_temperature", self.input_noise_temperature)?;
                non_negative("target_noise_temperature", self.target_noise_temperature)?;
                non_negative("target_alpha", self.target_alpha)?;
                positive("target_beta", self.target_beta)
            }
            EstimatorKind::ConvexRelax => {
                positive("regularization", self.regularization)?;
                self.validate_solver()
            }
            EstimatorKind::InteriorPoint => {
                positive("thr", self.thr)?;
                non_negative("damping", self.damping)?;
                self.validate_solver()
            }
            EstimatorKind::QuadraticProgram => {
                positive("mu", self.mu)?;
                self.validate_solver()
            }
        }
    }

    fn validate_solver(&self) -> Result<()> {
        at_least_one("max_iterations", self.max_iterations)?;
        positive("tolerance", self.tolerance)
    }
}

/// Ranking objective over the solution cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingKind {
    /// Squared error between predicted and true costs.
    Pointwise,
    /// Hinge with margin `tau` on every ordered pair.
    Pairwise,
    /// Squared error between predicted and true cost differences.
    PairwiseDiff,
    /// Cross-entropy between softmax rankings at temperature `tau`.
    Listwise,
}

impl FromStr for RankingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pointwise" => Ok(RankingKind::Pointwise),
            "pairwise" => Ok(RankingKind::Pairwise),
            "pairwise_diff" => Ok(RankingKind::PairwiseDiff),
            "listwise" => Ok(RankingKind::Listwise),
            other => Err(Error::Config(format!("unknown ranking loss {other:?}"))),
        }
    }
}

/// Solution-cache training parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RankingConfig {
    /// Ranking objective.
    #[serde(default = "default_ranking_loss")]
    pub loss: RankingKind,
    /// Margin (pairwise) or temperature (listwise).
    #[serde(default)]
    pub tau: f64,
    /// Probability of solving and caching the prediction at each step.
    #[serde(default = "default_growth")]
    pub growth: f64,
    /// Neighbourhood used when growing the cache.
    #[serde(default)]
    pub neighbourhood: Neighbourhood,
}

fn default_ranking_loss() -> RankingKind {
    RankingKind::Pointwise
}
fn default_growth() -> f64 {
    0.1
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            loss: default_ranking_loss(),
            tau: 0.0,
            growth: default_growth(),
            neighbourhood: Neighbourhood::default(),
        }
    }
}

impl RankingConfig {
    /// Parses a TOML table. Missing fields take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Rejects out-of-range `growth` and `tau`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.growth) {
            return Err(Error::InvalidParameter {
                name: "growth",
                value: self.growth,
                expected: "in [0, 1]",
            });
        }
        match self.loss {
            RankingKind::Listwise => positive("tau", self.tau),
            _ => non_negative("tau", self.tau),
        }
    }
}
