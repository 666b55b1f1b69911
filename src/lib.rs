//! Differentiable shortest paths on grid graphs.
//!
//! A predictor emits one cost per cell of an `n×n` grid; the exact oracle turns those
//! costs into a 0/1 path from the top-left to the bottom-right cell. This crate wraps the
//! oracle in gradient-estimation strategies (blackbox interpolation, SPO+, perturbed
//! optimizers, Fenchel-Young, IMLE, and three barrier-solved relaxations), a growing
//! solution cache with ranking losses, and the Hamming/regret losses used to score paths.
//!
//! Public invariants (must not change):
//! - The oracle is deterministic: equal weights give equal paths, ties broken by cell index.
//! - Every strategy validates its weights before doing any work; failures are [`Error`]s,
//!   never default paths.
//! - Randomness enters only through an explicit RNG argument, and batch results do not
//!   depend on thread scheduling.
//! - Strategy parameters are explicit, validated at construction, and immutable afterwards.

pub mod blackbox;
pub mod cache;
pub mod config;
pub mod error;
pub mod estimator;
pub mod fenchel_young;
pub mod flow;
pub mod grid;
pub mod imle;
pub mod loss;
pub mod noise;
pub mod oracle;
pub mod perturbed;
pub mod ranking;
pub mod relaxation;
pub mod spo;

pub use cache::SolutionCache;
pub use config::{EstimatorConfig, EstimatorKind, RankingConfig, RankingKind};
pub use error::{Error, ErrorKind, Result};
pub use estimator::{make_estimator, Estimator, Forward, GroundTruth};
pub use grid::Neighbourhood;
pub use loss::{
    hamming_grad, hamming_loss, hamming_loss_batch, normalized_regret, normalized_regret_batch,
    regret_grad,
};
pub use noise::NoiseKind;
pub use oracle::{oracle_solve, path_cost, ShortestPath};
pub use ranking::{RankingBatch, RankingLoss};
