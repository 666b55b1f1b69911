//! Error type shared by every operator in the crate.
//!
//! Variants carry the offending values. [`Error::kind`] folds them into the
//! failure classes a training loop acts on.

/// Coarse failure class, used by training loops to decide skip-vs-abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or non-finite weight/path grid.
    InvalidWeight,
    /// Illegal strategy parameters or misuse of the forward/backward contract.
    Configuration,
    /// A relaxation solver ran out of iterations or broke down numerically.
    SolverDivergence,
}

/// Errors for oracle, estimator, cache and loss operators.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Grid must be square and non-empty.
    #[error("grid must be square and non-empty, got {rows}x{cols}")]
    InvalidShape {
        /// Row count of the offending grid.
        rows: usize,
        /// Column count of the offending grid.
        cols: usize,
    },
    /// Two grids that must agree in shape do not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape of the reference grid.
        expected: (usize, usize),
        /// Shape of the grid that disagreed.
        got: (usize, usize),
    },
    /// NaN or infinite entry.
    #[error("non-finite weight {value} at ({row}, {col})")]
    NonFiniteWeight {
        /// Row of the entry.
        row: usize,
        /// Column of the entry.
        col: usize,
        /// The entry itself.
        value: f64,
    },
    /// Shortest-path search requires non-negative vertex weights.
    #[error("negative weight {value} at ({row}, {col})")]
    NegativeWeight {
        /// Row of the entry.
        row: usize,
        /// Column of the entry.
        col: usize,
        /// The entry itself.
        value: f64,
    },
    /// Path matrices hold only 0 and 1.
    #[error("path entry {value} at ({row}, {col}) is not 0 or 1")]
    InvalidPath {
        /// Row of the entry.
        row: usize,
        /// Column of the entry.
        col: usize,
        /// The entry itself.
        value: f64,
    },
    /// A parameter is outside its valid range.
    #[error("parameter out of range: {name} = {value} (expected {expected})")]
    InvalidParameter {
        /// Parameter name as it appears in the configuration.
        name: &'static str,
        /// The rejected value.
        value: f64,
        /// Human-readable valid range.
        expected: &'static str,
    },
    /// The strategy needs the true path and true weights.
    #[error("{0} requires a ground-truth path and true weights")]
    MissingGroundTruth(&'static str),
    /// `backward` received a context produced by another strategy.
    #[error("backward of {expected} called with a forward context from {got}")]
    ContextMismatch {
        /// Strategy whose backward was called.
        expected: &'static str,
        /// Strategy that produced the context.
        got: &'static str,
    },
    /// Configuration text could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Iterative relaxation solver did not converge.
    #[error(
        "relaxation stalled after {iterations} iterations \
         (residual={residual:.2e}, tol={tolerance:.2e})"
    )]
    SolverDivergence {
        /// Iterations completed before giving up.
        iterations: usize,
        /// Final residual (max of primal, dual and barrier measures).
        residual: f64,
        /// Target tolerance.
        tolerance: f64,
    },
    /// A solver's arithmetic broke down or overflowed.
    #[error("numerical breakdown: {0}")]
    Numerical(&'static str),
}

impl Error {
    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidShape { .. }
            | Error::ShapeMismatch { .. }
            | Error::NonFiniteWeight { .. }
            | Error::NegativeWeight { .. }
            | Error::InvalidPath { .. } => ErrorKind::InvalidWeight,
            Error::InvalidParameter { .. }
            | Error::MissingGroundTruth(_)
            | Error::ContextMismatch { .. }
            | Error::Config(_) => ErrorKind::Configuration,
            Error::SolverDivergence { .. } | Error::Numerical(_) => ErrorKind::SolverDivergence,
        }
    }
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
