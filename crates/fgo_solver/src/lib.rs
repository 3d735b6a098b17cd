//! Nonlinear least-squares solver backing the factor graph engine.
//!
//! The solver owns no state of its own: parameter blocks are addressed by
//! offset into a caller-owned `f64` pool, which is read and written in place
//! by [`solve`]. Residual blocks pair a [`CostFunction`] with an optional
//! robust [`Loss`] and a list of parameter blocks. Manifold-valued blocks
//! attach a [`Manifold`] describing their local update rule; steps are always
//! computed in local coordinates.
//!
//! Two minimizer families are provided, selected through [`SolverOptions`]:
//! a trust region minimizer (Levenberg-Marquardt or dogleg) and a line search
//! minimizer (steepest descent, nonlinear conjugate gradient, BFGS, L-BFGS).

mod cost;
mod covariance;
mod loss;
mod manifold;
mod minimizer;
mod options;
mod problem;
mod summary;

pub use cost::CostFunction;
pub use covariance::Covariance;
pub use loss::{HuberLoss, Loss};
pub use manifold::{EuclideanManifold, Manifold};
pub use minimizer::solve;
pub use options::{
    DoglegType, LineSearchDirectionType, LineSearchType, LinearSolverType, MinimizerType,
    SolverOptions, TrustRegionStrategyType,
};
pub use problem::{ParameterBlockId, Problem, ResidualBlockId};
pub use summary::{Summary, TerminationType};

/// Errors surfaced by the solver.
///
/// These are non-recoverable conditions; recoverable outcomes (divergence,
/// iteration caps, cooperative aborts) are reported through
/// [`Summary::termination_type`] instead.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("parameter block at offset {0} overlaps an existing block")]
    OverlappingParameterBlock(usize),
    #[error("residual block references unknown parameter block {0:?}")]
    UnknownParameterBlock(ParameterBlockId),
    #[error(
        "cost function expects {expected} values for parameter {index}, but the block holds {actual}"
    )]
    ParameterSizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("the problem has no residual blocks")]
    EmptyProblem,
    #[error("state pool of length {pool} cannot hold block at offset {offset} with size {size}")]
    PoolTooShort {
        pool: usize,
        offset: usize,
        size: usize,
    },
}

pub type Result<T> = std::result::Result<T, SolverError>;
