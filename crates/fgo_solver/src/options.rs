use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc},
};

use fgo_linalg::Float;

/// Which minimizer family drives the optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinimizerType {
    LineSearch,
    #[default]
    TrustRegion,
}

/// Trust region step computation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustRegionStrategyType {
    LevenbergMarquardt,
    #[default]
    Dogleg,
}

/// Dogleg subtype. The subspace variant minimizes the model over the
/// two-dimensional span of the gradient and the Gauss-Newton step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoglegType {
    #[default]
    Traditional,
    Subspace,
}

/// Linear solver used for the trust region subproblem. Both variants are
/// realized over the dense normal equations; the distinction is kept for
/// configuration parity with callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolverType {
    #[default]
    SparseNormalCholesky,
    DenseQr,
}

/// Search direction for the line search minimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSearchDirectionType {
    SteepestDescent,
    NonlinearConjugateGradient,
    Bfgs,
    #[default]
    Lbfgs,
}

/// Sufficient-decrease condition enforced by the line search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSearchType {
    Armijo,
    #[default]
    Wolfe,
}

/// Solver configuration.
///
/// Defaults mirror the engine's historical configuration: dogleg trust
/// region, 200 iterations, initial radius `1e4`, tolerances
/// `1e-6`/`1e-10`/`1e-8`.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub minimizer_type: MinimizerType,
    pub trust_region_strategy_type: TrustRegionStrategyType,
    pub dogleg_type: DoglegType,
    pub linear_solver_type: LinearSolverType,
    pub line_search_direction_type: LineSearchDirectionType,
    pub line_search_type: LineSearchType,
    /// Size of the initial trust region.
    pub initial_trust_region_radius: Float,
    /// Maximum number of minimizer iterations.
    pub max_num_iterations: usize,
    /// `|new_cost - old_cost| < function_tolerance * old_cost`.
    pub function_tolerance: Float,
    /// `max_norm(gradient) <= gradient_tolerance`.
    pub gradient_tolerance: Float,
    /// `|step| <= (|x| + step_tolerance) * step_tolerance`.
    pub step_tolerance: Float,
    /// 0 - silent, 1 - final summary, 2 - per iteration + summary.
    pub verbosity_level: u8,
    /// Write the accepted iterate back into the state pool after every
    /// iteration instead of only on return.
    pub update_state_every_iteration: bool,
    /// Elimination-order hint, keyed by pool offset. Accepted for
    /// configuration parity; the dense backend does not reorder.
    pub linear_solver_ordering: HashMap<usize, i32>,
    pub num_threads: usize,
    /// Cooperative cancellation flag, polled between iterations. When set the
    /// minimizer terminates successfully on the current iterate.
    pub abort: Option<Arc<AtomicBool>>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SolverOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            minimizer_type: MinimizerType::TrustRegion,
            trust_region_strategy_type: TrustRegionStrategyType::Dogleg,
            dogleg_type: DoglegType::Traditional,
            linear_solver_type: LinearSolverType::SparseNormalCholesky,
            line_search_direction_type: LineSearchDirectionType::Lbfgs,
            line_search_type: LineSearchType::Wolfe,
            initial_trust_region_radius: 1e4,
            max_num_iterations: 200,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-8,
            verbosity_level: 1,
            update_state_every_iteration: false,
            linear_solver_ordering: HashMap::new(),
            num_threads: 1,
            abort: None,
        }
    }
}

/// Numeric codes used on the flat wire format for trust region strategies.
impl TrustRegionStrategyType {
    #[must_use]
    pub fn from_wire(code: i32) -> Self {
        match code {
            0 => Self::LevenbergMarquardt,
            _ => Self::Dogleg,
        }
    }
}
