use fgo_linalg::{Float, Matrix, Vector};

/// A residual block's cost term.
///
/// Implementations evaluate the (whitened) residual at the given parameter
/// values. Jacobians are optional: when [`CostFunction::jacobian`] returns
/// `None` the solver differentiates numerically through each block's manifold,
/// so most cost functions only implement [`CostFunction::residual`].
pub trait CostFunction: Send + Sync {
    /// Length of the residual vector.
    fn num_residuals(&self) -> usize;

    /// Global sizes of the parameter blocks this cost consumes, in call order.
    fn parameter_sizes(&self) -> &[usize];

    /// Evaluate the residual. `params[i]` holds the current values of the
    /// `i`-th parameter block, with length `parameter_sizes()[i]`.
    fn residual(&self, params: &[&[Float]]) -> Vector;

    /// Analytic Jacobian of the residual with respect to the *local*
    /// coordinates of parameter block `block`, of shape
    /// `num_residuals x local_size`. Return `None` to request numeric
    /// differentiation.
    fn jacobian(&self, _params: &[&[Float]], _block: usize) -> Option<Matrix> {
        None
    }
}
