use std::collections::HashMap;

use fgo_linalg::{Float, Matrix};

use crate::{ParameterBlockId, Problem, Result};

/// Reciprocal condition number below which singular values are treated as
/// null space and dropped from the pseudo-inverse.
const MIN_RECIPROCAL_CONDITION_NUMBER: Float = 1e-14;

/// Dense SVD covariance estimator.
///
/// Computes the pseudo-inverse of the Gauss-Newton Hessian `J^T J` in local
/// coordinates, absorbing any null space (rank deficiency routinely arises
/// from overparameterization, e.g. unit quaternions, and from gauge freedom).
/// Per-block covariances are lifted back to the ambient representation with
/// the block manifold's plus-Jacobian, so callers receive `dim x dim` blocks
/// matching the stored state layout.
#[derive(Debug, Default)]
pub struct Covariance {}

impl Covariance {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// Compute marginal covariance blocks for the requested parameter blocks
    /// at the current pool state. Constant blocks yield zero blocks.
    pub fn compute(
        &self,
        problem: &Problem,
        pool: &[Float],
        requested: &[ParameterBlockId],
    ) -> Result<HashMap<ParameterBlockId, Matrix>> {
        problem.check_pool(pool)?;
        let layout = problem.active_layout();
        let eval = problem.evaluate(pool, &layout)?;
        let hessian = eval.jacobian.transpose() * &eval.jacobian;
        let pinv = pseudo_inverse(&hessian);

        let mut blocks = HashMap::with_capacity(requested.len());
        for &id in requested {
            let block = &problem.parameter_blocks[id.0];
            if block.constant || !layout.index_of.contains_key(&id) {
                blocks.insert(id, Matrix::zeros(block.size, block.size));
                continue;
            }
            let col = layout.col_offsets[layout.index_of[&id]];
            let local = block.local_size();
            let local_cov = pinv.view((col, col), (local, local)).into_owned();
            let lift = block.plus_jacobian(&pool[block.offset..block.offset + block.size]);
            blocks.insert(id, &lift * local_cov * lift.transpose());
        }
        Ok(blocks)
    }
}

fn pseudo_inverse(matrix: &Matrix) -> Matrix {
    let svd = matrix.clone().svd(true, true);
    let max_singular = svd.singular_values.amax();
    let threshold = max_singular * MIN_RECIPROCAL_CONDITION_NUMBER.sqrt();
    let mut inv_singular = svd.singular_values.clone();
    for v in inv_singular.iter_mut() {
        *v = if *v > threshold { 1.0 / *v } else { 0.0 };
    }
    let u = svd.u.as_ref().expect("svd computed with u");
    let v_t = svd.v_t.as_ref().expect("svd computed with v_t");
    v_t.transpose() * Matrix::from_diagonal(&inv_singular) * u.transpose()
}
