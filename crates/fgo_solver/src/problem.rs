use std::{collections::HashMap, sync::Arc};

use fgo_linalg::{Float, Matrix, Vector};

use crate::{CostFunction, Loss, Manifold, Result, SolverError};

/// Step used for central-difference numeric Jacobians, in local coordinates.
const NUMERIC_DIFF_STEP: Float = 1e-6;

/// Handle of a parameter block inside a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterBlockId(pub(crate) usize);

/// Handle of a residual block inside a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidualBlockId(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct ParameterBlock {
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) manifold: Option<Arc<dyn Manifold>>,
    pub(crate) constant: bool,
}

impl ParameterBlock {
    pub(crate) fn local_size(&self) -> usize {
        self.manifold.as_ref().map_or(self.size, |m| m.local_size())
    }

    pub(crate) fn plus(&self, x: &[Float], delta: &[Float], out: &mut [Float]) {
        match &self.manifold {
            Some(m) => m.plus(x, delta, out),
            None => {
                for i in 0..self.size {
                    out[i] = x[i] + delta[i];
                }
            }
        }
    }

    pub(crate) fn plus_jacobian(&self, x: &[Float]) -> Matrix {
        match &self.manifold {
            Some(m) => m.plus_jacobian(x),
            None => Matrix::identity(self.size, self.size),
        }
    }
}

pub(crate) struct ResidualBlock {
    pub(crate) cost: Box<dyn CostFunction>,
    pub(crate) loss: Option<Box<dyn Loss>>,
    pub(crate) params: Vec<ParameterBlockId>,
}

/// Column layout of the free (non-constant) parameter blocks in the stacked
/// Jacobian. Rebuilt whenever the problem structure changes.
pub(crate) struct ActiveLayout {
    /// Free blocks in insertion order.
    pub(crate) blocks: Vec<ParameterBlockId>,
    /// Column offset of each free block, parallel to `blocks`.
    pub(crate) col_offsets: Vec<usize>,
    /// Total number of local coordinates.
    pub(crate) num_cols: usize,
    /// Reverse lookup from block id to position in `blocks`.
    pub(crate) index_of: HashMap<ParameterBlockId, usize>,
}

/// Result of a full evaluation at one state: cost, stacked Jacobian over the
/// free blocks and the gradient `J^T r` of the (loss-scaled) objective.
pub(crate) struct Evaluation {
    pub(crate) cost: Float,
    pub(crate) jacobian: Matrix,
    pub(crate) gradient: Vector,
}

/// A nonlinear least-squares problem over a caller-owned state pool.
///
/// Parameter blocks are slices of the pool identified by offset; the pool
/// itself is only supplied at evaluation and solve time, so the graph can
/// keep handing out the same offsets across optimizer runs.
#[derive(Default)]
pub struct Problem {
    pub(crate) parameter_blocks: Vec<ParameterBlock>,
    pub(crate) residual_blocks: Vec<ResidualBlock>,
    offset_index: HashMap<usize, ParameterBlockId>,
}

impl Problem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter block at `offset` with `size` values and an
    /// optional manifold. Registering the same offset again returns the
    /// existing block, mirroring idempotent problem assembly.
    pub fn add_parameter_block(
        &mut self,
        offset: usize,
        size: usize,
        manifold: Option<Arc<dyn Manifold>>,
    ) -> Result<ParameterBlockId> {
        if let Some(&id) = self.offset_index.get(&offset) {
            if self.parameter_blocks[id.0].size != size {
                return Err(SolverError::OverlappingParameterBlock(offset));
            }
            if let Some(m) = manifold {
                // Last writer wins, as with repeated AddParameterBlock calls.
                self.parameter_blocks[id.0].manifold = Some(m);
            }
            return Ok(id);
        }
        let id = ParameterBlockId(self.parameter_blocks.len());
        self.parameter_blocks.push(ParameterBlock {
            offset,
            size,
            manifold,
            constant: false,
        });
        self.offset_index.insert(offset, id);
        Ok(id)
    }

    pub fn set_parameter_block_constant(&mut self, id: ParameterBlockId) {
        self.parameter_blocks[id.0].constant = true;
    }

    pub fn set_parameter_block_variable(&mut self, id: ParameterBlockId) {
        self.parameter_blocks[id.0].constant = false;
    }

    #[must_use]
    pub fn is_parameter_block_constant(&self, id: ParameterBlockId) -> bool {
        self.parameter_blocks[id.0].constant
    }

    pub fn add_residual_block(
        &mut self,
        cost: Box<dyn CostFunction>,
        loss: Option<Box<dyn Loss>>,
        params: &[ParameterBlockId],
    ) -> Result<ResidualBlockId> {
        let sizes = cost.parameter_sizes();
        for (index, (&id, &expected)) in params.iter().zip(sizes).enumerate() {
            let block = self
                .parameter_blocks
                .get(id.0)
                .ok_or(SolverError::UnknownParameterBlock(id))?;
            if block.size != expected {
                return Err(SolverError::ParameterSizeMismatch {
                    index,
                    expected,
                    actual: block.size,
                });
            }
        }
        let id = ResidualBlockId(self.residual_blocks.len());
        self.residual_blocks.push(ResidualBlock {
            cost,
            loss,
            params: params.to_vec(),
        });
        Ok(id)
    }

    #[must_use]
    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    #[must_use]
    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    #[must_use]
    pub fn num_residuals(&self) -> usize {
        self.residual_blocks
            .iter()
            .map(|rb| rb.cost.num_residuals())
            .sum()
    }

    /// Evaluate one residual block's raw (loss-free) residual at the current
    /// pool state.
    pub fn evaluate_residual_block(&self, pool: &[Float], id: ResidualBlockId) -> Result<Vector> {
        let rb = &self.residual_blocks[id.0];
        let params = self.gather_params(pool, &rb.params)?;
        let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
        Ok(rb.cost.residual(&views))
    }

    pub(crate) fn check_pool(&self, pool: &[Float]) -> Result<()> {
        for block in &self.parameter_blocks {
            if block.offset + block.size > pool.len() {
                return Err(SolverError::PoolTooShort {
                    pool: pool.len(),
                    offset: block.offset,
                    size: block.size,
                });
            }
        }
        Ok(())
    }

    fn gather_params(&self, pool: &[Float], ids: &[ParameterBlockId]) -> Result<Vec<Vec<Float>>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let block = &self.parameter_blocks[id.0];
            if block.offset + block.size > pool.len() {
                return Err(SolverError::PoolTooShort {
                    pool: pool.len(),
                    offset: block.offset,
                    size: block.size,
                });
            }
            out.push(pool[block.offset..block.offset + block.size].to_vec());
        }
        Ok(out)
    }

    pub(crate) fn active_layout(&self) -> ActiveLayout {
        let mut blocks = Vec::new();
        let mut col_offsets = Vec::new();
        let mut index_of = HashMap::new();
        let mut num_cols = 0;
        for (i, block) in self.parameter_blocks.iter().enumerate() {
            if block.constant {
                continue;
            }
            let id = ParameterBlockId(i);
            index_of.insert(id, blocks.len());
            blocks.push(id);
            col_offsets.push(num_cols);
            num_cols += block.local_size();
        }
        ActiveLayout {
            blocks,
            col_offsets,
            num_cols,
            index_of,
        }
    }

    /// Total objective `1/2 * sum_i rho_i(||r_i||^2)` at the given state.
    pub(crate) fn cost(&self, pool: &[Float]) -> Result<Float> {
        let mut total = 0.0;
        for rb in &self.residual_blocks {
            let params = self.gather_params(pool, &rb.params)?;
            let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
            let r = rb.cost.residual(&views);
            let s = r.norm_squared();
            total += 0.5
                * match &rb.loss {
                    Some(loss) => loss.evaluate(s)[0],
                    None => s,
                };
        }
        Ok(total)
    }

    /// Full evaluation: cost, stacked Jacobian, residuals and gradient.
    pub(crate) fn evaluate(&self, pool: &[Float], layout: &ActiveLayout) -> Result<Evaluation> {
        let num_rows = self.num_residuals();
        let mut jacobian = Matrix::zeros(num_rows, layout.num_cols);
        let mut residuals = Vector::zeros(num_rows);
        let mut cost = 0.0;

        let mut row = 0;
        for rb in &self.residual_blocks {
            let params = self.gather_params(pool, &rb.params)?;
            let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
            let r = rb.cost.residual(&views);
            let dim = rb.cost.num_residuals();
            let s = r.norm_squared();
            let (rho, scale) = match &rb.loss {
                Some(loss) => {
                    let [rho, rho_prime] = loss.evaluate(s);
                    (rho, rho_prime.max(0.0).sqrt())
                }
                None => (s, 1.0),
            };
            cost += 0.5 * rho;
            residuals.rows_mut(row, dim).copy_from(&(&r * scale));

            for (slot, &pid) in rb.params.iter().enumerate() {
                let block = &self.parameter_blocks[pid.0];
                if block.constant {
                    continue;
                }
                let col = layout.col_offsets[layout.index_of[&pid]];
                let local = block.local_size();
                let j = match rb.cost.jacobian(&views, slot) {
                    Some(j) => j,
                    None => numeric_jacobian(rb.cost.as_ref(), &views, slot, block, &r),
                };
                jacobian
                    .view_mut((row, col), (dim, local))
                    .copy_from(&(j * scale));
            }
            row += dim;
        }

        let gradient = jacobian.transpose() * &residuals;
        Ok(Evaluation {
            cost,
            jacobian,
            gradient,
        })
    }

    /// Apply a stacked local step to the free blocks of `x`.
    pub(crate) fn plus(&self, x: &[Float], delta: &Vector, layout: &ActiveLayout) -> Vec<Float> {
        let mut out = x.to_vec();
        for (pos, &pid) in layout.blocks.iter().enumerate() {
            let block = &self.parameter_blocks[pid.0];
            let col = layout.col_offsets[pos];
            let local = block.local_size();
            let step: Vec<Float> = delta.as_slice()[col..col + local].to_vec();
            let current = x[block.offset..block.offset + block.size].to_vec();
            block.plus(
                &current,
                &step,
                &mut out[block.offset..block.offset + block.size],
            );
        }
        out
    }

    /// Euclidean norm over the free blocks' global coordinates, used by the
    /// step-tolerance test.
    pub(crate) fn state_norm(&self, x: &[Float], layout: &ActiveLayout) -> Float {
        let mut sum = 0.0;
        for &pid in &layout.blocks {
            let block = &self.parameter_blocks[pid.0];
            for v in &x[block.offset..block.offset + block.size] {
                sum += v * v;
            }
        }
        sum.sqrt()
    }
}

/// Central-difference Jacobian of one parameter slot, taken in the block's
/// local coordinates so manifold blocks differentiate along their tangent.
fn numeric_jacobian(
    cost: &dyn CostFunction,
    params: &[&[Float]],
    slot: usize,
    block: &ParameterBlock,
    _r0: &Vector,
) -> Matrix {
    let local = block.local_size();
    let dim = cost.num_residuals();
    let mut jacobian = Matrix::zeros(dim, local);
    let x0 = params[slot].to_vec();
    let mut delta = vec![0.0; local];

    let residual_at = |state: &[Float]| {
        let mut perturbed_params = params.to_vec();
        perturbed_params[slot] = state;
        cost.residual(&perturbed_params)
    };

    for k in 0..local {
        delta[k] = NUMERIC_DIFF_STEP;
        let mut plus = x0.clone();
        block.plus(&x0, &delta, &mut plus);
        let r_plus = residual_at(&plus);

        delta[k] = -NUMERIC_DIFF_STEP;
        let mut minus = x0.clone();
        block.plus(&x0, &delta, &mut minus);
        let r_minus = residual_at(&minus);

        jacobian
            .column_mut(k)
            .copy_from(&((r_plus - r_minus) / (2.0 * NUMERIC_DIFF_STEP)));
        delta[k] = 0.0;
    }
    jacobian
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use approx::assert_relative_eq;

    use super::*;

    /// r = [x0 - 3, x1 + 1]
    struct Shift;

    impl CostFunction for Shift {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_sizes(&self) -> &[usize] {
            &[2]
        }

        fn residual(&self, params: &[&[Float]]) -> Vector {
            Vector::from_vec(vec![params[0][0] - 3.0, params[0][1] + 1.0])
        }
    }

    #[test]
    fn parameter_blocks_are_deduplicated_by_offset() {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(0, 2, None).unwrap();
        let b = problem.add_parameter_block(0, 2, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(problem.num_parameter_blocks(), 1);
    }

    #[test]
    fn mismatched_redefinition_is_rejected() {
        let mut problem = Problem::new();
        problem.add_parameter_block(0, 2, None).unwrap();
        assert!(problem.add_parameter_block(0, 3, None).is_err());
    }

    #[test]
    fn cost_matches_half_squared_norm() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Shift), None, &[block])
            .unwrap();
        let pool = vec![0.0, 0.0];
        assert_relative_eq!(problem.cost(&pool).unwrap(), 0.5 * (9.0 + 1.0));
    }

    #[test]
    fn numeric_jacobian_of_linear_residual_is_exact() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Shift), None, &[block])
            .unwrap();
        let pool = vec![1.0, -2.0];
        let layout = problem.active_layout();
        let eval = problem.evaluate(&pool, &layout).unwrap();
        assert_relative_eq!(eval.jacobian[(0, 0)], 1.0, epsilon = 1e-8);
        assert_relative_eq!(eval.jacobian[(1, 1)], 1.0, epsilon = 1e-8);
        assert_relative_eq!(eval.jacobian[(0, 1)], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn constant_blocks_have_no_columns() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Shift), None, &[block])
            .unwrap();
        problem.set_parameter_block_constant(block);
        let layout = problem.active_layout();
        assert_eq!(layout.num_cols, 0);
    }
}
