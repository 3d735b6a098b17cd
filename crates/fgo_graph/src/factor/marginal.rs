//! The linear-Gaussian marginal factor produced by Schur-complement
//! elimination.
//!
//! Everything a marginal factor carries is captured at marginalization time
//! and immutable thereafter: the retained variable ordering, every involved
//! variable's linearization point, the square-root information Jacobian `J`
//! and linearized residual `r`. At evaluation time the residual is
//! `r + J * dx`, with `dx` the on-manifold difference between the current and
//! captured states.

use std::collections::HashMap;

use fgo_linalg::{quat_boxminus_approx, quat_from_xyzw, Float, Matrix, Vector};
use fgo_solver::CostFunction;

use super::{Factor, FactorId};
use crate::variable::{NodeId, VariableType};

/// Per-retained-variable bookkeeping captured at marginalization time.
#[derive(Debug, Clone)]
pub(crate) struct RetainedParameter {
    pub(crate) var_type: VariableType,
    /// Stored (global) state size.
    pub(crate) size: usize,
    /// Column offset of this variable's local block in the marginalized
    /// Jacobian.
    pub(crate) index: usize,
    /// State at the moment of marginalization.
    pub(crate) linearization_point: Vec<Float>,
}

#[derive(Debug, Clone)]
pub struct MarginalFactor {
    /// Factor ids that were eliminated into this factor.
    pub(crate) source_factor_ids: Vec<FactorId>,
    /// Retained variables, in the deterministic order assigned during
    /// elimination. These are the only variables the factor connects to.
    pub(crate) retained_ids: Vec<NodeId>,
    /// Variables eliminated by the Schur complement.
    pub(crate) marginalized_ids: Vec<NodeId>,
    pub(crate) retained: HashMap<NodeId, RetainedParameter>,
    /// Sum of the retained variables' local sizes; the residual dimension.
    pub(crate) retained_block_size: usize,
    /// Dense square-root information Jacobian, `retained_block_size` square.
    pub(crate) jacobian: Matrix,
    /// Linearized residual.
    pub(crate) residual: Vector,
}

impl MarginalFactor {
    /// Node ids eliminated when this factor was formed.
    #[must_use]
    pub fn marginalized_node_ids(&self) -> &[NodeId] {
        &self.marginalized_ids
    }

    /// Factor ids that were folded into this factor.
    #[must_use]
    pub fn source_factor_ids(&self) -> &[FactorId] {
        &self.source_factor_ids
    }

    #[must_use]
    pub fn retained_block_size(&self) -> usize {
        self.retained_block_size
    }

    /// State of `id` at the moment of marginalization.
    #[must_use]
    pub fn linearization_point(&self, id: NodeId) -> Option<&[Float]> {
        self.retained
            .get(&id)
            .map(|r| r.linearization_point.as_slice())
    }
}

impl Factor for MarginalFactor {
    fn variable_ids(&self) -> &[NodeId] {
        &self.retained_ids
    }

    fn variable_type(&self, id: NodeId) -> VariableType {
        self.retained
            .get(&id)
            .expect("queried id is retained by this marginal factor")
            .var_type
    }

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        let slots = self
            .retained_ids
            .iter()
            .map(|id| self.retained[id].clone())
            .collect::<Vec<_>>();
        Box::new(MarginalCost {
            sizes: slots.iter().map(|s| s.size).collect(),
            slots,
            num_residuals: self.retained_block_size,
            jacobian: self.jacobian.clone(),
            residual: self.residual.clone(),
        })
    }

    fn measurement_len(&self) -> usize {
        0
    }

    fn information_len(&self) -> usize {
        0
    }

    fn set_measurement(&mut self, _measurement: &[Float]) {}

    fn set_information(&mut self, _information: &[Float]) {}
}

struct MarginalCost {
    slots: Vec<RetainedParameter>,
    sizes: Vec<usize>,
    num_residuals: usize,
    jacobian: Matrix,
    residual: Vector,
}

/// On-manifold difference between a current state and the captured
/// linearization point, in the variable's local coordinates.
fn boxminus(var_type: VariableType, current: &[Float], captured: &[Float], out: &mut [Float]) {
    match var_type {
        VariableType::PoseSe3 | VariableType::TransformSe3 => {
            for i in 0..3 {
                out[i] = current[i] - captured[i];
            }
            let delta = quat_boxminus_approx(
                &quat_from_xyzw(&current[3..7]),
                &quat_from_xyzw(&captured[3..7]),
            );
            out[3..6].copy_from_slice(delta.as_slice());
        }
        VariableType::PoseSe3Scale => {
            for i in 0..3 {
                out[i] = current[i] - captured[i];
            }
            let delta = quat_boxminus_approx(
                &quat_from_xyzw(&current[3..7]),
                &quat_from_xyzw(&captured[3..7]),
            );
            out[3..6].copy_from_slice(delta.as_slice());
            out[6] = (current[7] / captured[7]).ln();
        }
        VariableType::Gravity => {
            let delta =
                quat_boxminus_approx(&quat_from_xyzw(current), &quat_from_xyzw(captured));
            out[0..3].copy_from_slice(delta.as_slice());
        }
        _ => {
            for i in 0..current.len() {
                out[i] = current[i] - captured[i];
            }
        }
    }
}

impl CostFunction for MarginalCost {
    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn parameter_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let mut delta = Vector::zeros(self.num_residuals);
        for (slot, current) in self.slots.iter().zip(params) {
            let local = slot.var_type.local_size();
            boxminus(
                slot.var_type,
                current,
                &slot.linearization_point,
                &mut delta.as_mut_slice()[slot.index..slot.index + local],
            );
        }
        &self.residual + &self.jacobian * delta
    }

    /// The marginal factor is linear: its Jacobian is the captured
    /// square-root block for the slot, independent of the evaluation point.
    fn jacobian(&self, _params: &[&[Float]], block: usize) -> Option<Matrix> {
        let slot = &self.slots[block];
        let local = slot.var_type.local_size();
        Some(self.jacobian.columns(slot.index, local).into_owned())
    }
}
