//! Schur-complement marginalization: eliminate a subset of variables into a
//! single linear-Gaussian marginal factor that preserves the information the
//! eliminated variables carried.

use std::collections::{BTreeSet, HashMap};

use fgo_linalg::{Float, Matrix, Vector};
use tracing::debug;

use crate::{
    factor::{
        marginal::{MarginalFactor, RetainedParameter},
        FactorId, FactorType, Linearization,
    },
    variable::NodeId,
};

use super::FactorGraph;

/// Eigenvalues at or below this threshold are treated as null space, both in
/// the pseudo-inverse of the marginalized block and in the square-root
/// resynthesis of the reduced information.
const EIGEN_EPSILON: Float = 1e-6;

impl FactorGraph {
    /// Marginalize a factor set: every variable connected only to factors in
    /// the set is eliminated, every variable that also has outside factors is
    /// retained by the new marginal factor.
    ///
    /// Returns `[new marginal factor id, eliminated node ids (sorted)]`, the
    /// factor-existence validation sequence, `[-2]` when no variable would be
    /// retained, or `[fixed ids, -3]` when a fixed variable would be
    /// eliminated. The graph is only mutated on success.
    pub fn marginalize_factors(&mut self, ids: &[FactorId]) -> Vec<i32> {
        let validness = self.validate_factor_existence(ids);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let factor = match self.build_marginal_factor(ids) {
            Ok(factor) => factor,
            Err(sentinel) => return sentinel,
        };
        let mut marginalized = factor.marginalized_node_ids().to_vec();
        marginalized.sort_unstable();

        self.remove_factors_unchecked(ids);
        self.collect_dangling_nodes();
        let marginal_id = self.add_marginal_factor(factor);

        let mut output = vec![marginal_id];
        output.extend(marginalized);
        output
    }

    /// Marginalize one node: eliminate its incident factors plus any velocity
    /// or IMU-bias priors that would otherwise be left on eliminated
    /// ancillaries.
    ///
    /// Returns `[new marginal factor id, eliminated node ids (sorted),
    /// removed factor ids (sorted), eliminated node count]`, or the failure
    /// sentinels of [`Self::marginalize_factors`].
    pub fn marginalize_node(&mut self, id: NodeId) -> Vec<i32> {
        let validness = self.validate_existence(&[id]);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let factor_ids = self.factors_for_node_marginalization(id);
        let factor = match self.build_marginal_factor(&factor_ids) {
            Ok(factor) => factor,
            Err(sentinel) => return sentinel,
        };
        let mut marginalized = factor.marginalized_node_ids().to_vec();
        marginalized.sort_unstable();

        self.remove_factors_unchecked(&factor_ids);
        self.collect_dangling_nodes();
        let marginal_id = self.add_marginal_factor(factor);

        let mut removed_factors = factor_ids;
        removed_factors.sort_unstable();

        let mut output = vec![marginal_id];
        let node_count = marginalized.len() as i32;
        output.extend(marginalized);
        output.extend(removed_factors);
        output.push(node_count);
        output
    }

    /// The factor set eliminated when marginalizing `id`: its incident
    /// factors, plus velocity-prior and bias-prior factors on any velocity or
    /// bias node those factors touch.
    pub(crate) fn factors_for_node_marginalization(&self, id: NodeId) -> Vec<FactorId> {
        let mut factor_ids: Vec<FactorId> = self
            .node_to_factors
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let touched: BTreeSet<NodeId> = factor_ids
            .iter()
            .flat_map(|fid| self.factors[fid].variable_ids().iter().copied())
            .collect();

        for (prior_type, node_type) in [
            (FactorType::Vel3Prior, crate::variable::VariableType::Vel3),
            (
                FactorType::ImuBiasPrior,
                crate::variable::VariableType::ImuBias,
            ),
        ] {
            let Some(nodes) = self
                .factor_type_index
                .get(&prior_type)
                .and_then(|node_map| node_map.get(&node_type))
            else {
                continue;
            };
            for &node in nodes {
                if !touched.contains(&node) {
                    continue;
                }
                let Some(incident) = self.node_to_factors.get(&node) else {
                    continue;
                };
                for &fid in incident {
                    if self.factor_types[&fid] == prior_type && !factor_ids.contains(&fid) {
                        factor_ids.push(fid);
                    }
                }
            }
        }
        factor_ids.sort_unstable();
        factor_ids
    }

    /// Linearize the factor set at the current states, partition its
    /// variables, Schur-complement out the eliminated block and synthesise
    /// the marginal factor. Fails with the reserved sentinels when no
    /// variable is retained (`[-2]`) or a fixed variable would be eliminated
    /// (`[fixed ids, -3]`).
    fn build_marginal_factor(&self, factor_ids: &[FactorId]) -> Result<MarginalFactor, Vec<i32>> {
        let set: BTreeSet<FactorId> = factor_ids.iter().copied().collect();

        // Linearize every subset factor around the current state.
        let mut linearizations: HashMap<FactorId, Linearization> = HashMap::new();
        let mut block_sizes: HashMap<NodeId, usize> = HashMap::new();
        for &fid in &set {
            let factor = self.factors[&fid].as_ref();
            let params = self.gather_factor_params(factor);
            let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
            linearizations.insert(fid, factor.linearize(&views));
            for &id in factor.variable_ids() {
                block_sizes.insert(
                    id,
                    self.variables.dim(id).expect("factor variables exist"),
                );
            }
        }

        // Partition: a variable is eliminated iff every factor incident on it
        // belongs to the subset.
        let mut checked: Vec<NodeId> = Vec::new();
        let mut eliminated: Vec<NodeId> = Vec::new();
        let mut retained: Vec<NodeId> = Vec::new();
        for &fid in &set {
            for &id in self.factors[&fid].variable_ids() {
                if checked.contains(&id) {
                    continue;
                }
                checked.push(id);
                let has_outside_factor = self
                    .node_to_factors
                    .get(&id)
                    .is_some_and(|incident| incident.iter().any(|f| !set.contains(f)));
                if has_outside_factor {
                    retained.push(id);
                } else {
                    eliminated.push(id);
                }
            }
        }

        if retained.is_empty() {
            return Err(vec![-2]);
        }
        let fixed_eliminated: Vec<NodeId> = eliminated
            .iter()
            .copied()
            .filter(|&id| self.variables.is_fixed(id) == Some(true))
            .collect();
        if !fixed_eliminated.is_empty() {
            let mut sentinel = fixed_eliminated;
            sentinel.push(-3);
            return Err(sentinel);
        }

        // Local-size index ordering: eliminated block first, then retained.
        let mut index_of: HashMap<NodeId, usize> = HashMap::new();
        let mut eliminated_block_size = 0;
        for &id in &eliminated {
            index_of.insert(id, eliminated_block_size);
            eliminated_block_size += self.local_size_of(id);
        }
        let mut retained_block_size = 0;
        for &id in &retained {
            index_of.insert(id, eliminated_block_size + retained_block_size);
            retained_block_size += self.local_size_of(id);
        }
        let total = eliminated_block_size + retained_block_size;

        // Joint Gauss-Newton system H = J^T J, b = J^T r over the ordering.
        let mut hessian = Matrix::zeros(total, total);
        let mut gradient = Vector::zeros(total);
        for &fid in &set {
            let factor = self.factors[&fid].as_ref();
            let linearization = &linearizations[&fid];
            let var_ids = factor.variable_ids();
            for (i, &id_i) in var_ids.iter().enumerate() {
                let index_i = index_of[&id_i];
                let size_i = self.local_size_of(id_i);
                let jacobian_i = &linearization.jacobians[i];
                for (j, &id_j) in var_ids.iter().enumerate().skip(i) {
                    let index_j = index_of[&id_j];
                    let size_j = self.local_size_of(id_j);
                    let jacobian_j = &linearization.jacobians[j];
                    let block = jacobian_i.transpose() * jacobian_j;
                    if i == j {
                        let mut view = hessian.view_mut((index_i, index_i), (size_i, size_i));
                        view += &block;
                    } else {
                        let mut view = hessian.view_mut((index_i, index_j), (size_i, size_j));
                        view += &block;
                        let transposed = block.transpose();
                        let mut view = hessian.view_mut((index_j, index_i), (size_j, size_i));
                        view.copy_from(&transposed);
                    }
                }
                let contribution = jacobian_i.transpose() * &linearization.residual;
                let mut view = gradient.rows_mut(index_i, size_i);
                view += &contribution;
            }
        }

        // Schur complement of the eliminated block, through an eigenvalue
        // pseudo-inverse so rank-deficient information (gauge-free subgraphs)
        // stays finite.
        let (reduced_h, reduced_b) = if eliminated_block_size == 0 {
            (
                hessian
                    .view(
                        (0, 0),
                        (retained_block_size, retained_block_size),
                    )
                    .into_owned(),
                gradient.rows(0, retained_block_size).into_owned(),
            )
        } else {
            let h_mm = hessian
                .view((0, 0), (eliminated_block_size, eliminated_block_size))
                .into_owned();
            let h_rr = hessian
                .view(
                    (eliminated_block_size, eliminated_block_size),
                    (retained_block_size, retained_block_size),
                )
                .into_owned();
            let h_mr = hessian
                .view(
                    (0, eliminated_block_size),
                    (eliminated_block_size, retained_block_size),
                )
                .into_owned();
            let h_rm = hessian
                .view(
                    (eliminated_block_size, 0),
                    (retained_block_size, eliminated_block_size),
                )
                .into_owned();
            let b_m = gradient.rows(0, eliminated_block_size).into_owned();
            let b_r = gradient
                .rows(eliminated_block_size, retained_block_size)
                .into_owned();

            let h_mm = 0.5 * (&h_mm + h_mm.transpose());
            let eigen = h_mm.symmetric_eigen();
            let inverted = eigen
                .eigenvalues
                .map(|v| if v > EIGEN_EPSILON { 1.0 / v } else { 0.0 });
            let h_mm_inv = &eigen.eigenvectors
                * Matrix::from_diagonal(&inverted)
                * eigen.eigenvectors.transpose();

            (
                &h_rr - &h_rm * &h_mm_inv * &h_mr,
                b_r - &h_rm * &h_mm_inv * b_m,
            )
        };

        // Square-root resynthesis: J = sqrt(L) V^T, r = sqrt(L^-1) V^T b.
        let eigen = reduced_h.symmetric_eigen();
        let clipped = eigen
            .eigenvalues
            .map(|v| if v > EIGEN_EPSILON { v } else { 0.0 });
        let clipped_inverse = clipped.map(|v| if v > EIGEN_EPSILON { 1.0 / v } else { 0.0 });
        let v_t = eigen.eigenvectors.transpose();
        let jacobian = Matrix::from_diagonal(&clipped.map(Float::sqrt)) * &v_t;
        let residual = Matrix::from_diagonal(&clipped_inverse.map(Float::sqrt)) * &v_t * reduced_b;

        let retained_params: HashMap<NodeId, RetainedParameter> = retained
            .iter()
            .map(|&id| {
                (
                    id,
                    RetainedParameter {
                        var_type: self.variables.var_type(id).expect("variable exists"),
                        size: block_sizes[&id],
                        index: index_of[&id] - eliminated_block_size,
                        linearization_point: self
                            .variables
                            .state(id)
                            .expect("variable exists")
                            .to_vec(),
                    },
                )
            })
            .collect();

        debug!(
            eliminated = eliminated.len(),
            retained = retained.len(),
            retained_block_size,
            "built marginal factor"
        );
        Ok(MarginalFactor {
            source_factor_ids: set.into_iter().collect(),
            retained_ids: retained,
            marginalized_ids: eliminated,
            retained: retained_params,
            retained_block_size,
            jacobian,
            residual,
        })
    }

    /// Register a marginal factor under a fresh factor id and the reserved
    /// marginal factor type.
    pub(crate) fn add_marginal_factor(&mut self, factor: MarginalFactor) -> FactorId {
        self.add_factor(Box::new(factor), FactorType::Marginal)
            .expect("retained variables exist with matching schemas")
    }

    fn local_size_of(&self, id: NodeId) -> usize {
        self.variables
            .var_type(id)
            .expect("variable exists")
            .local_size()
    }
}
