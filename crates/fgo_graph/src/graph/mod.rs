//! The factor graph: a bipartite graph of variable nodes and factor nodes
//! with incremental construction, state fixing, optimization,
//! marginalization and covariance recovery.

mod indices;
mod marginalize;
mod optimize;
mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use fgo_linalg::{Float, Matrix, Vector};
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::{
    factor::{
        camera::{CameraSe3Point3Factor, DistortedCameraProjectionFactor, DistortedVariant},
        imu::{ImuFactor, ImuParameters, ImuVariant},
        make_gaussian_factor, Factor, FactorId, FactorType,
    },
    registry::{EnsureOutcome, VariableRegistry},
    variable::{GroupId, NodeId, VariableType},
};

pub use optimize::{OptimizeOptions, SolutionInfo};

/// Errors that terminate an engine call outright. Recoverable validation
/// failures travel as per-id sentinel sequences instead (see the
/// `validate_*` methods).
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("solver error: {0}")]
    Solver(#[from] fgo_solver::SolverError),
}

/// A factor graph over typed manifold-valued variables.
///
/// Variables are created implicitly by the factors that reference them and
/// destroyed by dangling-node garbage collection when their last factor goes
/// away. A graph instance is owned by one caller at a time; mutation and
/// optimization are not reentrant.
#[derive(Default)]
pub struct FactorGraph {
    pub(crate) variables: VariableRegistry,
    /// Factor storage, keyed by monotonically assigned factor id.
    pub(crate) factors: BTreeMap<FactorId, Box<dyn Factor>>,
    pub(crate) factor_types: BTreeMap<FactorId, FactorType>,
    /// Adjacency: node id to the factors incident on it. Insertion order is
    /// preserved so optimization walks are deterministic.
    pub(crate) node_to_factors: IndexMap<NodeId, IndexSet<FactorId>>,
    /// node_type -> node ids.
    pub(crate) node_type_index: HashMap<VariableType, BTreeSet<NodeId>>,
    /// factor_type -> node_type -> node ids.
    pub(crate) factor_type_index: HashMap<FactorType, HashMap<VariableType, BTreeSet<NodeId>>>,
    /// group -> factor_type -> node_type -> node ids.
    pub(crate) group_index:
        HashMap<GroupId, HashMap<FactorType, HashMap<VariableType, BTreeSet<NodeId>>>>,
    /// Candidates for dangling-node garbage collection.
    pub(crate) dangling: BTreeSet<NodeId>,
    /// Marginal covariance blocks from the last optimization that requested
    /// them, keyed by node id.
    pub(crate) covariances: HashMap<NodeId, Matrix>,
    next_factor_id: FactorId,
}

impl FactorGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.variables.len()
    }

    #[must_use]
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    #[must_use]
    pub fn has_node(&self, id: NodeId) -> bool {
        self.variables.contains(id)
    }

    #[must_use]
    pub fn node_type(&self, id: NodeId) -> Option<VariableType> {
        self.variables.var_type(id)
    }

    /// User-facing node type string; empty when the node does not exist.
    #[must_use]
    pub fn node_type_string(&self, id: NodeId) -> String {
        self.node_type(id).map(|t| t.to_string()).unwrap_or_default()
    }

    #[must_use]
    pub fn node_state(&self, id: NodeId) -> Option<&[Float]> {
        self.variables.state(id)
    }

    #[must_use]
    pub fn is_fixed(&self, id: NodeId) -> Option<bool> {
        self.variables.is_fixed(id)
    }

    /// Add or set a variable explicitly. When the id exists this behaves as a
    /// dim/type-checked state set; otherwise the variable is created.
    pub fn set_variable(&mut self, id: NodeId, state: &[Float], var_type: VariableType) -> bool {
        if self.variables.contains(id) {
            if self.variables.var_type(id) != Some(var_type)
                || self.variables.dim(id) != Some(state.len())
            {
                return false;
            }
            return self.variables.set_state(id, state);
        }
        self.variables.ensure(id, var_type, state) == EnsureOutcome::Created
    }

    /// The marginal covariance block stored for `id` by the last optimization
    /// that requested it.
    #[must_use]
    pub fn node_covariance(&self, id: NodeId) -> Option<&Matrix> {
        self.covariances.get(&id)
    }

    /// Raw residual of one factor at the current states.
    #[must_use]
    pub fn factor_residual(&self, factor_id: FactorId) -> Option<Vector> {
        let factor = self.factors.get(&factor_id)?;
        let params = self.gather_factor_params(factor.as_ref());
        let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
        Some(factor.create_cost_function().residual(&views))
    }

    #[must_use]
    pub fn factor_type_of(&self, factor_id: FactorId) -> Option<FactorType> {
        self.factor_types.get(&factor_id).copied()
    }

    pub(crate) fn gather_factor_params(&self, factor: &dyn Factor) -> Vec<Vec<Float>> {
        factor
            .variable_ids()
            .iter()
            .map(|&id| {
                self.variables
                    .state(id)
                    .expect("factor variables exist in the registry")
                    .to_vec()
            })
            .collect()
    }

    /// Add a factor, creating any missing variables with their family
    /// defaults. Returns `None` (leaving the graph untouched) when an
    /// existing variable's dimension or type contradicts the factor's
    /// declaration.
    pub fn add_factor(
        &mut self,
        factor: Box<dyn Factor>,
        factor_type: FactorType,
    ) -> Option<FactorId> {
        for &id in factor.variable_ids() {
            if self.variables.contains(id)
                && (self.variables.dim(id) != Some(factor.variable_dim(id))
                    || self.variables.var_type(id) != Some(factor.variable_type(id)))
            {
                warn!(id, "rejected factor: variable schema mismatch");
                return None;
            }
        }

        for &id in factor.variable_ids() {
            let default_state = factor.default_state(id);
            self.variables
                .ensure(id, factor.variable_type(id), &default_state);
        }

        let factor_id = self.next_factor_id;
        self.next_factor_id += 1;
        for &id in factor.variable_ids() {
            self.node_to_factors.entry(id).or_default().insert(factor_id);
        }
        self.factors.insert(factor_id, factor);
        self.factor_types.insert(factor_id, factor_type);
        debug!(factor_id, %factor_type, "added factor");
        Some(factor_id)
    }

    /// Connected node ids of every factor of the given type, concatenated in
    /// factor-id order. Graph introspection and visualization.
    #[must_use]
    pub fn get_edges(&self, factor_type: FactorType) -> Vec<NodeId> {
        let mut edges = Vec::new();
        for (fid, factor) in &self.factors {
            if self.factor_types.get(fid) == Some(&factor_type) {
                edges.extend_from_slice(factor.variable_ids());
            }
        }
        edges
    }

    /// Whether the given node ids are all pose nodes of one flavour.
    #[must_use]
    pub fn is_pose_node(&self, ids: &[NodeId]) -> bool {
        let all_of = |t: VariableType| {
            ids.iter()
                .all(|id| self.node_type_index.get(&t).is_some_and(|s| s.contains(id)))
        };
        all_of(VariableType::PoseSe3) || all_of(VariableType::PoseSe2)
    }

    /// Whether the (sub)graph is one connected component, by union-find.
    ///
    /// `None` examines the whole graph; a seed list examines the subgraph
    /// induced by the same inclusion rules as partial optimization.
    #[must_use]
    pub fn is_connected(&self, seed_ids: Option<&[NodeId]>) -> bool {
        let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
        let mut count: HashMap<NodeId, usize> = HashMap::new();
        let mut all_ids: Vec<NodeId> = Vec::new();

        let mut add_node = |parent: &mut HashMap<NodeId, NodeId>,
                            count: &mut HashMap<NodeId, usize>,
                            all_ids: &mut Vec<NodeId>,
                            id: NodeId| {
            if !parent.contains_key(&id) {
                parent.insert(id, id);
                count.insert(id, 1);
                all_ids.push(id);
            }
        };

        match seed_ids {
            None => {
                for id in self.variables.ids() {
                    add_node(&mut parent, &mut count, &mut all_ids, id);
                }
                for factor in self.factors.values() {
                    let ids = factor.variable_ids();
                    for &other in &ids[1..] {
                        union(&mut parent, &mut count, ids[0], other);
                    }
                }
            }
            Some(seeds) => {
                for &seed in seeds {
                    add_node(&mut parent, &mut count, &mut all_ids, seed);
                }
                let mut visited: IndexSet<FactorId> = IndexSet::new();
                for &seed in seeds {
                    let Some(incident) = self.node_to_factors.get(&seed) else {
                        continue;
                    };
                    for &fid in incident {
                        if !visited.insert(fid) {
                            continue;
                        }
                        if self.excluded_from_partial_graph(fid, seeds) {
                            continue;
                        }
                        let ids = self.factors[&fid].variable_ids();
                        for &id in ids {
                            add_node(&mut parent, &mut count, &mut all_ids, id);
                        }
                        for &other in &ids[1..] {
                            union(&mut parent, &mut count, ids[0], other);
                        }
                    }
                }
            }
        }

        let roots = all_ids.iter().filter(|id| parent[id] == **id).count();
        roots == 1
    }

    /// Remove factors by id. Returns the ids of the nodes deleted by the
    /// dangling-node garbage collection (sorted), or the existence validation
    /// sequence when any factor id is unknown.
    pub fn remove_factors(&mut self, ids: &[FactorId]) -> Vec<i32> {
        let validness = self.validate_factor_existence(ids);
        if validness.last() == Some(&-1) {
            return validness;
        }
        self.remove_factors_unchecked(ids);
        self.collect_dangling_nodes()
    }

    /// Remove nodes by id, cascading removal of every incident factor.
    /// Returns `[removed node ids (sorted), removed factor ids (sorted),
    /// removed node count]`, or the existence validation sequence.
    pub fn remove_nodes(&mut self, ids: &[NodeId]) -> Vec<i32> {
        let validness = self.validate_existence(ids);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let mut removed_factors: Vec<FactorId> = Vec::new();
        for &node in ids {
            let incident: Vec<FactorId> = self
                .node_to_factors
                .get(&node)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            self.remove_factors_unchecked(&incident);
            removed_factors.extend(incident);
        }

        let mut output = self.collect_dangling_nodes();
        let node_count = output.len() as i32;
        removed_factors.sort_unstable();
        output.extend(removed_factors);
        output.push(node_count);
        output
    }

    /// Erase factors from the registry and every index, queueing their nodes
    /// as dangling candidates. No existence validation.
    pub(crate) fn remove_factors_unchecked(&mut self, ids: &[FactorId]) {
        for &fid in ids {
            let Some(factor) = self.factors.remove(&fid) else {
                continue;
            };
            for &node in factor.variable_ids() {
                if let Some(incident) = self.node_to_factors.get_mut(&node) {
                    incident.shift_remove(&fid);
                }
                self.dangling.insert(node);
            }
            self.factor_types.remove(&fid);
        }
    }

    /// Delete every queued candidate whose incident set is now empty,
    /// scrubbing it from the registry and all indices. Returns the removed
    /// node ids, sorted.
    pub(crate) fn collect_dangling_nodes(&mut self) -> Vec<i32> {
        let candidates = std::mem::take(&mut self.dangling);
        let mut removed = Vec::new();
        for node in candidates {
            let is_dangling = self
                .node_to_factors
                .get(&node)
                .map_or(true, |incident| incident.is_empty());
            if !is_dangling {
                continue;
            }
            let Some(node_type) = self.variables.var_type(node) else {
                continue;
            };
            self.variables.remove(node);
            self.node_to_factors.shift_remove(&node);
            self.covariances.remove(&node);
            self.erase_from_indices(node, node_type);
            removed.push(node);
        }
        removed.sort_unstable();
        debug!(?removed, "dangling-node garbage collection");
        removed
    }
}

fn find(parent: &mut HashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
    while parent[&id] != id {
        let grandparent = parent[&parent[&id]];
        parent.insert(id, grandparent);
        id = grandparent;
    }
    id
}

fn union(
    parent: &mut HashMap<NodeId, NodeId>,
    count: &mut HashMap<NodeId, usize>,
    id1: NodeId,
    id2: NodeId,
) {
    let root1 = find(parent, id1);
    let root2 = find(parent, id2);
    if root1 == root2 {
        return;
    }
    if count[&root1] >= count[&root2] {
        parent.insert(root2, root1);
        *count.get_mut(&root1).expect("root present") += count[&root2];
    } else {
        parent.insert(root1, root2);
        *count.get_mut(&root2).expect("root present") += count[&root1];
    }
}

impl FactorGraph {
    /// Bulk-add Gaussian noise model factors of one family.
    ///
    /// `ids`, `measurements` and `informations` hold `num_factors` factors'
    /// worth of data back to back; a single factor's worth of information
    /// values means one shared information matrix for all of them
    /// (disambiguated by length equality). Returns the new factor ids, or the
    /// validation sequence (offending ids then `-1`) with nothing mutated.
    pub fn add_gaussian_factors(
        &mut self,
        factor_type: FactorType,
        ids: &[NodeId],
        measurements: &[Float],
        informations: &[Float],
        num_factors: usize,
        group_ids: &[GroupId],
    ) -> Vec<i32> {
        if num_factors == 0 || ids.is_empty() {
            return vec![-1];
        }
        let length_id = ids.len() / num_factors;
        let length_measurement = measurements.len() / num_factors;

        let Some(template) = make_gaussian_factor(factor_type, ids[..length_id].to_vec()) else {
            return vec![-1];
        };
        let num_slots = template.variable_ids().len();
        let length_information = template.information_len();
        let shared_information = informations.len() == length_information;

        let validness = self.validate_factor(template.as_ref(), ids, num_slots);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let mut factor_ids = Vec::with_capacity(num_factors);
        let mut information_cursor = 0;
        for k in 0..num_factors {
            let current_ids = ids[k * length_id..(k + 1) * length_id].to_vec();
            let mut factor =
                make_gaussian_factor(factor_type, current_ids).expect("family validated above");
            factor.set_measurement(
                &measurements[k * length_measurement..(k + 1) * length_measurement],
            );
            if shared_information {
                factor.set_information(informations);
            } else {
                factor.set_information(
                    &informations[information_cursor..information_cursor + length_information],
                );
                information_cursor += length_information;
            }
            let Some(fid) = self.add_factor(factor, factor_type) else {
                // The bulk set validated as a whole; a failure here means an
                // earlier factor in this very batch created a contradicting
                // variable, which the single-type families cannot do.
                factor_ids.push(-1);
                continue;
            };
            factor_ids.push(fid);
        }

        self.index_gaussian_factor_nodes(factor_type, template.as_ref(), ids, group_ids);
        factor_ids
    }

    /// Bulk-add pinhole camera projection factors (`[pose, point]` pairs with
    /// a shared fixed sensor transform).
    pub fn add_camera_projection_factors(
        &mut self,
        ids: &[NodeId],
        measurements: &[Float],
        informations: &[Float],
        num_factors: usize,
        group_ids: &[GroupId],
        sensor_transform: &[Float],
    ) -> Vec<i32> {
        if num_factors == 0 || ids.is_empty() {
            return vec![-1];
        }
        let length_id = ids.len() / num_factors;
        let length_measurement = measurements.len() / num_factors;
        let length_information = 4;

        let template = CameraSe3Point3Factor::new(ids[..length_id].to_vec());
        let shared_information = informations.len() == template.information_len();
        let validness = self.validate_factor(&template, ids, 2);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let mut factor_ids = Vec::with_capacity(num_factors);
        let mut information_cursor = 0;
        for k in 0..num_factors {
            let current_ids = ids[k * length_id..(k + 1) * length_id].to_vec();
            let mut factor = CameraSe3Point3Factor::new(current_ids);
            factor.set_measurement(
                &measurements[k * length_measurement..(k + 1) * length_measurement],
            );
            if shared_information {
                factor.set_information(informations);
            } else {
                factor.set_information(
                    &informations[information_cursor..information_cursor + length_information],
                );
                information_cursor += length_information;
            }
            factor.set_sensor_transform(sensor_transform);
            match self.add_factor(Box::new(factor), FactorType::CameraSe3Point3) {
                Some(fid) => factor_ids.push(fid),
                None => factor_ids.push(-1),
            }
        }

        self.index_pose_point_nodes(FactorType::CameraSe3Point3, ids, group_ids);
        factor_ids
    }

    /// Bulk-add distorted pinhole projection factors of the named variant.
    ///
    /// Intrinsics follow the same shared-versus-per-factor length
    /// disambiguation as the information matrices; they only apply to the
    /// fixed-intrinsic variants.
    #[allow(clippy::too_many_arguments)]
    pub fn add_distorted_camera_projection_factors(
        &mut self,
        factor_type: FactorType,
        ids: &[NodeId],
        measurements: &[Float],
        informations: &[Float],
        num_factors: usize,
        intrinsics: &[Float],
        sensor_transform: &[Float],
        group_ids: &[GroupId],
    ) -> Vec<i32> {
        let variant = match factor_type {
            FactorType::DistortedPinholeVariableIntrinsics => DistortedVariant::VariableIntrinsics,
            FactorType::DistortedPinholeAspectRatioVariableIntrinsics => {
                DistortedVariant::AspectRatioVariableIntrinsics
            }
            FactorType::DistortedPinholeFixedIntrinsics => DistortedVariant::FixedIntrinsics,
            FactorType::DistortedPinholeFixedIntrinsicsAndSensorTransform => {
                DistortedVariant::FixedIntrinsicsAndSensorTransform
            }
            _ => return vec![-1],
        };
        if num_factors == 0 || ids.is_empty() {
            return vec![-1];
        }

        let length_id = ids.len() / num_factors;
        let length_measurement = measurements.len() / num_factors;
        let length_information = informations.len() / num_factors;

        let template = DistortedCameraProjectionFactor::new(variant, ids[..length_id].to_vec());
        let num_slots = variant.num_nodes();
        let shared_information = informations.len() == template.information_len();
        let fixed_intrinsic_len = variant.fixed_intrinsic_len();
        let shared_intrinsics = intrinsics.len() == fixed_intrinsic_len;
        let valid_intrinsics = !intrinsics.is_empty() && fixed_intrinsic_len > 0;

        let validness = self.validate_factor(&template, ids, num_slots);
        if validness.last() == Some(&-1) {
            return validness;
        }

        let mut factor_ids = Vec::with_capacity(num_factors);
        let mut information_cursor = 0;
        let mut intrinsic_cursor = 0;
        for k in 0..num_factors {
            let current_ids = ids[k * length_id..(k + 1) * length_id].to_vec();
            let mut factor = DistortedCameraProjectionFactor::new(variant, current_ids.clone());
            factor.set_measurement(
                &measurements[k * length_measurement..(k + 1) * length_measurement],
            );
            factor.set_sensor_transform(sensor_transform);
            if shared_information {
                factor.set_information(informations);
            } else {
                factor.set_information(
                    &informations[information_cursor..information_cursor + length_information],
                );
                information_cursor += length_information;
            }
            if valid_intrinsics {
                if shared_intrinsics {
                    factor.set_intrinsics(intrinsics);
                } else {
                    factor.set_intrinsics(
                        &intrinsics[intrinsic_cursor..intrinsic_cursor + fixed_intrinsic_len],
                    );
                    intrinsic_cursor += fixed_intrinsic_len;
                }
            }
            // Indexed under the user-facing camera factor type.
            match self.add_factor(Box::new(factor), FactorType::CameraSe3Point3) {
                Some(fid) => factor_ids.push(fid),
                None => factor_ids.push(-1),
            }
            if group_ids.len() > 2 {
                let length_group = group_ids.len() / num_factors;
                let current_groups = &group_ids[k * length_group..(k + 1) * length_group];
                self.store_distorted_camera_groups(variant, &current_ids, current_groups);
            }
        }

        self.index_distorted_camera_nodes(variant, ids, group_ids);
        factor_ids
    }

    /// Add one IMU preintegration factor (or its gravity/scale and
    /// gravity/scale/transform variants). Returns the new factor id or `-1`
    /// when a connected variable's schema contradicts the graph.
    #[allow(clippy::too_many_arguments)]
    pub fn add_imu_factor(
        &mut self,
        variant: ImuVariant,
        ids: &[NodeId],
        params: ImuParameters,
        gyro_readings: &[Float],
        accel_readings: &[Float],
        sensor_transform: &[Float],
        group_ids: &[GroupId],
    ) -> i32 {
        let factor = ImuFactor::new(
            variant,
            ids.to_vec(),
            params,
            gyro_readings,
            accel_readings,
            sensor_transform,
        );
        match self.add_factor(Box::new(factor), FactorType::Imu) {
            Some(fid) => {
                self.store_imu_nodes(ids, group_ids);
                fid
            }
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests;
