//! Maintenance of the three secondary indices
//! (`node_type -> ids`, `factor_type -> node_type -> ids`,
//! `group -> factor_type -> node_type -> ids`) and the `get_node_ids` query
//! they exist to answer.
//!
//! Every add updates the three maps together with the factor-registry
//! insertion; removal erases symmetrically and prunes empty inner maps so
//! existence queries never see stale empty buckets.

use std::collections::BTreeSet;

use crate::{
    factor::{camera::DistortedVariant, Factor, FactorType},
    variable::{GroupId, NodeId, VariableType},
};

use super::FactorGraph;

impl FactorGraph {
    pub(crate) fn store_node_ids(&mut self, node_type: VariableType, ids: &BTreeSet<NodeId>) {
        self.node_type_index
            .entry(node_type)
            .or_default()
            .extend(ids.iter().copied());
    }

    pub(crate) fn store_factor_types(
        &mut self,
        factor_type: FactorType,
        node_type: VariableType,
        ids: &BTreeSet<NodeId>,
    ) {
        self.factor_type_index
            .entry(factor_type)
            .or_default()
            .entry(node_type)
            .or_default()
            .extend(ids.iter().copied());
    }

    pub(crate) fn store_groups(
        &mut self,
        group: GroupId,
        factor_type: FactorType,
        node_type: VariableType,
        ids: &BTreeSet<NodeId>,
    ) {
        self.group_index
            .entry(group)
            .or_default()
            .entry(factor_type)
            .or_default()
            .entry(node_type)
            .or_default()
            .extend(ids.iter().copied());
    }

    /// Group storage for single-node factor families (priors, GPS): one
    /// shared group id, or one id per factor.
    pub(crate) fn store_by_one_group_id(
        &mut self,
        group_ids: &[GroupId],
        ids: &[NodeId],
        factor_type: FactorType,
        node_type: VariableType,
        id_set: &BTreeSet<NodeId>,
    ) {
        if group_ids.first().copied().unwrap_or(-1) == -1 {
            return;
        }
        if group_ids.len() == 1 {
            self.store_groups(group_ids[0], factor_type, node_type, id_set);
        } else {
            for (&group, &id) in group_ids.iter().zip(ids) {
                self.store_groups(group, factor_type, node_type, &BTreeSet::from([id]));
            }
        }
    }

    /// Group storage for two-node factor families: two shared group ids (one
    /// per slot), or interleaved per-node ids.
    pub(crate) fn store_by_two_group_id(
        &mut self,
        group_ids: &[GroupId],
        ids: &[NodeId],
        factor_type: FactorType,
        node_type_first: VariableType,
        node_type_second: VariableType,
    ) {
        if group_ids.first().copied().unwrap_or(-1) == -1 {
            return;
        }
        if group_ids.len() == 2 {
            let mut first = BTreeSet::new();
            let mut second = BTreeSet::new();
            for (i, &id) in ids.iter().enumerate() {
                if i % 2 == 0 {
                    first.insert(id);
                } else {
                    second.insert(id);
                }
            }
            self.store_groups(group_ids[0], factor_type, node_type_first, &first);
            self.store_groups(group_ids[1], factor_type, node_type_second, &second);
        } else {
            for (i, &group) in group_ids.iter().enumerate() {
                let set = BTreeSet::from([ids[i]]);
                let node_type = if i % 2 == 0 {
                    node_type_first
                } else {
                    node_type_second
                };
                self.store_groups(group, factor_type, node_type, &set);
            }
        }
    }

    /// Type and group indexing for the Gaussian bulk-add path. Single-type
    /// families index every id under the one node type; mixed pose-point
    /// families split even/odd slots.
    pub(crate) fn index_gaussian_factor_nodes(
        &mut self,
        factor_type: FactorType,
        template: &dyn Factor,
        ids: &[NodeId],
        group_ids: &[GroupId],
    ) {
        let slot_ids = template.variable_ids();
        match slot_ids.len() {
            1 => {
                let node_type = template.variable_type(slot_ids[0]);
                let id_set: BTreeSet<NodeId> = ids.iter().copied().collect();
                self.store_node_ids(node_type, &id_set);
                self.store_factor_types(factor_type, node_type, &id_set);
                self.store_by_one_group_id(group_ids, ids, factor_type, node_type, &id_set);
            }
            _ => {
                let type_first = template.variable_type(slot_ids[0]);
                let type_second = template.variable_type(slot_ids[1]);
                let mut first = BTreeSet::new();
                let mut second = BTreeSet::new();
                for (i, &id) in ids.iter().enumerate() {
                    if i % 2 == 0 {
                        first.insert(id);
                    } else {
                        second.insert(id);
                    }
                }
                self.store_node_ids(type_first, &first);
                self.store_factor_types(factor_type, type_first, &first);
                if type_second == type_first {
                    self.store_node_ids(type_first, &second);
                    self.store_factor_types(factor_type, type_first, &second);
                } else {
                    self.store_node_ids(type_second, &second);
                    self.store_factor_types(factor_type, type_second, &second);
                }
                self.store_by_two_group_id(group_ids, ids, factor_type, type_first, type_second);
            }
        }
    }

    /// Indexing for the plain camera projection path (`[pose, point]`).
    pub(crate) fn index_pose_point_nodes(
        &mut self,
        factor_type: FactorType,
        ids: &[NodeId],
        group_ids: &[GroupId],
    ) {
        let mut poses = BTreeSet::new();
        let mut points = BTreeSet::new();
        for (i, &id) in ids.iter().enumerate() {
            if i % 2 == 0 {
                poses.insert(id);
            } else {
                points.insert(id);
            }
        }
        self.store_node_ids(VariableType::PoseSe3, &poses);
        self.store_node_ids(VariableType::PointXyz, &points);
        self.store_factor_types(factor_type, VariableType::PoseSe3, &poses);
        self.store_factor_types(factor_type, VariableType::PointXyz, &points);
        self.store_by_two_group_id(
            group_ids,
            ids,
            factor_type,
            VariableType::PoseSe3,
            VariableType::PointXyz,
        );
    }

    /// Indexing for the distorted projection variants. Only the pose, point
    /// and transform slots are indexed; intrinsic scalar nodes stay out of
    /// the type and group indices.
    pub(crate) fn index_distorted_camera_nodes(
        &mut self,
        variant: DistortedVariant,
        ids: &[NodeId],
        group_ids: &[GroupId],
    ) {
        let n = variant.num_nodes();
        let has_transform = n > 2;
        let mut poses = BTreeSet::new();
        let mut points = BTreeSet::new();
        let mut transforms = BTreeSet::new();
        for chunk in ids.chunks_exact(n) {
            poses.insert(chunk[0]);
            if has_transform {
                points.insert(chunk[n - 2]);
                transforms.insert(chunk[n - 1]);
            } else {
                points.insert(chunk[n - 1]);
            }
        }
        let factor_type = FactorType::CameraSe3Point3;
        self.store_node_ids(VariableType::PoseSe3, &poses);
        self.store_factor_types(factor_type, VariableType::PoseSe3, &poses);
        self.store_node_ids(VariableType::PointXyz, &points);
        self.store_factor_types(factor_type, VariableType::PointXyz, &points);
        if has_transform {
            self.store_node_ids(VariableType::TransformSe3, &transforms);
            self.store_factor_types(factor_type, VariableType::TransformSe3, &transforms);
        }
        if group_ids.len() == 2 && group_ids[0] != -1 {
            self.store_groups(group_ids[0], factor_type, VariableType::PoseSe3, &poses);
            self.store_groups(group_ids[1], factor_type, VariableType::PointXyz, &points);
            if has_transform {
                self.store_groups(
                    group_ids[0],
                    factor_type,
                    VariableType::TransformSe3,
                    &transforms,
                );
            }
        }
    }

    /// Per-factor group storage for the distorted projection variants (two
    /// group ids per factor: pose/transform under the first, point under the
    /// second).
    pub(crate) fn store_distorted_camera_groups(
        &mut self,
        variant: DistortedVariant,
        node_ids: &[NodeId],
        groups: &[GroupId],
    ) {
        if groups.first().copied().unwrap_or(-1) == -1 || groups.len() < 2 {
            return;
        }
        let n = variant.num_nodes();
        let factor_type = FactorType::CameraSe3Point3;
        self.store_groups(
            groups[0],
            factor_type,
            VariableType::PoseSe3,
            &BTreeSet::from([node_ids[0]]),
        );
        if n > 2 {
            self.store_groups(
                groups[0],
                factor_type,
                VariableType::TransformSe3,
                &BTreeSet::from([node_ids[n - 1]]),
            );
            self.store_groups(
                groups[1],
                factor_type,
                VariableType::PointXyz,
                &BTreeSet::from([node_ids[n - 2]]),
            );
        } else {
            self.store_groups(
                groups[1],
                factor_type,
                VariableType::PointXyz,
                &BTreeSet::from([node_ids[n - 1]]),
            );
        }
    }

    /// Type and group indexing for the IMU factor families. All connected
    /// nodes are type-indexed; with two distinct group ids the first keyframe
    /// triple goes under the first group and the second triple under the
    /// second, leaving any gravity/scale/transform nodes ungrouped.
    pub(crate) fn store_imu_nodes(&mut self, ids: &[NodeId], group_ids: &[GroupId]) {
        let factor_type = FactorType::Imu;
        for &id in ids {
            let Some(node_type) = self.variables.var_type(id) else {
                continue;
            };
            let set = BTreeSet::from([id]);
            self.store_node_ids(node_type, &set);
            self.store_factor_types(factor_type, node_type, &set);
        }
        if group_ids.first().copied().unwrap_or(-1) == -1 || group_ids.len() < 2 {
            return;
        }
        if group_ids[0] == group_ids[1] {
            for &id in ids {
                if let Some(node_type) = self.variables.var_type(id) {
                    self.store_groups(group_ids[0], factor_type, node_type, &BTreeSet::from([id]));
                }
            }
        } else {
            for &id in &ids[0..3] {
                if let Some(node_type) = self.variables.var_type(id) {
                    self.store_groups(group_ids[0], factor_type, node_type, &BTreeSet::from([id]));
                }
            }
            for &id in &ids[3..6] {
                if let Some(node_type) = self.variables.var_type(id) {
                    self.store_groups(group_ids[1], factor_type, node_type, &BTreeSet::from([id]));
                }
            }
        }
    }

    /// Scrub one removed node from the type, factor-type and group indices,
    /// pruning any inner maps left empty.
    pub(crate) fn erase_from_indices(&mut self, node: NodeId, node_type: VariableType) {
        if let Some(ids) = self.node_type_index.get_mut(&node_type) {
            ids.remove(&node);
            if ids.is_empty() {
                self.node_type_index.remove(&node_type);
            }
        }

        self.factor_type_index.retain(|_, node_map| {
            if let Some(ids) = node_map.get_mut(&node_type) {
                ids.remove(&node);
                if ids.is_empty() {
                    node_map.remove(&node_type);
                }
            }
            !node_map.is_empty()
        });

        for factor_map in self.group_index.values_mut() {
            for node_map in factor_map.values_mut() {
                if let Some(ids) = node_map.get_mut(&node_type) {
                    ids.remove(&node);
                    if ids.is_empty() {
                        node_map.remove(&node_type);
                    }
                }
            }
        }
    }

    /// Answer `get_node_ids(groups, node_type, factor_type)`: the ids
    /// matching every specified filter, ascending. `None` filters mean "all".
    #[must_use]
    pub fn get_node_ids(
        &self,
        group_ids: Option<&[GroupId]>,
        node_type: Option<VariableType>,
        factor_type: Option<FactorType>,
    ) -> Vec<NodeId> {
        let mut ids: BTreeSet<NodeId> = BTreeSet::new();

        match group_ids {
            Some(groups) => {
                for group in groups {
                    let Some(factor_map) = self.group_index.get(group) else {
                        continue;
                    };
                    let factor_maps: Vec<_> = match factor_type {
                        Some(ft) => factor_map.get(&ft).into_iter().collect(),
                        None => factor_map.values().collect(),
                    };
                    for node_map in factor_maps {
                        match node_type {
                            Some(nt) => {
                                if let Some(set) = node_map.get(&nt) {
                                    ids.extend(set.iter().copied());
                                }
                            }
                            None => {
                                for set in node_map.values() {
                                    ids.extend(set.iter().copied());
                                }
                            }
                        }
                    }
                }
            }
            None => match (factor_type, node_type) {
                (Some(ft), Some(nt)) => {
                    if let Some(set) = self
                        .factor_type_index
                        .get(&ft)
                        .and_then(|node_map| node_map.get(&nt))
                    {
                        ids.extend(set.iter().copied());
                    }
                }
                (Some(ft), None) => {
                    if let Some(node_map) = self.factor_type_index.get(&ft) {
                        for set in node_map.values() {
                            ids.extend(set.iter().copied());
                        }
                    }
                }
                (None, Some(nt)) => {
                    if let Some(set) = self.node_type_index.get(&nt) {
                        ids.extend(set.iter().copied());
                    }
                }
                (None, None) => {
                    ids.extend(self.variables.ids());
                }
            },
        }

        ids.into_iter().collect()
    }
}
