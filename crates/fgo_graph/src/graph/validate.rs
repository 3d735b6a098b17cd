//! Per-id validation-result sequences.
//!
//! The engine reports recoverable failures as integer sequences rather than
//! errors because the flat ABI is array-oriented and callers want to know
//! which ids were the problem. The trailing element is the overall flag:
//! `1` all good, `-1` missing id, `-2` type mismatch, `-3` dimension or
//! covariance-availability failure.

use fgo_linalg::Float;

use crate::{
    factor::{Factor, FactorId},
    variable::{NodeId, VariableType},
};

use super::FactorGraph;

impl FactorGraph {
    /// `1` per existing id, `-1` per missing one; trailing `-1` when any id
    /// was absent.
    #[must_use]
    pub fn validate_existence(&self, ids: &[NodeId]) -> Vec<i32> {
        let mut validness = Vec::with_capacity(ids.len() + 1);
        let mut flag = 1;
        for &id in ids {
            if self.variables.contains(id) {
                validness.push(1);
            } else {
                validness.push(-1);
                flag = -1;
            }
        }
        validness.push(flag);
        validness
    }

    /// As [`Self::validate_existence`], over factor ids.
    #[must_use]
    pub fn validate_factor_existence(&self, ids: &[FactorId]) -> Vec<i32> {
        let mut validness = Vec::with_capacity(ids.len() + 1);
        let mut flag = 1;
        for &id in ids {
            if self.factors.contains_key(&id) {
                validness.push(1);
            } else {
                validness.push(-1);
                flag = -1;
            }
        }
        validness.push(flag);
        validness
    }

    /// `1` per id whose type matches `expected`, `-2` otherwise; trailing
    /// `-2` on any mismatch.
    #[must_use]
    pub fn validate_type(&self, ids: &[NodeId], expected: VariableType) -> Vec<i32> {
        let mut validness = Vec::with_capacity(ids.len() + 1);
        let mut flag = 1;
        for &id in ids {
            if self.variables.var_type(id) == Some(expected) {
                validness.push(1);
            } else {
                validness.push(-2);
                flag = -2;
            }
        }
        validness.push(flag);
        validness
    }

    /// `1` per id with a stored covariance, `-1` otherwise; trailing `-3`
    /// when any id has none (not requested at the last optimize, or the
    /// optimization was unusable).
    #[must_use]
    pub fn validate_covariance_existence(&self, ids: &[NodeId]) -> Vec<i32> {
        let mut validness = Vec::with_capacity(ids.len() + 1);
        let mut flag = 1;
        for &id in ids {
            if self.covariances.contains_key(&id) {
                validness.push(1);
            } else {
                validness.push(-1);
                flag = -3;
            }
        }
        validness.push(flag);
        validness
    }

    /// Validate a bulk factor add against the registry: for every id already
    /// in the graph, its registered type must equal the factor's declared
    /// type for that slot. Returns the offending ids followed by `-1`, or
    /// `[1]` when all check out.
    #[must_use]
    pub fn validate_factor(
        &self,
        template: &dyn Factor,
        ids: &[NodeId],
        num_slots: usize,
    ) -> Vec<i32> {
        let slot_ids = template.variable_ids();
        let mut validness = Vec::new();
        let mut flag = 1;
        for (i, &id) in ids.iter().enumerate() {
            if let Some(registered) = self.variables.var_type(id) {
                let declared = template.variable_type(slot_ids[i % num_slots]);
                if declared != registered {
                    validness.push(id);
                    flag = -1;
                }
            }
        }
        validness.push(flag);
        validness
    }

    /// States of the given nodes, concatenated. All ids must exist and share
    /// one type; otherwise the validation sequence (with a trailing NaN
    /// marker) is returned instead.
    #[must_use]
    pub fn get_node_states(&self, ids: &[NodeId]) -> Vec<Float> {
        if ids.is_empty() {
            return Vec::new();
        }
        let validness = self.validate_existence(ids);
        if validness.last() == Some(&-1) {
            let mut res: Vec<Float> = validness.iter().map(|&v| Float::from(v)).collect();
            res.push(Float::NAN);
            return res;
        }
        let first_type = self
            .variables
            .var_type(ids[0])
            .expect("existence validated above");
        let validness = self.validate_type(ids, first_type);
        if validness.last() == Some(&-2) {
            let mut res: Vec<Float> = validness.iter().map(|&v| Float::from(v)).collect();
            res.push(Float::NAN);
            return res;
        }

        let mut states = Vec::with_capacity(ids.len() * first_type.dim());
        for &id in ids {
            states.extend_from_slice(
                self.variables.state(id).expect("existence validated above"),
            );
        }
        states
    }

    /// Set the given nodes' states from a concatenated value buffer holding
    /// `per_state_len` values per node. Returns the per-id validation
    /// sequence without the trailing flag on success, the failing sequence
    /// on missing ids or mixed types, and `[-3]` on a length mismatch.
    pub fn set_node_states(
        &mut self,
        ids: &[NodeId],
        values: &[Float],
        per_state_len: usize,
    ) -> Vec<i32> {
        if ids.is_empty() {
            return Vec::new();
        }
        let validness = self.validate_existence(ids);
        if validness.last() == Some(&-1) {
            return validness;
        }
        let first_type = self
            .variables
            .var_type(ids[0])
            .expect("existence validated above");
        let mut validness = self.validate_type(ids, first_type);
        if validness.last() == Some(&-2) {
            return validness;
        }
        if per_state_len != first_type.dim() {
            return vec![-3];
        }

        validness.pop();
        for (k, &id) in ids.iter().enumerate() {
            self.variables
                .set_state(id, &values[k * per_state_len..(k + 1) * per_state_len]);
        }
        validness
    }

    /// Fix the given nodes so optimization holds them constant. Returns the
    /// existence validation sequence; nothing is fixed when any id is
    /// missing.
    pub fn fix_nodes(&mut self, ids: &[NodeId]) -> Vec<i32> {
        let validness = self.validate_existence(ids);
        if validness.last() != Some(&-1) {
            for &id in ids {
                self.variables.fix(id);
            }
        }
        validness
    }

    /// Free previously fixed nodes. Returns the existence validation
    /// sequence; nothing is freed when any id is missing.
    pub fn free_nodes(&mut self, ids: &[NodeId]) -> Vec<i32> {
        let validness = self.validate_existence(ids);
        if validness.last() != Some(&-1) {
            for &id in ids {
                self.variables.free(id);
            }
        }
        validness
    }

    /// `1`/`0` per id for fixed/free, or the existence validation sequence
    /// when any id is missing.
    #[must_use]
    pub fn are_nodes_fixed(&self, ids: &[NodeId]) -> Vec<i32> {
        let validness = self.validate_existence(ids);
        if validness.last() == Some(&-1) {
            return validness;
        }
        ids.iter()
            .map(|&id| i32::from(self.variables.is_fixed(id) == Some(true)))
            .collect()
    }

    /// Covariance blocks of the given nodes, concatenated row-major. All ids
    /// must exist, share one type, and have stored covariances; the first
    /// failing validation stage is returned (with a trailing NaN marker)
    /// otherwise.
    #[must_use]
    pub fn get_node_covariances(&self, ids: &[NodeId]) -> Vec<Float> {
        if ids.is_empty() {
            return Vec::new();
        }
        let to_floats = |validness: Vec<i32>| {
            let mut res: Vec<Float> = validness.iter().map(|&v| Float::from(v)).collect();
            res.push(Float::NAN);
            res
        };
        let validness = self.validate_existence(ids);
        if validness.last() == Some(&-1) {
            return to_floats(validness);
        }
        let first_type = self
            .variables
            .var_type(ids[0])
            .expect("existence validated above");
        let validness = self.validate_type(ids, first_type);
        if validness.last() == Some(&-2) {
            return to_floats(validness);
        }
        let validness = self.validate_covariance_existence(ids);
        if validness.last() == Some(&-3) {
            return to_floats(validness);
        }

        let dim = first_type.dim();
        let mut out = Vec::with_capacity(ids.len() * dim * dim);
        for &id in ids {
            let block = &self.covariances[&id];
            for row in 0..dim {
                for col in 0..dim {
                    out.push(block[(row, col)]);
                }
            }
        }
        out
    }
}
