use std::collections::HashMap;

use fgo_linalg::Float;
use tracing::debug;

use crate::variable::{NodeId, VariableType};

/// Capacity reserved for the state pool up front. Growing the pool would not
/// move existing offsets, but a large reservation avoids reallocation while a
/// graph is under construction.
const STATE_POOL_RESERVE: usize = 1_000_000;

/// Outcome of [`VariableRegistry::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The variable did not exist and was created with the default state.
    Created,
    /// The variable already existed with matching dimension and type.
    Existing,
    /// The variable exists but with a different dimension or type; the
    /// registry was not modified.
    TypeMismatch,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    dim: usize,
    var_type: VariableType,
    fixed: bool,
}

/// Owns every variable state in one contiguous pool.
///
/// Offsets are append-only: a slot is never relocated while its variable
/// exists, so pool offsets handed to the solver stay valid across calls.
/// Removing a variable abandons its slot; the pool is compaction-free.
#[derive(Debug)]
pub struct VariableRegistry {
    pool: Vec<Float>,
    slots: HashMap<NodeId, Slot>,
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut pool = Vec::new();
        pool.reserve(STATE_POOL_RESERVE);
        Self {
            pool,
            slots: HashMap::new(),
        }
    }

    /// Idempotently create the variable `id`. The first caller wins and fixes
    /// its offset, dimension and type; later calls must agree on dimension
    /// and type.
    pub fn ensure(
        &mut self,
        id: NodeId,
        var_type: VariableType,
        default_state: &[Float],
    ) -> EnsureOutcome {
        if let Some(slot) = self.slots.get(&id) {
            if slot.dim != default_state.len() || slot.var_type != var_type {
                return EnsureOutcome::TypeMismatch;
            }
            return EnsureOutcome::Existing;
        }
        let offset = self.pool.len();
        self.pool.extend_from_slice(default_state);
        self.slots.insert(
            id,
            Slot {
                offset,
                dim: default_state.len(),
                var_type,
                fixed: false,
            },
        );
        debug!(id, %var_type, offset, "created variable");
        EnsureOutcome::Created
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn var_type(&self, id: NodeId) -> Option<VariableType> {
        self.slots.get(&id).map(|s| s.var_type)
    }

    #[must_use]
    pub fn dim(&self, id: NodeId) -> Option<usize> {
        self.slots.get(&id).map(|s| s.dim)
    }

    /// Pool offset of the variable's state, stable for the variable's
    /// lifetime.
    #[must_use]
    pub fn offset(&self, id: NodeId) -> Option<usize> {
        self.slots.get(&id).map(|s| s.offset)
    }

    #[must_use]
    pub fn state(&self, id: NodeId) -> Option<&[Float]> {
        self.slots
            .get(&id)
            .map(|s| &self.pool[s.offset..s.offset + s.dim])
    }

    /// Overwrite the variable's state. Fails (returning `false`) on a
    /// dimension mismatch; the registry is untouched in that case.
    pub fn set_state(&mut self, id: NodeId, values: &[Float]) -> bool {
        match self.slots.get(&id) {
            Some(slot) if slot.dim == values.len() => {
                self.pool[slot.offset..slot.offset + slot.dim].copy_from_slice(values);
                true
            }
            _ => false,
        }
    }

    pub fn fix(&mut self, id: NodeId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.fixed = true;
                true
            }
            None => false,
        }
    }

    pub fn free(&mut self, id: NodeId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.fixed = false;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_fixed(&self, id: NodeId) -> Option<bool> {
        self.slots.get(&id).map(|s| s.fixed)
    }

    /// Drop the variable from the lookup maps. Its pool slot is abandoned,
    /// not reclaimed.
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// The whole state pool; parameter blocks are slices of this.
    #[must_use]
    pub fn pool(&self) -> &[Float] {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut [Float] {
        &mut self.pool
    }

    /// Iterate over all live variable ids.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.keys().copied()
    }
}
