//! Function intern table
//!
//! Local callables that cross the wire get a stable id the first time they
//! are encoded. The table keeps every interned function alive, so an identity
//! key can never be recycled for a different callable.

use std::collections::HashMap;

use crate::value::Function;

/// Id assigned to an interned local function
pub type FunctionId = u64;

/// Identity-keyed table of local callables
#[derive(Default)]
pub struct FunctionTable {
    by_identity: HashMap<usize, FunctionId>,
    by_id: HashMap<FunctionId, Function>,
    next_id: FunctionId,
}

impl FunctionTable {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a callable, returning its existing id if it was seen before
    pub fn intern(&mut self, function: &Function) -> FunctionId {
        let key = function.identity();
        if let Some(id) = self.by_identity.get(&key) {
            return *id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.by_identity.insert(key, id);
        self.by_id.insert(id, function.clone());
        id
    }

    /// Look up an interned callable
    pub fn resolve(&self, id: FunctionId) -> Option<Function> {
        self.by_id.get(&id).cloned()
    }

    /// Number of interned callables
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
