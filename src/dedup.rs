//! Per-query set of event ids that have already been emitted.

use dashmap::DashSet;

/// Concurrent set of event ids scoped to one in-flight query.
///
/// Both producers call [`SeenIds::first_sighting`]; exactly one of them wins
/// for any given id. The set is dropped with the query.
#[derive(Debug, Default)]
pub struct SeenIds {
    ids: DashSet<String>,
}

impl SeenIds {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: DashSet::with_capacity(capacity),
        }
    }

    /// Record `id` and report whether this call inserted it.
    pub fn first_sighting(&self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }
}
