//! Service change tracker
//!
//! Collapses a sequence of (previous, current) service deltas so the
//! reconciler sees, per service, the oldest pre-state and the newest
//! post-state of the batch. Correct unmerging depends on the oldest
//! previous: the rules to retract are the ones installed for the state
//! before the batch began, not for an intermediate update.

use std::collections::HashMap;
use std::mem;

use crate::service::{NamespacedName, ServiceSpec};

/// Collapsed delta for one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceChange {
    /// State before the batch; `None` for a service created in the batch
    pub previous: Option<ServiceSpec>,
    /// State after the batch; `None` for a deleted service
    pub current: Option<ServiceSpec>,
}

/// Accumulates service deltas between reconciliation passes.
#[derive(Debug, Default)]
pub struct ServiceChangeTracker {
    items: HashMap<NamespacedName, ServiceChange>,
}

impl ServiceChangeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the batch.
    ///
    /// Returns whether the tracker still holds a net change for this
    /// service: an update sequence that circles back to the pre-batch
    /// state deletes the record and reports `false`.
    pub fn update(
        &mut self,
        previous: Option<&ServiceSpec>,
        current: Option<&ServiceSpec>,
    ) -> bool {
        let Some(key) = current
            .map(ServiceSpec::namespaced_name)
            .or_else(|| previous.map(ServiceSpec::namespaced_name))
        else {
            return false;
        };

        let entry = self.items.entry(key.clone()).or_insert_with(|| ServiceChange {
            // Only the first event of the batch pins `previous`.
            previous: previous.cloned(),
            current: None,
        });
        entry.current = current.cloned();

        if entry.previous == entry.current {
            self.items.remove(&key);
            return false;
        }
        true
    }

    /// Take the whole batch, leaving the tracker empty.
    #[must_use]
    pub fn drain(&mut self) -> HashMap<NamespacedName, ServiceChange> {
        mem::take(&mut self.items)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
