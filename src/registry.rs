//! Ordered registry of port records.
//!
//! First-seen order is preserved across refreshes so repeated snapshots list
//! stable entries stably. Lookups take a read lock; structural changes
//! (append, sweep) take the write lock briefly and never replace a surviving
//! record, keeping `Arc` identity stable for held handles.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::record::{PortMeta, PortRecord};

#[derive(Debug, Default)]
pub(crate) struct PortRegistry {
    records: RwLock<Vec<Arc<PortRecord>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record by exact path.
    pub fn find(&self, path: &str) -> Option<Arc<PortRecord>> {
        self.records
            .read()
            .iter()
            .find(|r| r.path == path)
            .cloned()
    }

    /// Look up a record by exact path, appending a fresh one when absent.
    /// The whole operation runs under the write lock, so two callers racing
    /// on the same path resolve to one record.
    pub fn find_or_insert_with(
        &self,
        path: &str,
        meta: impl FnOnce() -> PortMeta,
    ) -> Arc<PortRecord> {
        let mut records = self.records.write();
        if let Some(existing) = records.iter().find(|r| r.path == path) {
            return Arc::clone(existing);
        }
        let record = Arc::new(PortRecord::new(path, meta()));
        records.push(Arc::clone(&record));
        record
    }

    /// All records, in first-seen order.
    pub fn snapshot(&self) -> Vec<Arc<PortRecord>> {
        self.records.read().clone()
    }

    /// Drop every record that is neither marked by the current discovery pass
    /// nor holding an open session.
    pub fn sweep(&self) {
        self.records
            .write()
            .retain(|r| r.is_marked() || r.is_open());
    }
}
