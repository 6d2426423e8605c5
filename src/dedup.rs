use crate::types::{Fingerprint, JobHandle};
use std::collections::HashMap;
use std::sync::Mutex;

/// Index of *pending* sync jobs keyed by fingerprint.
///
/// The dispatcher removes a fingerprint at the moment its job transitions
/// from pending to active, so one active and one pending job may coexist for
/// the same fingerprint, but never two pending ones.
#[derive(Debug, Default)]
pub struct PendingIndex {
    inner: Mutex<HashMap<Fingerprint, JobHandle>>,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` unless the fingerprint is already indexed.
    /// Returns whether the insert happened.
    pub fn try_record(&self, fp: Fingerprint, handle: JobHandle) -> bool {
        let mut map = self.lock();
        if map.contains_key(&fp) {
            return false;
        }
        map.insert(fp, handle);
        true
    }

    pub fn lookup(&self, fp: &Fingerprint) -> Option<JobHandle> {
        self.lock().get(fp).cloned()
    }

    pub fn remove(&self, fp: &Fingerprint) -> Option<JobHandle> {
        self.lock().remove(fp)
    }

    /// Current pending depth, reported in the iteration audit line.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pending handle. Diagnostic use only.
    pub fn pending_jobs(&self) -> Vec<JobHandle> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, JobHandle>> {
        // A poisoned lock only means another thread panicked mid-mutation of
        // a plain map; the map itself is still coherent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
