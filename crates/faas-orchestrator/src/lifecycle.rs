//! Registry of in-flight and recently finished invocations.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faas_common::{InvocationId, InvocationRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Invocation records keyed by id. Each record is guarded by its map shard,
/// so a transition never blocks readers of other records.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    records: DashMap<InvocationId, InvocationRecord>,
    seq: AtomicU64,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates a RUNNING record stamped with the current time.
    pub fn create(&self, project: &str, function: &str) -> InvocationId {
        let now = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = InvocationId::compose(project, function, now, seq);
        self.records.insert(
            id.clone(),
            InvocationRecord::running(id.clone(), project, function, now),
        );
        debug!(invocation_id = %id, "Invocation record created");
        id
    }

    /// Returns false if the record is gone or already terminal.
    pub fn mark_completed(&self, id: &InvocationId) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => record.complete(Utc::now()),
            None => {
                warn!(invocation_id = %id, "Completion for unknown invocation record");
                false
            }
        }
    }

    pub fn mark_failed(&self, id: &InvocationId, error: impl Into<String>) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => record.fail(error, Utc::now()),
            None => {
                warn!(invocation_id = %id, "Failure for unknown invocation record");
                false
            }
        }
    }

    pub fn get(&self, id: &InvocationId) -> Option<InvocationRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Point-in-time snapshot of every record.
    pub fn list_all(&self) -> HashMap<InvocationId, InvocationRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes every record that started more than `retention` before `now`,
    /// whatever its state. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|id, record| {
            // A negative age (clock stepped back) converts to Err and is kept.
            let keep = match now.signed_duration_since(record.start_time).to_std() {
                Ok(age) => age <= retention,
                Err(_) => true,
            };
            if !keep {
                debug!(invocation_id = %id, state = ?record.state, "Evicting expired invocation record");
            }
            keep
        });
        before.saturating_sub(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::InvocationState;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_create_and_complete() {
        let tracker = LifecycleTracker::new();
        let id = tracker.create("proj", "hello");
        let record = tracker.get(&id).unwrap();
        assert_eq!(record.state, InvocationState::Running);
        assert_eq!(record.project, "proj");
        assert_eq!(record.function, "hello");
        assert!(record.end_time.is_none());

        assert!(tracker.mark_completed(&id));
        let record = tracker.get(&id).unwrap();
        assert_eq!(record.state, InvocationState::Completed);
        assert!(record.end_time.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn test_terminal_records_never_return_to_running() {
        let tracker = LifecycleTracker::new();
        let id = tracker.create("proj", "hello");
        assert!(tracker.mark_failed(&id, "boom"));
        assert!(!tracker.mark_completed(&id));

        let record = tracker.get(&id).unwrap();
        assert_eq!(record.state, InvocationState::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let tracker = LifecycleTracker::new();
        let id = InvocationId::from("nope:nope:0:0");
        assert!(!tracker.mark_completed(&id));
        assert!(!tracker.mark_failed(&id, "x"));
        assert!(tracker.get(&id).is_none());
    }

    #[test]
    fn test_concurrent_creates_never_collide() {
        let tracker = Arc::new(LifecycleTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| tracker.create("proj", "hot"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id), "duplicate invocation id");
            }
        }
        assert_eq!(ids.len(), 4000);
        assert_eq!(tracker.len(), 4000);
    }

    #[test]
    fn test_sweep_evicts_old_records_regardless_of_state() {
        let tracker = LifecycleTracker::new();
        let running = tracker.create("proj", "stuck");
        let done = tracker.create("proj", "done");
        tracker.mark_completed(&done);

        let retention = Duration::from_secs(3600);
        assert_eq!(tracker.sweep_expired(Utc::now(), retention), 0);
        assert_eq!(tracker.len(), 2);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(tracker.sweep_expired(later, retention), 2);
        assert!(tracker.get(&running).is_none());
        assert!(tracker.get(&done).is_none());
    }
}
