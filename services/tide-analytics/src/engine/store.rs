//! Progress store: the process-wide registry of in-flight and completed
//! jobs, keyed by execution id.
//!
//! Read-heavy (pollers hit it constantly), so reads take a shared lock and
//! return cloned snapshots. Retention only applies to terminal jobs; a
//! running job is never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

use super::job::Job;

/// Thread-safe job registry with bounded terminal-job retention.
pub struct ProgressStore {
    inner: RwLock<StoreInner>,
    retention: usize,
}

struct StoreInner {
    jobs: HashMap<String, Job>,
    /// Terminal job ids in seal order, oldest first
    terminal_order: VecDeque<String>,
}

impl ProgressStore {
    /// Create a store retaining at most `retention` terminal jobs.
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                jobs: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }

    /// Insert a new job.
    pub fn put(&self, job: Job) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.jobs.insert(job.id.clone(), job);
    }

    /// Snapshot a job by id.
    pub fn get(&self, id: &str) -> Option<Job> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.jobs.get(id).cloned()
    }

    /// Mutate a job in place.
    ///
    /// Returns false when the id is unknown. When the mutation moves the job
    /// into a terminal state the retention policy runs: the oldest terminal
    /// job beyond the bound is dropped, in seal order.
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let Some(job) = inner.jobs.get_mut(id) else {
            return false;
        };

        let was_terminal = job.state.is_terminal();
        mutate(job);
        let now_terminal = job.state.is_terminal();

        if !was_terminal && now_terminal {
            inner.terminal_order.push_back(id.to_string());
            while inner.terminal_order.len() > self.retention {
                if let Some(victim) = inner.terminal_order.pop_front() {
                    inner.jobs.remove(&victim);
                    debug!(execution_id = %victim, "Evicted terminal job past retention bound");
                }
            }
        }

        true
    }

    /// Number of jobs not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .count()
    }

    /// Total stored jobs (monitoring).
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.jobs.len()
    }

    /// Whether the store holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobState;

    fn seal(store: &ProgressStore, id: &str) {
        store.update(id, |job| {
            job.advance(JobState::Running);
            job.advance(JobState::Completed);
        });
    }

    #[test]
    fn test_put_get() {
        let store = ProgressStore::new(4);
        store.put(Job::new("a".into(), "blue_chip".into()));

        let job = store.get("a").unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_update_unknown_id() {
        let store = ProgressStore::new(4);
        assert!(!store.update("ghost", |_| {}));
    }

    #[test]
    fn test_active_count_excludes_terminal() {
        let store = ProgressStore::new(4);
        store.put(Job::new("a".into(), "blue_chip".into()));
        store.put(Job::new("b".into(), "blue_chip".into()));
        assert_eq!(store.active_count(), 2);

        seal(&store, "a");
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_retention_evicts_oldest_terminal() {
        let store = ProgressStore::new(2);
        for id in ["a", "b", "c"] {
            store.put(Job::new(id.into(), "blue_chip".into()));
            seal(&store, id);
        }

        // "a" sealed first and fell past the bound
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_running_jobs_never_evicted() {
        let store = ProgressStore::new(1);
        store.put(Job::new("running".into(), "blue_chip".into()));
        store.update("running", |job| {
            job.advance(JobState::Running);
        });

        for id in ["t1", "t2", "t3"] {
            store.put(Job::new(id.into(), "blue_chip".into()));
            seal(&store, id);
        }

        assert!(store.get("running").is_some());
        // Only the newest terminal job survives
        assert!(store.get("t3").is_some());
        assert!(store.get("t1").is_none());
        assert!(store.get("t2").is_none());
    }
}
