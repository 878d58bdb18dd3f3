use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

/// Single-flight guard for a recurring job (idle -> running -> idle).
///
/// A second start while a run is in flight is skipped and counted, never queued.
#[derive(Debug, Clone)]
pub struct JobGuard {
    inner: Arc<GuardState>,
}

#[derive(Debug)]
struct GuardState {
    name: &'static str,
    running: AtomicBool,
    skipped: AtomicU64,
}

/// Held for the duration of a run; dropping it returns the guard to idle.
#[derive(Debug)]
pub struct JobPermit {
    inner: Arc<GuardState>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

impl JobGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(GuardState {
                name,
                running: AtomicBool::new(false),
                skipped: AtomicU64::new(0),
            }),
        }
    }

    pub fn try_begin(&self) -> Option<JobPermit> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(JobPermit {
                inner: self.inner.clone(),
            });
        }
        let skipped = self.inner.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        info!(job = self.inner.name, skipped, "previous run still in progress; skipping");
        None
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn skipped_count(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_is_skipped_until_permit_drops() {
        let guard = JobGuard::new("ingestion");
        let permit = guard.try_begin().unwrap();
        assert!(guard.is_running());
        assert!(guard.try_begin().is_none());
        assert!(guard.clone().try_begin().is_none());
        assert_eq!(guard.skipped_count(), 2);

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_begin().is_some());
        assert_eq!(guard.skipped_count(), 2);
    }
}
