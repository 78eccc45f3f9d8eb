use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for pipeline observability.
///
/// # Example
/// ```rust
/// use halo_core::metrics::EngineMetrics;
///
/// let metrics = EngineMetrics::default();
/// metrics.cycle_admitted();
/// assert_eq!(metrics.cycles_admitted(), 1);
/// ```
#[derive(Debug, Default)]
pub struct EngineMetrics {
    cycles_admitted: AtomicU64,
    frames_composed: AtomicU64,
    compose_errors: AtomicU64,
    epoch_commits: AtomicU64,
    flush_resubmits: AtomicU64,
}

impl EngineMetrics {
    /// Record an admitted camera cycle.
    pub fn cycle_admitted(&self) {
        self.cycles_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully composed frame.
    pub fn frame_composed(&self) {
        self.frames_composed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a composition job that completed with an error.
    pub fn compose_error(&self) {
        self.compose_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed epoch.
    pub fn epoch_commit(&self) {
        self.epoch_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record flush resubmissions performed at an epoch commit.
    pub fn flushes(&self, count: u64) {
        self.flush_resubmits.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot of admitted cycles.
    pub fn cycles_admitted(&self) -> u64 {
        self.cycles_admitted.load(Ordering::Relaxed)
    }

    /// Snapshot of composed frames.
    pub fn frames_composed(&self) -> u64 {
        self.frames_composed.load(Ordering::Relaxed)
    }

    /// Snapshot of failed compositions.
    pub fn compose_errors(&self) -> u64 {
        self.compose_errors.load(Ordering::Relaxed)
    }

    /// Snapshot of committed epochs.
    pub fn epoch_commits(&self) -> u64 {
        self.epoch_commits.load(Ordering::Relaxed)
    }

    /// Snapshot of flush resubmissions.
    pub fn flush_resubmits(&self) -> u64 {
        self.flush_resubmits.load(Ordering::Relaxed)
    }
}

impl Clone for EngineMetrics {
    fn clone(&self) -> Self {
        let cloned = EngineMetrics::default();
        cloned
            .cycles_admitted
            .store(self.cycles_admitted(), Ordering::Relaxed);
        cloned
            .frames_composed
            .store(self.frames_composed(), Ordering::Relaxed);
        cloned
            .compose_errors
            .store(self.compose_errors(), Ordering::Relaxed);
        cloned
            .epoch_commits
            .store(self.epoch_commits(), Ordering::Relaxed);
        cloned
            .flush_resubmits
            .store(self.flush_resubmits(), Ordering::Relaxed);
        cloned
    }
}
