use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic input/output sequence counters for composition cycles.
///
/// `input` is the sequence number the next admitted camera cycle will carry;
/// `output` is the number of completed composition jobs. The epoch controller
/// compares both against the pending epoch sequence.
///
/// # Example
/// ```rust
/// use halo_core::prelude::SequenceCounters;
///
/// let seq = SequenceCounters::default();
/// assert_eq!(seq.next_input(), 0);
/// assert_eq!(seq.input(), 1);
/// assert_eq!(seq.advance_output(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounters {
    seq_in: AtomicU64,
    seq_out: AtomicU64,
}

impl SequenceCounters {
    /// Claim the next input sequence number.
    pub fn next_input(&self) -> u64 {
        self.seq_in.fetch_add(1, Ordering::SeqCst)
    }

    /// Sequence number the next admitted cycle will carry.
    pub fn input(&self) -> u64 {
        self.seq_in.load(Ordering::SeqCst)
    }

    /// Record one completed composition job; returns the new output count.
    pub fn advance_output(&self) -> u64 {
        self.seq_out.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of completed composition jobs.
    pub fn output(&self) -> u64 {
        self.seq_out.load(Ordering::SeqCst)
    }
}
