//! Thin submission front for the blend unit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::barrier::ComposeBatch;
use crate::error::EngineError;
use crate::units::{BlendDone, BlendJob, BlendUnit, JobId};

pub(crate) struct CompositorStage {
    unit: Arc<dyn BlendUnit>,
    next_job: AtomicU64,
}

impl CompositorStage {
    pub(crate) fn new(unit: Arc<dyn BlendUnit>) -> Self {
        Self {
            unit,
            next_job: AtomicU64::new(0),
        }
    }

    /// Submit a popped batch as one blend job. The unit fires `done` when
    /// the output plane is written; it may do so before this returns.
    pub(crate) fn submit(
        &self,
        sequence: u64,
        batch: &ComposeBatch,
        done: BlendDone,
    ) -> Result<JobId, EngineError> {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let job = BlendJob {
            id,
            sequence,
            sources: batch.sources(),
            output: batch.output.clone(),
        };
        trace!(job = id, sequence, "blend job submitted");
        self.unit.submit(job, done)?;
        Ok(id)
    }
}
