//! Queue-backed frame delivery.

use std::sync::Arc;

use tracing::warn;

use halo_core::prelude::{BoundedRx, BoundedTx, SendOutcome, bounded};
use halo_engine::prelude::{ComposedFrame, EngineError, FrameSink};

/// [`FrameSink`] that hands composed frames to a consumer over a bounded
/// queue.
///
/// When the consumer falls behind, new frames are dropped rather than
/// backing the compositor up; the output plane returns to circulation
/// immediately.
///
/// # Example
/// ```rust,ignore
/// let (sink, frames) = QueueSink::new(8);
/// let pipeline = builder.with_sink(sink).start()?;
/// while let RecvOutcome::Data(frame) = frames.recv() {
///     display.present(&frame.output);
/// }
/// ```
pub struct QueueSink {
    tx: BoundedTx<ComposedFrame>,
}

impl QueueSink {
    pub fn new(capacity: usize) -> (Arc<Self>, BoundedRx<ComposedFrame>) {
        let (tx, rx) = bounded(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

impl FrameSink for QueueSink {
    fn on_frame_ready(&self, frame: ComposedFrame) {
        match self.tx.send(frame) {
            SendOutcome::Ok => {}
            SendOutcome::Full => warn!("frame queue full; dropping frame"),
            SendOutcome::Closed => {}
        }
    }

    fn on_compose_error(&self, sequence: u64, error: &EngineError) {
        warn!(sequence, code = error.code(), error = %error, "composition error");
    }
}
