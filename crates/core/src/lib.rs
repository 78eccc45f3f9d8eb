#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metrics;
pub mod queue;
pub mod sequence;

pub mod prelude {
    pub use crate::{
        buffer::{
            CameraPair, ChunkAllocator, HeapChunks, PlaneHandle, PlaneId, PlanePool, PoolError,
        },
        format::{FourCc, PlaneFormat, Resolution},
        metrics::EngineMetrics,
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, bounded},
        sequence::SequenceCounters,
    };
}
