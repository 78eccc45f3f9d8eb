#![doc = include_str!("../README.md")]

pub mod animator;
pub mod sink;
pub mod software;

pub use halo_core as core;
pub use halo_engine as engine;

pub mod prelude {
    pub use crate::animator::ViewAnimator;
    pub use crate::sink::QueueSink;
    pub use halo_engine::prelude::*;
}
