#![doc = include_str!("../README.md")]

mod admission;
mod barrier;
mod compositor;
mod epoch;
mod warp;

pub mod config;
pub mod error;
pub mod pipeline;
pub mod units;
pub mod view;

pub mod prelude {
    pub use crate::{
        config::{AlphaLayout, EngineConfig},
        error::EngineError,
        pipeline::{ComposedFrame, FrameSink, Pipeline, PipelineBuilder},
        units::{
            AlphaSource, BlendDone, BlendJob, BlendUnit, JobId, MeshMapper, MeshPoint, UnitError,
            VehicleRenderer, WarpLane, WarpMap, WarpUnit,
        },
        view::ViewPose,
    };
    pub use halo_core::prelude::*;
}
