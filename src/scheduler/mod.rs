//! Run-level coordination: the pipeline scheduler and its event surface.

pub mod events;
pub mod runner;

pub use events::RunEvent;
pub use runner::{
    PipelineScheduler, RunCommand, SchedulerConfig, SchedulerHandle, SkipPolicy,
};
