//! Pipeline execution and scheduling.
//!
//! - `registry`: step definitions and pipeline templates
//! - `work_queue`: FIFO of ready steps (SQLite-backed or in-memory)
//! - `scheduler`: dependency resolution, output merging, completion detection
//! - `orchestrator`: trigger handling, retry and cancel
//! - `worker_pool`: workers that run step handlers
//! - `sweeper`: lease reclaim and staleness watchdog
//! - `progress`: outbound pipeline events

mod locks;
mod orchestrator;
mod progress;
mod registry;
mod scheduler;
pub mod steps;
mod sweeper;
mod work_queue;
mod worker_pool;

pub use locks::ExecutionLocks;
pub use orchestrator::{ExecutionDetail, Orchestrator, StartOutcome};
pub use progress::{DEFAULT_EVENT_CAPACITY, PipelineEvent, ProgressNotifier};
pub use registry::{
    FnStep, PipelineTemplate, ResolvedStep, Spawner, StepContext, StepDefinition, StepDescriptor,
    StepHandler, StepOutput, StepRegistry, step_fn,
};
pub use scheduler::{EvaluateOutcome, Scheduler};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
pub use work_queue::{
    DEFAULT_POLL_INTERVAL, MemoryWorkQueue, SqliteWorkQueue, WorkItem, WorkQueue,
};
pub use worker_pool::{ItemOutcome, Worker, WorkerPool, WorkerPoolConfig};
