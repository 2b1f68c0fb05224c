//! Durable and recurring background jobs sharing one queue transport.

pub mod builtin;
pub mod durable;
pub mod queue;
pub mod schedule;
pub mod scheduler;

pub use builtin::{DeleteFlowJob, FlowDeletionService, PruneArtifactCacheJob};
pub use durable::DurableProgress;
pub use queue::{
    FailOutcome, InMemoryJobQueue, JobDelivery, JobEvent, JobQueue, JobState, QueuedJob,
    SystemJob,
};
pub use schedule::{JobSchedule, ScheduleError};
pub use scheduler::{
    CompletionDispatcher, JobCompletionHandler, JobContext, JobFamily, JobHandler,
    JobHandlerRegistry, SystemJobScheduler, TickReport,
};
