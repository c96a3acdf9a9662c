//! Service layer
//!
//! Backend-independent build logic: the executor contract, the lifecycle
//! controller driving a job through its stages, stage scripts and the job
//! trace.

pub mod lifecycle;
pub mod script;
pub mod stage;
pub mod trace;

pub use lifecycle::BuildLifecycle;
pub use stage::{BuildStage, Executor, ExecutorCommand};
pub use trace::{ConsoleTrace, InMemoryTrace, JobTrace, TraceSink};
