//! Container executor
//!
//! Everything needed to run one job on a container backend: the temporary
//! resource registry, helper image resolution, persistent cache containers,
//! the orchestrator for job and service containers, and the executor tying
//! them together.

pub mod cache;
pub mod executor;
pub mod helper;
pub mod orchestrator;
pub mod registry;

pub use executor::DockerExecutor;
pub use helper::HelperImageResolver;
