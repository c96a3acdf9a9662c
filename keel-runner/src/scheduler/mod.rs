//! Scheduler layer for the runner
//!
//! Entry point for running jobs: gates how many run at once, picks the
//! executor and reconciles resources left behind by earlier processes.

pub mod agent;

pub use agent::Agent;
