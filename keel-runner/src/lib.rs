//! Keel runner
//!
//! CI job agent running jobs in containers. A job is driven through its
//! build stages by the lifecycle controller on top of the container
//! executor, which talks to podman or docker through the backend trait.

pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod signal;
