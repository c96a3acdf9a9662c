//! Core domain types
//!
//! This module contains the structures exchanged between the control plane
//! (which supplies jobs and runner settings) and the agent (which executes
//! them). They are immutable inputs to a single run.

pub mod job;
pub mod log;
pub mod runner;
