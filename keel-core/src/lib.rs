//! Keel Core
//!
//! Core types shared by the Keel job agent.
//!
//! This crate contains:
//! - Domain types: job descriptions, runner settings, trace entries
//! - Variable expansion used for image/service names and cache keys

pub mod domain;
pub mod variables;

pub use variables::JobVariables;
