//! Core domain types
//!
//! These types are shared between the orchestrator (which creates jobs)
//! and the sidecar (which runs inside them).

pub mod event;
pub mod job;
pub mod rule;
