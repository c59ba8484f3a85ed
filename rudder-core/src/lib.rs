//! Rudder Core
//!
//! Core types and abstractions for the Rudder build/promote orchestrator.
//!
//! This crate contains:
//! - Domain types: build rules, job identifiers, trigger events
//! - Manifest patching for digest promotion
//! - Unified-diff inspection used by diff-triggered jobs
//!
//! Nothing in here performs I/O; the clients and binaries build on top of it.

pub mod diff;
pub mod domain;
pub mod manifest;
