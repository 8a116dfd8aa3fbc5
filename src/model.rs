//! Core data model.
//!
//! A task is one schedulable unit of generation work. It has identity
//! (monotonic id), classification (flow name, group scope, priority),
//! ownership, lifecycle fields written by workers, and an opaque payload.

pub mod task;
pub mod worker;

pub use task::*;
pub use worker::*;
