//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Per-step admission, continuation, and eviction decisions
//! - Page reservation ahead of every step plan
//! - Priority ordering with FIFO tie-breaks and optional age weighting

pub mod batch;
pub mod plan;

pub use batch::BatchScheduler;
pub use plan::{StepInput, StepPlan};
