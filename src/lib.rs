//! tokenflow: a continuous-batching inference serving core in Rust.
//!
//! This crate implements the scheduling half of an autoregressive serving
//! stack:
//! - Paged KV cache management (fixed-size pages, per-sequence page tables)
//! - Continuous batching with priority admission, eviction, and chunked
//!   prefill
//! - Speculative decoding verification by rejection sampling
//! - Per-request token streaming with bounded-latency cancellation
//!
//! The model forward pass and the draft model are external collaborators
//! behind the [`StepRunner`] and [`DraftModel`] traits; the core never
//! touches weights or kernels and runs unchanged against deterministic
//! fakes.

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod runner;
pub mod scheduler;
pub mod speculative;
pub mod stream;

pub use crate::core::{
    FinishReason, PageAllocator, PageId, PageTable, SequenceId, SequenceState, SequenceStatus,
};
pub use config::{EngineConfig, SamplingConfig, SchedulerConfig};
pub use engine::{Engine, EngineHandle, Sampler, SubmitRequest};
pub use error::{Error, Result};
pub use runner::{DraftModel, StepOutput, StepRunner};
pub use scheduler::{BatchScheduler, StepInput, StepPlan};
pub use speculative::{DraftProposal, SpeculativeConfig, SpeculativeVerifier, VerificationResult};
pub use stream::{OutputStreamer, StreamEvent};
