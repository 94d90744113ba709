//! Error types for tokenflow.

use thiserror::Error;

/// Result type alias for tokenflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tokenflow.
///
/// Most variants are recoverable from the scheduler loop's point of view:
/// [`Error::OutOfPages`] triggers eviction, [`Error::MalformedDraftProposal`]
/// degrades one sequence to single-token decoding for a step, and
/// [`Error::StepRunnerFailure`] terminates only the sequences in the failing
/// step's plan.
#[derive(Error, Debug)]
pub enum Error {
    /// Page allocation failed - no free pages available.
    #[error("out of KV cache pages")]
    OutOfPages,

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A token append would exceed the sequence's generation budget.
    #[error("sequence {id} exceeded its token budget of {max_tokens}")]
    SequenceBudgetExceeded { id: u64, max_tokens: usize },

    /// Draft proposal failed validation (wrong length, bad probabilities).
    #[error("malformed draft proposal for sequence {id}: {reason}")]
    MalformedDraftProposal { id: u64, reason: String },

    /// The model execution layer failed for a whole step.
    #[error("step runner failed: {0}")]
    StepRunnerFailure(String),

    /// Logical page index past the end of a sequence's page table.
    #[error("page index out of bounds: logical page {logical_idx} of {num_pages}")]
    PageIndexOutOfBounds {
        logical_idx: usize,
        num_pages: usize,
    },

    /// The engine thread is gone; no more requests can be submitted.
    #[error("engine is shut down")]
    EngineShutDown,

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
