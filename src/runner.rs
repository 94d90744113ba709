//! External collaborator boundaries: the model execution layer and the
//! draft model.
//!
//! The serving core never touches model weights or kernels. It talks to the
//! execution layer through [`StepRunner`], a synchronous call per step plan,
//! and to an optional cheap draft model through [`DraftModel`]. Both are
//! trait objects so the whole core runs against deterministic fakes in
//! tests.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::core::sequence::{SequenceId, SequenceState};
use crate::error::Result;
use crate::scheduler::plan::StepPlan;
use crate::speculative::DraftProposal;

/// Next-token distributions produced by one forward step.
///
/// For each scheduled sequence, a `[tokens_fed, vocab_size]` logits tensor:
/// one row per input token, where row `i` is the next-token distribution
/// after consuming that token.
pub type StepOutput = HashMap<SequenceId, Tensor>;

/// The opaque model forward pass.
///
/// The scheduler invokes `run` exactly once per step and never constructs
/// the next plan before it returns. The implementation may be internally
/// parallel (multi-GPU, multi-stream); from the core's perspective it is a
/// single blocking call that consumes one page-table snapshot per scheduled
/// sequence and writes KV entries through it.
///
/// # Errors
///
/// A failure is fatal only for the sequences in the failing plan: the engine
/// moves them to `Errored` and keeps serving everything else.
pub trait StepRunner {
    /// Execute one forward step over the plan's scheduled sequences.
    fn run(&mut self, plan: &StepPlan) -> Result<StepOutput>;
}

/// The cheap draft model used for speculative decoding.
///
/// Implementations propose `k` candidate tokens for a sequence along with
/// the probability each was drawn with; the verifier accepts a prefix of
/// them against the target model's distributions.
pub trait DraftModel {
    /// Propose `k` draft tokens for the sequence's current position.
    fn propose(&mut self, seq: &SequenceState, k: usize) -> Result<DraftProposal>;
}
