//! Sequence state tracking for generation requests.
//!
//! A [`SequenceState`] is the per-request mutable record: token history, page
//! table, decode position, scheduling status, and generation budget. All
//! mutation happens on the scheduler thread.

use std::time::Instant;

use crate::core::page::PageTable;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Scheduling priority. Higher values mean higher priority.
pub type Priority = i32;

/// Default priority for new sequences.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Status of a sequence in the scheduler.
///
/// Transitions are validated: `Queued -> Running -> (Preempted -> Queued ->
/// Running)* -> Finished | Cancelled | Errored`. Terminal states are
/// absorbing; pages are released exactly once when they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be admitted.
    Queued,
    /// Scheduled with pages bound (prefill or decode).
    Running,
    /// Evicted under memory pressure; pages released, awaiting re-admission.
    Preempted,
    /// Generation complete.
    Finished,
    /// Cancelled by the client.
    Cancelled,
    /// Terminated by a step runner failure.
    Errored,
}

impl SequenceStatus {
    /// Check if the sequence still holds or may acquire resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Preempted)
    }

    /// Check if the sequence has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Errored)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Preempted => "Preempted",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
            Self::Errored => "Errored",
        }
    }
}

/// Reason a sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Generation budget reached.
    MaxTokens,
    /// Cancelled by the client.
    Cancelled,
    /// The request can never fit in the page pool.
    PoolExhausted,
}

/// Per-request mutable state.
///
/// `decode_pos` counts the tokens whose KV entries the model execution layer
/// has materialized. Between steps the token history is always at least one
/// ahead of `decode_pos`: the prompt before prefill, or the single most
/// recently sampled token afterwards. `pending_tokens` is that gap; a
/// sequence with `pending_tokens > 1` is still prefilling.
#[derive(Debug, Clone)]
pub struct SequenceState {
    /// Unique sequence identifier.
    id: SequenceId,
    /// Prompt token IDs.
    prompt_tokens: Vec<u32>,
    /// Generated token IDs.
    generated_tokens: Vec<u32>,
    /// Page table mapping token positions to KV cache pages.
    page_table: PageTable,
    /// Number of tokens with materialized KV entries.
    decode_pos: usize,
    /// Current scheduling status.
    status: SequenceStatus,
    /// Scheduling priority (higher = more important).
    priority: Priority,
    /// Generation budget: maximum tokens to generate.
    max_tokens: usize,
    /// Monotone admission counter, stamped by the scheduler.
    arrival: u64,
    /// Wall-clock arrival, used for age-weighted admission ordering.
    arrival_time: Instant,
    /// Speculative window (K). Zero disables speculative decoding.
    speculative_window: usize,
    /// Reason for finishing, once terminal.
    finish_reason: Option<FinishReason>,
}

impl SequenceState {
    /// Create a new queued sequence.
    pub fn new(id: SequenceId, prompt_tokens: Vec<u32>, max_tokens: usize) -> Self {
        Self {
            id,
            prompt_tokens,
            generated_tokens: Vec::new(),
            page_table: PageTable::with_default_capacity(),
            decode_pos: 0,
            status: SequenceStatus::Queued,
            priority: DEFAULT_PRIORITY,
            max_tokens,
            arrival: 0,
            arrival_time: Instant::now(),
            speculative_window: 0,
            finish_reason: None,
        }
    }

    /// Create a new queued sequence with an explicit priority.
    pub fn with_priority(
        id: SequenceId,
        prompt_tokens: Vec<u32>,
        max_tokens: usize,
        priority: Priority,
    ) -> Self {
        let mut seq = Self::new(id, prompt_tokens, max_tokens);
        seq.priority = priority;
        seq
    }

    // ========== Getters ==========

    /// Get the sequence ID.
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Get the prompt token IDs.
    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    /// Get the generated token IDs.
    pub fn generated_tokens(&self) -> &[u32] {
        &self.generated_tokens
    }

    /// Get the page table.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Get mutable access to the page table.
    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Get the decode position.
    pub fn decode_pos(&self) -> usize {
        self.decode_pos
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Set the priority.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Get the generation budget.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Get the admission counter stamped by the scheduler.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    /// Stamp the admission counter.
    pub(crate) fn set_arrival(&mut self, arrival: u64) {
        self.arrival = arrival;
    }

    /// Get the wall-clock arrival time.
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    /// Get the speculative window (K).
    pub fn speculative_window(&self) -> usize {
        self.speculative_window
    }

    /// Set the speculative window.
    pub fn set_speculative_window(&mut self, k: usize) {
        self.speculative_window = k;
    }

    /// Get the finish reason, once terminal.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length and phase queries ==========

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_tokens.len()
    }

    /// Get the number of generated tokens.
    pub fn output_len(&self) -> usize {
        self.generated_tokens.len()
    }

    /// Get the total token history length (prompt + generated).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens in the history whose KV entries are not yet materialized.
    pub fn pending_tokens(&self) -> usize {
        self.total_len().saturating_sub(self.decode_pos)
    }

    /// Check whether the sequence is still in the prefill phase.
    ///
    /// More than one pending token means part of the history (prompt, or the
    /// full history after a preemption) still has to be run through the
    /// model before decoding resumes.
    pub fn is_prefilling(&self) -> bool {
        self.pending_tokens() > 1
    }

    /// Remaining generation budget.
    pub fn remaining_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.output_len())
    }

    /// Get the token at an absolute history position.
    pub fn token_at(&self, pos: usize) -> Option<u32> {
        if pos < self.prompt_len() {
            self.prompt_tokens.get(pos).copied()
        } else {
            self.generated_tokens.get(pos - self.prompt_len()).copied()
        }
    }

    /// Get `n` history tokens starting at absolute position `pos`.
    ///
    /// The range is clamped to the history length.
    pub fn tokens_from(&self, pos: usize, n: usize) -> Vec<u32> {
        let end = (pos + n).min(self.total_len());
        (pos..end).filter_map(|p| self.token_at(p)).collect()
    }

    /// Get the most recent token in the history.
    pub fn last_token(&self) -> Option<u32> {
        self.generated_tokens
            .last()
            .copied()
            .or_else(|| self.prompt_tokens.last().copied())
    }

    // ========== Token operations ==========

    /// Append a generated token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceBudgetExceeded`] if the generation budget is
    /// already spent; the scheduler routes such sequences to `Finished`
    /// before they reach a step, so this indicates a bookkeeping bug.
    pub fn append_token(&mut self, token: u32) -> Result<()> {
        if self.remaining_budget() == 0 {
            return Err(Error::SequenceBudgetExceeded {
                id: self.id,
                max_tokens: self.max_tokens,
            });
        }
        self.generated_tokens.push(token);
        Ok(())
    }

    /// Advance the decode position by `n` materialized tokens.
    pub fn advance_decode(&mut self, n: usize) {
        self.decode_pos = (self.decode_pos + n).min(self.total_len());
    }

    /// Tighten the generation budget, e.g. to fit the page pool.
    ///
    /// The budget never grows and never drops below what is already
    /// generated.
    pub fn truncate_budget(&mut self, max_tokens: usize) {
        self.max_tokens = self.max_tokens.min(max_tokens).max(self.output_len());
    }

    // ========== State transitions ==========

    /// Transition to `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the sequence is
    /// `Queued` or `Preempted`.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Queued | SequenceStatus::Preempted => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to `Preempted`, rewinding the decode position.
    ///
    /// The page-release contract lives in the scheduler: the caller drains
    /// the page table and returns the pages to the allocator in the same
    /// plan-construction pass. Re-admission prefills the entire history
    /// again.
    pub fn set_preempted(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Preempted;
                self.decode_pos = 0;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Preempted",
            }),
        }
    }

    /// Mark the sequence finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        if !self.status.is_terminal() {
            self.status = SequenceStatus::Finished;
            self.finish_reason = Some(reason);
        }
    }

    /// Mark the sequence cancelled.
    ///
    /// Returns `true` if this call moved the sequence into the terminal
    /// state, `false` if it was already terminal; cancellation is
    /// idempotent.
    pub fn set_cancelled(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = SequenceStatus::Cancelled;
        self.finish_reason = Some(FinishReason::Cancelled);
        true
    }

    /// Mark the sequence errored (step runner failure).
    pub fn set_errored(&mut self) {
        if !self.status.is_terminal() {
            self.status = SequenceStatus::Errored;
        }
    }
}

impl PartialEq for SequenceState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SequenceState {}

impl std::hash::Hash for SequenceState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
