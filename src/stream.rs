//! Per-request output streaming.
//!
//! The [`OutputStreamer`] pushes accepted tokens to each request's channel
//! in generation order and detects stop conditions (EOS token, exhausted
//! budget, client gone). It only *reports* a stop back to the engine; pages
//! are released by the scheduler on its next iteration, never from the emit
//! path, so the hot decoding loop never re-enters the allocator.
//!
//! Across sequences no delivery order is guaranteed; within one sequence
//! events arrive strictly in generation order.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::core::sequence::{FinishReason, SequenceId};

/// Event delivered on a request's output channel.
///
/// A stream yields zero or more `Token` events followed by exactly one
/// terminal event (`Finished` or `Error`), after which the channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An accepted token, in generation order.
    Token(u32),
    /// Terminal: the sequence finished for the given reason.
    Finished(FinishReason),
    /// Terminal: the sequence was killed by a step runner failure.
    Error(String),
}

/// Routes engine output to per-request channels.
pub struct OutputStreamer {
    /// End-of-sequence token, if the deployment uses one.
    eos_token_id: Option<u32>,
    /// Open output channels by sequence.
    channels: HashMap<SequenceId, UnboundedSender<StreamEvent>>,
}

impl OutputStreamer {
    /// Create a streamer that recognizes `eos_token_id` as a stop token.
    pub fn new(eos_token_id: Option<u32>) -> Self {
        Self {
            eos_token_id,
            channels: HashMap::new(),
        }
    }

    /// Register the output channel for a sequence.
    pub fn register(&mut self, seq_id: SequenceId, sender: UnboundedSender<StreamEvent>) {
        self.channels.insert(seq_id, sender);
    }

    /// Emit one token and check stop conditions.
    ///
    /// `remaining_budget` is the sequence's budget *after* this token.
    /// Returns the finish reason if the token stops the sequence: the EOS
    /// token, the last budgeted token, or a receiver that went away (treated
    /// as cancellation).
    pub fn emit(
        &mut self,
        seq_id: SequenceId,
        token: u32,
        remaining_budget: usize,
    ) -> Option<FinishReason> {
        let Some(sender) = self.channels.get(&seq_id) else {
            return Some(FinishReason::Cancelled);
        };

        if sender.send(StreamEvent::Token(token)).is_err() {
            debug!(seq_id, "output receiver dropped; cancelling");
            return Some(FinishReason::Cancelled);
        }

        if self.eos_token_id == Some(token) {
            return Some(FinishReason::EndOfSequence);
        }
        if remaining_budget == 0 {
            return Some(FinishReason::MaxTokens);
        }
        None
    }

    /// Send the terminal `Finished` event and close the channel.
    pub fn finish(&mut self, seq_id: SequenceId, reason: FinishReason) {
        if let Some(sender) = self.channels.remove(&seq_id) {
            let _ = sender.send(StreamEvent::Finished(reason));
        }
    }

    /// Send the terminal `Error` event and close the channel.
    pub fn error(&mut self, seq_id: SequenceId, message: impl Into<String>) {
        if let Some(sender) = self.channels.remove(&seq_id) {
            let _ = sender.send(StreamEvent::Error(message.into()));
        }
    }

    /// Number of streams still open.
    pub fn num_open(&self) -> usize {
        self.channels.len()
    }
}
