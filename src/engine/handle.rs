//! Client-side handle to a running engine.
//!
//! Submission and cancellation cross the thread boundary through a single
//! mpsc command queue: many producers, one consumer (the engine loop). The
//! handle is cheap to clone and safe to use from async and sync contexts
//! alike; it never touches scheduler state directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::SamplingConfig;
use crate::core::sequence::{Priority, SequenceId};
use crate::error::{Error, Result};
use crate::stream::StreamEvent;

/// A generation request.
///
/// # Example
///
/// ```
/// use tokenflow::SubmitRequest;
///
/// let request = SubmitRequest::new(vec![1, 2, 3])
///     .max_tokens(64)
///     .temperature(0.8)
///     .priority(5);
/// assert_eq!(request.max_tokens, 64);
/// ```
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Prompt token IDs (tokenization happens upstream).
    pub prompt_tokens: Vec<u32>,
    /// Maximum number of tokens to generate.
    pub max_tokens: usize,
    /// Scheduling priority (higher = more important).
    pub priority: Priority,
    /// Sampling settings for this request.
    pub sampling: SamplingConfig,
    /// Per-request speculative window override; `None` uses the engine
    /// default.
    pub speculative_window: Option<usize>,
}

impl SubmitRequest {
    /// Create a request with default settings.
    pub fn new(prompt_tokens: Vec<u32>) -> Self {
        Self {
            prompt_tokens,
            max_tokens: 256,
            priority: 0,
            sampling: SamplingConfig::default(),
            speculative_window: None,
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the scheduling priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = temperature;
        self
    }

    /// Set top-k sampling.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.sampling.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling.top_p = top_p;
        self
    }

    /// Seed this request's sampler for reproducibility.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling.seed = Some(seed);
        self
    }

    /// Override the speculative window for this request.
    pub fn speculative_window(mut self, window: usize) -> Self {
        self.speculative_window = Some(window);
        self
    }
}

/// Commands crossing from clients into the engine loop.
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        seq_id: SequenceId,
        request: SubmitRequest,
        events: UnboundedSender<StreamEvent>,
    },
    Cancel(SequenceId),
}

/// Handle for submitting work to a running [`Engine`](super::Engine).
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: UnboundedSender<Command>,
    next_seq_id: Arc<AtomicU64>,
}

impl EngineHandle {
    pub(crate) fn new(commands: UnboundedSender<Command>) -> Self {
        Self {
            commands,
            next_seq_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submit a generation request.
    ///
    /// Returns the assigned sequence ID and the request's output stream,
    /// which yields [`StreamEvent::Token`] values in generation order and
    /// closes after one terminal event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineShutDown`] if the engine loop has exited.
    pub fn submit(
        &self,
        request: SubmitRequest,
    ) -> Result<(SequenceId, UnboundedReceiver<StreamEvent>)> {
        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        let (events, receiver) = mpsc::unbounded_channel();

        self.commands
            .send(Command::Submit {
                seq_id,
                request,
                events,
            })
            .map_err(|_| Error::EngineShutDown)?;

        Ok((seq_id, receiver))
    }

    /// Request cancellation of a sequence.
    ///
    /// Takes effect when the scheduler next constructs a plan, so
    /// cancellation latency is bounded by one step interval. Cancelling an
    /// already-terminal or unknown sequence is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineShutDown`] if the engine loop has exited.
    pub fn cancel(&self, seq_id: SequenceId) -> Result<()> {
        self.commands
            .send(Command::Cancel(seq_id))
            .map_err(|_| Error::EngineShutDown)
    }
}
