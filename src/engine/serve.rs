//! The serving engine: one loop, one plan in flight.
//!
//! ```text
//!  submit()/cancel()          ┌───────────────────────────────┐
//!  ───── mpsc ─────────────►  │          Engine loop          │
//!                             │                               │
//!                             │  plan ── draft ── run ──┐     │
//!                             │    ▲                    │     │
//!                             │    └── verify/sample ◄──┘     │
//!                             └───────────────│───────────────┘
//!                                             ▼
//!                              per-request event streams
//! ```
//!
//! A single thread owns the scheduler (and through it the page allocator),
//! the samplers, and the streamer; clients interact only through message
//! passing. The loop blocks solely when no sequence is queued or running.

use std::collections::HashMap;
use std::thread;

use candle_core::{IndexOp, Tensor};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::sequence::{FinishReason, SequenceId, SequenceState};
use crate::engine::handle::{Command, EngineHandle, SubmitRequest};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::runner::{DraftModel, StepRunner};
use crate::scheduler::batch::BatchScheduler;
use crate::scheduler::plan::StepPlan;
use crate::speculative::{DraftProposal, SpeculativeVerifier};
use crate::stream::{OutputStreamer, StreamEvent};

/// The serving engine.
///
/// Owns every mutable piece of serving state and advances it one step at a
/// time: construct a plan, draft (optionally), run the model once, then
/// verify, sample, and stream the results.
pub struct Engine {
    config: EngineConfig,
    scheduler: BatchScheduler,
    runner: Box<dyn StepRunner + Send>,
    draft: Option<Box<dyn DraftModel + Send>>,
    verifier: SpeculativeVerifier,
    streamer: OutputStreamer,
    samplers: HashMap<SequenceId, Sampler>,
    commands: UnboundedReceiver<Command>,
}

impl Engine {
    /// Create an engine and its submission handle.
    ///
    /// `draft` enables speculative decoding; without it every sequence
    /// decodes one token per step regardless of configured windows.
    pub fn new(
        config: EngineConfig,
        runner: Box<dyn StepRunner + Send>,
        draft: Option<Box<dyn DraftModel + Send>>,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Self {
            scheduler: BatchScheduler::new(
                config.scheduler_config(),
                config.page_capacity,
                config.num_pages,
            ),
            streamer: OutputStreamer::new(config.eos_token_id),
            verifier: SpeculativeVerifier::new(),
            samplers: HashMap::new(),
            commands: command_rx,
            config,
            runner,
            draft,
        };
        (engine, EngineHandle::new(command_tx))
    }

    /// Create an engine on its own thread and return the handle.
    ///
    /// The loop exits once every handle is dropped and all work has
    /// drained.
    pub fn spawn(
        config: EngineConfig,
        runner: Box<dyn StepRunner + Send>,
        draft: Option<Box<dyn DraftModel + Send>>,
    ) -> Result<(EngineHandle, thread::JoinHandle<()>)> {
        let (mut engine, handle) = Self::new(config, runner, draft);
        let join = thread::Builder::new()
            .name("tokenflow-engine".to_string())
            .spawn(move || engine.run())?;
        Ok((handle, join))
    }

    /// Seed the verifier's RNG for reproducible speculative acceptance.
    pub fn seed_verifier(&mut self, seed: u64) {
        self.verifier = SpeculativeVerifier::with_seed(seed);
    }

    /// Get the scheduler, e.g. for pool introspection.
    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Drive the engine until every handle is dropped and work has drained.
    ///
    /// Blocks on the command queue only when nothing is queued or running;
    /// once any work exists each step runs to completion without internal
    /// waits.
    pub fn run(&mut self) {
        info!(
            num_pages = self.config.num_pages,
            page_capacity = self.config.page_capacity,
            "engine loop started"
        );
        loop {
            if !self.scheduler.has_work() {
                match self.commands.blocking_recv() {
                    Some(command) => self.apply_command(command),
                    None => break,
                }
            }
            self.poll_commands();
            self.step();
        }
        info!("engine loop stopped");
    }

    /// Drain pending submit/cancel commands without blocking.
    pub fn poll_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                seq_id,
                request,
                events,
            } => {
                if request.prompt_tokens.is_empty() {
                    let _ = events.send(StreamEvent::Error("empty prompt".to_string()));
                    return;
                }

                let mut seq = SequenceState::with_priority(
                    seq_id,
                    request.prompt_tokens,
                    request.max_tokens,
                    request.priority,
                );
                // Speculation needs a draft model; otherwise the window is
                // moot and reserving pages for it would only waste pool.
                let window = if self.draft.is_some() {
                    request
                        .speculative_window
                        .unwrap_or(self.config.speculative.window)
                } else {
                    0
                };
                seq.set_speculative_window(window);

                self.samplers.insert(seq_id, Sampler::new(&request.sampling));
                self.streamer.register(seq_id, events);
                self.scheduler.add_sequence(seq);
                info!(seq_id, "request submitted");
            }
            Command::Cancel(seq_id) => {
                if self.scheduler.cancel(seq_id) {
                    self.streamer.finish(seq_id, FinishReason::Cancelled);
                    self.samplers.remove(&seq_id);
                }
            }
        }
    }

    /// Run one serving step: plan, draft, execute, reconcile, stream.
    pub fn step(&mut self) {
        let mut plan = self.scheduler.plan();

        for (seq_id, reason) in self.scheduler.take_finished() {
            self.samplers.remove(&seq_id);
            self.streamer.finish(seq_id, reason);
        }
        for &seq_id in &plan.evictions {
            debug!(seq_id, "sequence preempted; re-admission pending");
        }

        if plan.is_empty() {
            return;
        }

        let drafts = self.prepare_drafts(&mut plan);

        let outputs = match self.runner.run(&plan) {
            Ok(outputs) => outputs,
            Err(e) => {
                self.fail_step(&plan, &e);
                return;
            }
        };

        for seq_id in plan.scheduled_ids() {
            let fed = plan.tokens_per_sequence.get(&seq_id).copied().unwrap_or(0) as usize;
            let result = match outputs.get(&seq_id) {
                Some(logits) => self.apply_output(seq_id, fed, logits, drafts.get(&seq_id)),
                None => Err(Error::StepRunnerFailure(format!(
                    "runner produced no output for sequence {seq_id}"
                ))),
            };
            if let Err(e) = result {
                warn!(seq_id, error = %e, "terminating sequence after output failure");
                self.scheduler.mark_errored(seq_id);
                self.samplers.remove(&seq_id);
                self.streamer.error(seq_id, e.to_string());
            }
        }
    }

    /// Collect validated draft proposals and widen the plan's inputs with
    /// the drafted tokens.
    fn prepare_drafts(&mut self, plan: &mut StepPlan) -> HashMap<SequenceId, DraftProposal> {
        let mut drafts = HashMap::new();
        let Some(draft_model) = self.draft.as_mut() else {
            return drafts;
        };

        let running_ids = plan.running.clone();
        for seq_id in running_ids {
            let Some(seq) = self.scheduler.get_sequence(seq_id) else {
                continue;
            };
            if seq.is_prefilling() {
                continue;
            }
            let k = seq.speculative_window().min(seq.remaining_budget());
            if k == 0 {
                continue;
            }

            let proposal = match draft_model.propose(seq, k) {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(seq_id, error = %e, "draft model failed; single-token decode");
                    continue;
                }
            };
            if let Err(e) = self.verifier.validate(&proposal, k) {
                warn!(seq_id, error = %e, "malformed draft rejected; single-token decode");
                continue;
            }

            plan.extend_with_draft(seq_id, &proposal.tokens);
            drafts.insert(seq_id, proposal);
        }
        drafts
    }

    /// Terminate every sequence in a failed step's plan; the loop itself
    /// keeps serving.
    fn fail_step(&mut self, plan: &StepPlan, err: &Error) {
        error!(
            error = %err,
            sequences = plan.num_sequences(),
            "step runner failed; terminating planned sequences"
        );
        for seq_id in plan.scheduled_ids() {
            self.scheduler.mark_errored(seq_id);
            self.samplers.remove(&seq_id);
            self.streamer.error(seq_id, format!("step runner failed: {err}"));
        }
    }

    /// Reconcile one sequence's logits with its state: prefill progress,
    /// speculative verification, or plain decode sampling.
    fn apply_output(
        &mut self,
        seq_id: SequenceId,
        fed: usize,
        logits: &Tensor,
        proposal: Option<&DraftProposal>,
    ) -> Result<()> {
        if fed == 0 {
            return Ok(());
        }

        if let Some(proposal) = proposal {
            return self.apply_verified_output(seq_id, logits, proposal);
        }

        let still_prefilling = {
            let seq = self
                .scheduler
                .get_sequence(seq_id)
                .ok_or(Error::SequenceNotFound(seq_id))?;
            fed < seq.pending_tokens()
        };

        if let Some(seq) = self.scheduler.get_sequence_mut(seq_id) {
            seq.advance_decode(fed);
        }
        if still_prefilling {
            // Mid-prompt chunk: KV entries materialized, nothing to sample.
            return Ok(());
        }

        let row = logits.i(fed - 1)?;
        let token = self.sample_token(seq_id, &row)?;
        self.push_token(seq_id, token)?;
        Ok(())
    }

    /// Speculative path: accept a draft prefix, emit it plus any corrected
    /// token, and advance the decode position by the verified amount.
    fn apply_verified_output(
        &mut self,
        seq_id: SequenceId,
        logits: &Tensor,
        proposal: &DraftProposal,
    ) -> Result<()> {
        let temperature = self
            .samplers
            .get(&seq_id)
            .map(|s| s.temperature())
            .unwrap_or(1.0);

        match self.verifier.verify(proposal, logits, temperature) {
            Ok(result) => {
                debug!(
                    seq_id,
                    accepted = result.accepted_count,
                    corrected = result.corrected_token.is_some(),
                    "draft verified"
                );
                let mut terminated = false;
                for token in result.emitted_tokens() {
                    if self.push_token(seq_id, token)? {
                        terminated = true;
                        break;
                    }
                }
                if !terminated {
                    if let Some(seq) = self.scheduler.get_sequence_mut(seq_id) {
                        seq.advance_decode(result.decode_advance());
                    }
                }
                Ok(())
            }
            Err(e) => {
                // Degrade to ordinary decoding for this step: row 0 is the
                // next-token distribution after the pending token.
                warn!(seq_id, error = %e, "verification failed; single-token fallback");
                if let Some(seq) = self.scheduler.get_sequence_mut(seq_id) {
                    seq.advance_decode(1);
                }
                let row = logits.i(0)?;
                let token = self.sample_token(seq_id, &row)?;
                self.push_token(seq_id, token)?;
                Ok(())
            }
        }
    }

    fn sample_token(&mut self, seq_id: SequenceId, row: &Tensor) -> Result<u32> {
        self.samplers
            .get_mut(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))?
            .sample(row)
    }

    /// Append a token, stream it, and apply any stop condition. Returns
    /// `true` when the sequence reached a terminal state.
    fn push_token(&mut self, seq_id: SequenceId, token: u32) -> Result<bool> {
        let remaining = match self.scheduler.get_sequence_mut(seq_id) {
            Some(seq) => {
                seq.append_token(token)?;
                seq.remaining_budget()
            }
            None => return Ok(true),
        };

        if let Some(reason) = self.streamer.emit(seq_id, token, remaining) {
            debug!(seq_id, ?reason, "sequence finished");
            self.scheduler.finish_sequence(seq_id, reason);
            self.streamer.finish(seq_id, reason);
            self.samplers.remove(&seq_id);
            return Ok(true);
        }
        Ok(false)
    }
}
