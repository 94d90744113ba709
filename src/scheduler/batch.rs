//! Continuous batching scheduler.
//!
//! Every serving step the scheduler decides which sequences run, which queued
//! requests are admitted, and which running sequences must be evicted to keep
//! the page pool solvent. In-flight sequences are reserved for first; new
//! admissions only consume what is left. The output is a [`StepPlan`] whose
//! page allocations are fully committed before the step runner is invoked.
//!
//! ```text
//!   submit()                                    plan()
//!      │                                           │
//!      ▼                                           ▼
//!  ┌────────┐   admission (pages bound)      ┌───────────┐
//!  │ Queued │ ─────────────────────────────► │  Running  │
//!  └────────┘                                └───────────┘
//!      ▲            eviction (pages            │
//!      └────────────  released)  ──────────────┘
//!                 (memory pressure)
//! ```
//!
//! Cancellation, completion, and step failures are observed only at
//! plan-construction time; a terminated sequence's pages are released in one
//! batch on the next `plan()` call, never mid-step.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::allocator::PageAllocator;
use crate::core::page::{compute_num_pages, PageTable};
use crate::core::sequence::{FinishReason, SequenceId, SequenceState, SequenceStatus};
use crate::scheduler::plan::{StepInput, StepPlan};

/// Continuous batching scheduler.
///
/// Owns the [`PageAllocator`] and all [`SequenceState`] mutation; a single
/// thread drives it (single-writer discipline), so no locking happens on the
/// decode hot path.
pub struct BatchScheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Page allocator for the KV cache pool.
    allocator: PageAllocator,
    /// All live sequences.
    sequences: HashMap<SequenceId, SequenceState>,
    /// Queued sequence IDs (fresh and preempted), admission order decided
    /// per plan.
    queued: Vec<SequenceId>,
    /// Running sequence IDs.
    running: Vec<SequenceId>,
    /// Monotone admission counter for FIFO tie-breaks.
    arrival_counter: u64,
    /// Sequences the scheduler itself finished during the last `plan()`
    /// (zero budget, pool misfit), drained by the engine to emit terminal
    /// events.
    finished: Vec<(SequenceId, FinishReason)>,
}

impl BatchScheduler {
    /// Create a new scheduler over a pool of `num_pages` pages holding
    /// `page_capacity` tokens each.
    pub fn new(config: SchedulerConfig, page_capacity: usize, num_pages: usize) -> Self {
        Self {
            config,
            allocator: PageAllocator::new(num_pages, page_capacity),
            sequences: HashMap::new(),
            queued: Vec::new(),
            running: Vec::new(),
            arrival_counter: 0,
            finished: Vec::new(),
        }
    }

    /// Add a new sequence to the queue.
    pub fn add_sequence(&mut self, mut seq: SequenceState) {
        seq.set_arrival(self.arrival_counter);
        self.arrival_counter += 1;

        // The page table must use the pool's geometry, not the default.
        if seq.page_table().is_empty() {
            *seq.page_table_mut() = PageTable::new(self.allocator.page_capacity());
        }

        debug!(
            seq_id = seq.id(),
            prompt_len = seq.prompt_len(),
            max_tokens = seq.max_tokens(),
            priority = seq.priority(),
            "sequence queued"
        );

        self.queued.push(seq.id());
        self.sequences.insert(seq.id(), seq);
    }

    /// Mark a sequence cancelled.
    ///
    /// The plan on the next iteration excludes it and releases its pages.
    /// Returns `true` if this call took effect, `false` if the sequence was
    /// unknown or already terminal (cancellation is idempotent).
    pub fn cancel(&mut self, seq_id: SequenceId) -> bool {
        match self.sequences.get_mut(&seq_id) {
            Some(seq) => {
                let cancelled = seq.set_cancelled();
                if cancelled {
                    debug!(seq_id, "sequence cancelled");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Mark a sequence finished. Pages are released on the next `plan()`.
    pub fn finish_sequence(&mut self, seq_id: SequenceId, reason: FinishReason) {
        if let Some(seq) = self.sequences.get_mut(&seq_id) {
            seq.set_finished(reason);
        }
    }

    /// Mark a sequence errored. Pages are released on the next `plan()`.
    pub fn mark_errored(&mut self, seq_id: SequenceId) {
        if let Some(seq) = self.sequences.get_mut(&seq_id) {
            seq.set_errored();
        }
    }

    /// Construct the plan for the next serving step.
    ///
    /// 1. Release pages of sequences that terminated since the last step.
    /// 2. Reserve page increments for all running sequences, evicting the
    ///    lowest-effective-priority ones if the pool cannot cover them.
    /// 3. Admit queued sequences, highest effective priority first, while
    ///    pages and the per-step token budget allow.
    ///
    /// An empty ready set yields an empty plan (idle step), never an error.
    pub fn plan(&mut self) -> StepPlan {
        self.release_terminals();

        let mut plan = StepPlan::new();
        let mut prefill_budget = self.config.max_step_tokens;

        self.schedule_running(&mut plan, &mut prefill_budget);
        self.schedule_admissions(&mut plan, &mut prefill_budget);
        self.build_inputs(&mut plan);

        debug_assert!(self.allocator.check_conservation());
        plan
    }

    /// Drain the sequences the scheduler finished during the last `plan()`.
    pub fn take_finished(&mut self) -> Vec<(SequenceId, FinishReason)> {
        std::mem::take(&mut self.finished)
    }

    /// Release the page tables of terminated sequences, exactly once each,
    /// and drop their state.
    fn release_terminals(&mut self) {
        let terminal: Vec<SequenceId> = self
            .sequences
            .values()
            .filter(|s| s.status().is_terminal())
            .map(|s| s.id())
            .collect();

        for seq_id in terminal {
            if let Some(mut seq) = self.sequences.remove(&seq_id) {
                let pages = seq.page_table_mut().take_pages();
                if !pages.is_empty() {
                    self.allocator.free(&pages);
                    debug!(
                        seq_id,
                        released = pages.len(),
                        status = seq.status().as_str(),
                        "released pages of terminated sequence"
                    );
                }
            }
            self.running.retain(|&id| id != seq_id);
            self.queued.retain(|&id| id != seq_id);
        }
    }

    /// Effective admission/eviction priority: explicit priority plus queue
    /// age, so long-waiting requests eventually outrank newer high-priority
    /// ones when `age_weight > 0`.
    fn effective_priority(&self, seq: &SequenceState) -> f64 {
        seq.priority() as f64 + self.config.age_weight * seq.arrival_time().elapsed().as_secs_f64()
    }

    /// Worst-case number of tokens a decode step may append: one, or the
    /// speculative window when drafting is on, capped by the remaining
    /// budget.
    fn max_append(seq: &SequenceState) -> usize {
        seq.speculative_window().max(1).min(seq.remaining_budget())
    }

    /// Page increment a sequence needs for its pages to cover `demand`
    /// history tokens.
    fn page_increment(&self, seq_id: SequenceId, demand: usize) -> usize {
        let capacity = self.allocator.page_capacity();
        let held = self
            .sequences
            .get(&seq_id)
            .map(|s| s.page_table().num_pages())
            .unwrap_or(0);
        compute_num_pages(demand, capacity).saturating_sub(held)
    }

    /// Reserve page increments for running sequences, evicting under
    /// pressure.
    fn schedule_running(&mut self, plan: &mut StepPlan, prefill_budget: &mut usize) {
        // (seq_id, tokens to feed, history length the pages must cover)
        let mut scheduled: Vec<(SequenceId, usize, usize)> = Vec::new();
        let mut exhausted: Vec<SequenceId> = Vec::new();

        for &seq_id in &self.running {
            let Some(seq) = self.sequences.get(&seq_id) else {
                continue;
            };
            if seq.status() != SequenceStatus::Running {
                continue;
            }

            if seq.remaining_budget() == 0 {
                // Exhausted budget: route to Finished without entering a step.
                exhausted.push(seq_id);
                continue;
            }

            if seq.is_prefilling() {
                let chunk = seq.pending_tokens().min(*prefill_budget);
                if chunk == 0 {
                    // Token budget exhausted; stay running, skip this step.
                    continue;
                }
                let completes = chunk == seq.pending_tokens();
                let demand = seq.decode_pos() + chunk + usize::from(completes);
                *prefill_budget -= chunk;
                scheduled.push((seq_id, chunk, demand));
            } else {
                let demand = seq.total_len() + Self::max_append(seq);
                scheduled.push((seq_id, 1, demand));
            }
        }

        for seq_id in exhausted {
            if let Some(seq) = self.sequences.get_mut(&seq_id) {
                seq.set_finished(FinishReason::MaxTokens);
            }
            self.finished.push((seq_id, FinishReason::MaxTokens));
        }

        let mut total_needed: usize = scheduled
            .iter()
            .map(|&(id, _, demand)| self.page_increment(id, demand))
            .sum();

        // Eviction loop: reclaim pages from the lowest-effective-priority
        // running sequence (oldest arrival on ties) until the reservation
        // holds. Evicted sequences requeue and later re-admit from scratch.
        while !self.allocator.try_reserve(total_needed) {
            let Some(victim) = self.pick_eviction_victim() else {
                break;
            };
            self.evict(victim);
            plan.evictions.push(victim);
            scheduled.retain(|&(id, _, _)| id != victim);
            total_needed = scheduled
                .iter()
                .map(|&(id, _, demand)| self.page_increment(id, demand))
                .sum();
        }

        // Commit: allocations cannot fail after the reservation above.
        for (seq_id, chunk, demand) in scheduled {
            let needed = self.page_increment(seq_id, demand);
            if needed > 0 {
                match self.allocator.allocate(needed, seq_id) {
                    Ok(pages) => {
                        if let Some(seq) = self.sequences.get_mut(&seq_id) {
                            for page in pages {
                                seq.page_table_mut().append_page(page);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(seq_id, error = %e, "reserved allocation failed; skipping step");
                        continue;
                    }
                }
            }
            plan.running.push(seq_id);
            plan.tokens_per_sequence.insert(seq_id, chunk as u32);
        }
    }

    /// Lowest effective priority first, oldest arrival on ties.
    fn pick_eviction_victim(&self) -> Option<SequenceId> {
        self.running
            .iter()
            .filter_map(|id| self.sequences.get(id))
            .filter(|s| s.status() == SequenceStatus::Running)
            .min_by(|a, b| {
                self.effective_priority(a)
                    .total_cmp(&self.effective_priority(b))
                    .then(a.arrival().cmp(&b.arrival()))
            })
            .map(|s| s.id())
    }

    /// Release a running sequence's pages and requeue it for re-admission.
    fn evict(&mut self, seq_id: SequenceId) {
        if let Some(seq) = self.sequences.get_mut(&seq_id) {
            let pages = seq.page_table_mut().take_pages();
            let released = pages.len();
            self.allocator.free(&pages);
            if seq.set_preempted().is_ok() {
                debug!(seq_id, released, "evicted sequence under memory pressure");
            }
        }
        self.running.retain(|&id| id != seq_id);
        self.queued.push(seq_id);
    }

    /// Admit queued sequences with the pages left after running sequences
    /// were served.
    fn schedule_admissions(&mut self, plan: &mut StepPlan, prefill_budget: &mut usize) {
        let capacity = self.allocator.page_capacity();
        let capacity_tokens = self.allocator.num_pages() * capacity;

        // Admission order: effective priority descending, arrival ascending.
        let mut order: Vec<SequenceId> = self
            .queued
            .iter()
            .filter(|id| {
                self.sequences
                    .get(id)
                    .is_some_and(|s| !s.status().is_terminal())
            })
            .copied()
            .collect();
        order.sort_by(|a, b| {
            let (sa, sb) = (&self.sequences[a], &self.sequences[b]);
            self.effective_priority(sb)
                .total_cmp(&self.effective_priority(sa))
                .then(sa.arrival().cmp(&sb.arrival()))
        });

        let mut dequeued: Vec<SequenceId> = Vec::new();
        for seq_id in order {
            if plan.num_sequences() >= self.config.max_seqs_in_flight {
                break;
            }
            if *prefill_budget == 0 {
                break;
            }
            let Some(seq) = self.sequences.get_mut(&seq_id) else {
                continue;
            };

            if seq.total_len() == 0 || seq.remaining_budget() == 0 {
                // Nothing to prefill or nothing left to generate.
                seq.set_finished(FinishReason::MaxTokens);
                self.finished.push((seq_id, FinishReason::MaxTokens));
                dequeued.push(seq_id);
                continue;
            }

            // A request whose history cannot fit the pool with at least one
            // generated token can never make progress.
            if seq.total_len() + 1 > capacity_tokens {
                seq.set_finished(FinishReason::PoolExhausted);
                self.finished.push((seq_id, FinishReason::PoolExhausted));
                dequeued.push(seq_id);
                warn!(
                    seq_id,
                    total_len = seq.total_len(),
                    "request larger than page pool"
                );
                continue;
            }

            // Truncate the budget at admission so the sequence's worst case
            // fits the pool; memory blowup is bounded by pool size, not by
            // request count.
            seq.truncate_budget(capacity_tokens - seq.prompt_len());

            let chunk = seq.pending_tokens().min(*prefill_budget);
            if chunk == 0 {
                break;
            }
            let completes = chunk == seq.pending_tokens();
            let demand = chunk + usize::from(completes);
            let needed = compute_num_pages(demand, capacity);

            if !self.allocator.try_reserve(needed) {
                // Pool full: stop admitting, keep FIFO order intact.
                break;
            }

            match self.allocator.allocate(needed, seq_id) {
                Ok(pages) => {
                    for page in pages {
                        seq.page_table_mut().append_page(page);
                    }
                }
                Err(e) => {
                    warn!(seq_id, error = %e, "admission allocation failed");
                    break;
                }
            }

            if let Err(e) = seq.set_running() {
                warn!(seq_id, error = %e, "admission rejected");
                let pages = seq.page_table_mut().take_pages();
                self.allocator.free(&pages);
                continue;
            }

            debug!(
                seq_id,
                chunk,
                pages = seq.page_table().num_pages(),
                "admitted sequence"
            );
            *prefill_budget -= chunk;
            plan.new_admissions.push(seq_id);
            plan.tokens_per_sequence.insert(seq_id, chunk as u32);
            dequeued.push(seq_id);
            self.running.push(seq_id);
        }

        self.queued.retain(|id| !dequeued.contains(id));
    }

    /// Snapshot model inputs for every scheduled sequence.
    fn build_inputs(&self, plan: &mut StepPlan) {
        for seq_id in plan.scheduled_ids() {
            let Some(seq) = self.sequences.get(&seq_id) else {
                continue;
            };
            let chunk = plan.tokens_per_sequence.get(&seq_id).copied().unwrap_or(0) as usize;
            plan.inputs.insert(
                seq_id,
                StepInput {
                    tokens: seq.tokens_from(seq.decode_pos(), chunk),
                    position: seq.decode_pos(),
                    page_table: seq.page_table().page_ids().to_vec(),
                },
            );
        }
    }

    // ========== Accessors ==========

    /// Get a reference to a sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&SequenceState> {
        self.sequences.get(&seq_id)
    }

    /// Get a mutable reference to a sequence.
    pub fn get_sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut SequenceState> {
        self.sequences.get_mut(&seq_id)
    }

    /// Number of queued sequences.
    pub fn num_queued(&self) -> usize {
        self.queued.len()
    }

    /// Number of running sequences.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Check whether any sequences are queued or running.
    pub fn has_work(&self) -> bool {
        !self.queued.is_empty() || !self.running.is_empty()
    }

    /// Get the page allocator.
    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    /// Total pages held across all live sequences, for conservation checks.
    pub fn pages_held(&self) -> usize {
        self.sequences
            .values()
            .map(|s| s.page_table().num_pages())
            .sum()
    }
}
