//! Integration tests for the continuous batching scheduler, driven the way
//! the engine drives it: plan, materialize the fed tokens, sample on
//! completion.

use tokenflow::config::SchedulerConfig;
use tokenflow::core::page::compute_num_pages;
use tokenflow::core::sequence::FinishReason;
use tokenflow::scheduler::StepPlan;
use tokenflow::{BatchScheduler, SequenceState};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_seqs_in_flight: 8,
        max_step_tokens: 256,
        age_weight: 0.0,
    }
}

/// Simulate one serving step: advance decode positions and append one
/// sampled token for every sequence that completed its pending work.
fn drive(sched: &mut BatchScheduler) -> StepPlan {
    let plan = sched.plan();
    for seq_id in plan.scheduled_ids() {
        let fed = plan.tokens_per_sequence[&seq_id] as usize;
        let seq = sched.get_sequence_mut(seq_id).unwrap();
        let completes = fed == seq.pending_tokens();
        seq.advance_decode(fed);
        if completes {
            seq.append_token(1).unwrap();
        }
    }
    plan
}

#[test]
fn test_incremental_page_allocation_over_long_generation() {
    // Pool of 16 pages of 4 tokens; one request generating 48 tokens on a
    // 2-token prompt grows to exactly ceil(50/4) = 13 pages, one boundary
    // at a time.
    let mut sched = BatchScheduler::new(config(), 4, 16);
    sched.add_sequence(SequenceState::new(1, vec![5, 6], 48));

    let mut finished = Vec::new();
    let mut max_pages = 0;
    for _ in 0..200 {
        drive(&mut sched);
        finished.extend(sched.take_finished());
        if !sched.has_work() {
            break;
        }
        if let Some(seq) = sched.get_sequence(1) {
            let pages = seq.page_table().num_pages();
            // Pages track the history length exactly; allocation is never
            // more than one boundary ahead.
            assert_eq!(pages, compute_num_pages(seq.total_len(), 4));
            max_pages = max_pages.max(pages);
        }
    }

    assert_eq!(finished, vec![(1, FinishReason::MaxTokens)]);
    assert_eq!(max_pages, 13);
    assert_eq!(sched.allocator().num_free_pages(), 16);
}

#[test]
fn test_pool_smaller_than_request_truncates_budget() {
    // Pool of 10 pages of 4 tokens holds 40 tokens; the same 50-token
    // request gets its budget clipped at admission and still finishes
    // cleanly instead of thrashing the pool.
    let mut sched = BatchScheduler::new(config(), 4, 10);
    sched.add_sequence(SequenceState::new(1, vec![5, 6], 48));

    drive(&mut sched);
    assert_eq!(sched.get_sequence(1).unwrap().max_tokens(), 38);

    let mut finished = Vec::new();
    for _ in 0..200 {
        finished.extend(sched.take_finished());
        if !sched.has_work() {
            break;
        }
        drive(&mut sched);
    }

    assert_eq!(finished, vec![(1, FinishReason::MaxTokens)]);
    assert_eq!(sched.allocator().num_free_pages(), 10);
}

#[test]
fn test_third_request_waits_for_capacity() {
    // Pool with room for two one-page sequences; the third is queued, never
    // dropped, and admitted once a page frees.
    let mut sched = BatchScheduler::new(config(), 4, 2);
    for id in 1..=3 {
        sched.add_sequence(SequenceState::new(id, vec![1, 2, 3], 1));
    }

    let plan = drive(&mut sched);
    assert_eq!(plan.new_admissions, vec![1, 2]);
    assert_eq!(sched.num_queued(), 1);

    let mut finished = Vec::new();
    let mut admitted_third = false;
    for _ in 0..20 {
        let plan = drive(&mut sched);
        admitted_third |= plan.new_admissions.contains(&3);
        finished.extend(sched.take_finished());
        if !sched.has_work() {
            break;
        }
    }

    assert!(admitted_third);
    let mut done: Vec<u64> = finished.iter().map(|(id, _)| *id).collect();
    done.sort_unstable();
    assert_eq!(done, vec![1, 2, 3]);
    assert!(finished
        .iter()
        .all(|(_, reason)| *reason == FinishReason::MaxTokens));
    assert_eq!(sched.allocator().num_free_pages(), 2);
}

#[test]
fn test_evicted_sequence_is_eventually_served() {
    // Pool of 4 pages of 4 tokens. The high-priority sequence grows into
    // the whole pool, evicting the low-priority one, which must still
    // finish after the pool frees up.
    let mut sched = BatchScheduler::new(config(), 4, 4);
    sched.add_sequence(SequenceState::with_priority(1, (0..8).collect(), 8, 5));
    sched.add_sequence(SequenceState::with_priority(2, (0..3).collect(), 2, -5));

    let mut finished = Vec::new();
    let mut evicted = Vec::new();
    for _ in 0..100 {
        let plan = drive(&mut sched);
        evicted.extend(plan.evictions.clone());
        finished.extend(sched.take_finished());
        if !sched.has_work() {
            break;
        }
    }

    assert_eq!(evicted, vec![2]);
    let mut done: Vec<u64> = finished.iter().map(|(id, _)| *id).collect();
    done.sort_unstable();
    assert_eq!(done, vec![1, 2]);
    assert_eq!(sched.allocator().num_free_pages(), 4);
    assert_eq!(sched.pages_held(), 0);
}

#[test]
fn test_conservation_at_every_quiescent_point() {
    let mut sched = BatchScheduler::new(config(), 4, 6);
    sched.add_sequence(SequenceState::new(1, vec![1, 2, 3, 4, 5], 6));
    sched.add_sequence(SequenceState::new(2, vec![1, 2], 10));
    sched.add_sequence(SequenceState::new(3, vec![1, 2, 3], 4));

    for _ in 0..150 {
        drive(&mut sched);
        sched.take_finished();
        assert_eq!(
            sched.allocator().num_free_pages() + sched.pages_held(),
            sched.allocator().num_pages(),
            "conservation violated between steps"
        );
        if !sched.has_work() {
            break;
        }
    }
    assert_eq!(sched.allocator().num_free_pages(), 6);
}

#[test]
fn test_age_weight_lifts_waiting_requests() {
    // With a large age weight, a long-waiting low-priority request outranks
    // a fresh high-priority one.
    let mut sched = BatchScheduler::new(
        SchedulerConfig {
            age_weight: 1e6,
            ..config()
        },
        4,
        16,
    );
    sched.add_sequence(SequenceState::with_priority(1, vec![1, 2], 2, -10));
    std::thread::sleep(std::time::Duration::from_millis(5));
    sched.add_sequence(SequenceState::with_priority(2, vec![3, 4], 2, 10));

    let plan = sched.plan();
    assert_eq!(plan.new_admissions[0], 1);
}
