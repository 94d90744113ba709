//! Integration tests for sequence lifecycle and state transitions.

use tokenflow::core::sequence::FinishReason;
use tokenflow::{SequenceState, SequenceStatus};

#[test]
fn test_full_lifecycle() {
    let mut seq = SequenceState::new(1, vec![1, 2, 3, 4], 4);
    assert_eq!(seq.status(), SequenceStatus::Queued);

    seq.set_running().unwrap();

    // Prefill materializes the prompt, then the first token is sampled.
    seq.advance_decode(4);
    seq.append_token(10).unwrap();
    assert!(!seq.is_prefilling());

    // Decode steps: one materialized, one sampled, each iteration.
    for token in [11, 12, 13] {
        seq.advance_decode(1);
        seq.append_token(token).unwrap();
    }
    assert_eq!(seq.remaining_budget(), 0);
    assert_eq!(seq.generated_tokens(), &[10, 11, 12, 13]);

    seq.set_finished(FinishReason::MaxTokens);
    assert!(seq.status().is_terminal());
}

#[test]
fn test_preemption_and_readmission() {
    let mut seq = SequenceState::new(1, vec![1, 2, 3], 8);
    seq.set_running().unwrap();
    seq.advance_decode(3);
    seq.append_token(100).unwrap();
    seq.advance_decode(1);
    seq.append_token(101).unwrap();

    // Eviction releases pages and rewinds decode progress; the generated
    // tokens survive so re-admission replays the whole history.
    seq.set_preempted().unwrap();
    assert_eq!(seq.decode_pos(), 0);
    assert_eq!(seq.total_len(), 5);
    assert_eq!(seq.pending_tokens(), 5);
    assert!(seq.is_prefilling());

    seq.set_running().unwrap();
    seq.advance_decode(5);
    assert_eq!(seq.pending_tokens(), 0);
}

#[test]
fn test_queued_cannot_be_preempted() {
    let mut seq = SequenceState::new(1, vec![1], 8);
    assert!(seq.set_preempted().is_err());
}

#[test]
fn test_terminal_states_absorb() {
    let mut seq = SequenceState::new(1, vec![1], 8);
    seq.set_running().unwrap();
    seq.set_finished(FinishReason::EndOfSequence);

    assert!(seq.set_running().is_err());
    assert!(!seq.set_cancelled());
    assert_eq!(seq.finish_reason(), Some(FinishReason::EndOfSequence));
}

#[test]
fn test_cancel_from_any_active_state() {
    let mut queued = SequenceState::new(1, vec![1], 8);
    assert!(queued.set_cancelled());

    let mut running = SequenceState::new(2, vec![1], 8);
    running.set_running().unwrap();
    assert!(running.set_cancelled());

    let mut preempted = SequenceState::new(3, vec![1], 8);
    preempted.set_running().unwrap();
    preempted.set_preempted().unwrap();
    assert!(preempted.set_cancelled());
    assert_eq!(preempted.status(), SequenceStatus::Cancelled);
}

#[test]
fn test_speculative_window_capped_by_nothing_at_state_level() {
    let mut seq = SequenceState::new(1, vec![1, 2], 4);
    seq.set_speculative_window(4);
    assert_eq!(seq.speculative_window(), 4);
    // The scheduler and engine cap the effective window by budget.
    seq.append_token(5).unwrap();
    assert_eq!(seq.remaining_budget(), 3);
}
