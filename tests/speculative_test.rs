//! End-to-end speculative decoding tests: a deterministic target runner
//! with drafts that agree, lie, or arrive malformed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use tokenflow::core::sequence::FinishReason;
use tokenflow::speculative::DraftProposal;
use tokenflow::{
    DraftModel, Engine, EngineConfig, Result, SequenceId, SequenceState, SpeculativeConfig,
    StepOutput, StepPlan, StepRunner, StreamEvent, SubmitRequest,
};

const VOCAB: usize = 32;

fn token_at(seq_id: SequenceId, pos: usize) -> u32 {
    ((pos as u64 * 13 + seq_id * 5) % VOCAB as u64) as u32
}

struct PositionRunner {
    calls: Arc<AtomicUsize>,
}

impl StepRunner for PositionRunner {
    fn run(&mut self, plan: &StepPlan) -> Result<StepOutput> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut outputs = StepOutput::new();
        for seq_id in plan.scheduled_ids() {
            let input = &plan.inputs[&seq_id];
            let fed = input.tokens.len();
            let mut data = vec![0.0f32; fed * VOCAB];
            for row in 0..fed {
                let predicted = token_at(seq_id, input.position + row + 1);
                data[row * VOCAB + predicted as usize] = 50.0;
            }
            outputs.insert(seq_id, Tensor::from_vec(data, (fed, VOCAB), &Device::Cpu)?);
        }
        Ok(outputs)
    }
}

/// Draft that predicts the target's tokens exactly: full acceptance.
struct AgreeableDraft;

/// Draft that is wrong at the second position of every window.
struct LyingDraft;

/// Draft that always returns one token fewer than asked: malformed.
struct ShortDraft;

fn one_hot_probs(tokens: &[u32]) -> Tensor {
    let k = tokens.len();
    let mut data = vec![0.0f32; k * VOCAB];
    for (row, &token) in tokens.iter().enumerate() {
        data[row * VOCAB + token as usize] = 1.0;
    }
    Tensor::from_vec(data, (k, VOCAB), &Device::Cpu).unwrap()
}

fn draft_tokens(seq: &SequenceState, k: usize) -> Vec<u32> {
    (0..k).map(|j| token_at(seq.id(), seq.total_len() + j)).collect()
}

impl DraftModel for AgreeableDraft {
    fn propose(&mut self, seq: &SequenceState, k: usize) -> Result<DraftProposal> {
        let tokens = draft_tokens(seq, k);
        Ok(DraftProposal {
            sequence_id: seq.id(),
            probs: one_hot_probs(&tokens),
            tokens,
        })
    }
}

impl DraftModel for LyingDraft {
    fn propose(&mut self, seq: &SequenceState, k: usize) -> Result<DraftProposal> {
        let mut tokens = draft_tokens(seq, k);
        if tokens.len() > 1 {
            tokens[1] = (tokens[1] + 1) % VOCAB as u32;
        }
        Ok(DraftProposal {
            sequence_id: seq.id(),
            probs: one_hot_probs(&tokens),
            tokens,
        })
    }
}

impl DraftModel for ShortDraft {
    fn propose(&mut self, seq: &SequenceState, k: usize) -> Result<DraftProposal> {
        let tokens = draft_tokens(seq, k.saturating_sub(1));
        Ok(DraftProposal {
            sequence_id: seq.id(),
            probs: one_hot_probs(&tokens),
            tokens,
        })
    }
}

fn run_engine(
    draft: Option<Box<dyn DraftModel + Send>>,
    window: usize,
    prompt_len: usize,
    max_tokens: usize,
) -> (Vec<u32>, Option<StreamEvent>, usize) {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = EngineConfig {
        num_pages: 16,
        page_capacity: 4,
        speculative: SpeculativeConfig::new(window),
        ..Default::default()
    };
    let runner = PositionRunner {
        calls: calls.clone(),
    };
    let (mut engine, handle) = Engine::new(config, Box::new(runner), draft);

    let request = SubmitRequest::new(vec![0; prompt_len])
        .max_tokens(max_tokens)
        .temperature(0.0);
    let (_, mut events) = handle.submit(request).unwrap();
    drop(handle);
    engine.run();

    let mut tokens = Vec::new();
    let mut terminal = None;
    while let Ok(event) = events.try_recv() {
        match event {
            StreamEvent::Token(t) => tokens.push(t),
            other => terminal = Some(other),
        }
    }
    (tokens, terminal, calls.load(Ordering::Relaxed))
}

fn expected_tokens(prompt_len: usize, max_tokens: usize) -> Vec<u32> {
    // The handle numbers its first sequence 1.
    (0..max_tokens).map(|j| token_at(1, prompt_len + j)).collect()
}

#[test]
fn test_full_acceptance_amortizes_forward_passes() {
    let (tokens, terminal, calls) = run_engine(Some(Box::new(AgreeableDraft)), 4, 4, 8);

    assert_eq!(tokens, expected_tokens(4, 8));
    assert_eq!(terminal, Some(StreamEvent::Finished(FinishReason::MaxTokens)));
    // One prefill step, then 4 tokens per verified window instead of one
    // forward pass per token.
    assert!(calls <= 4, "expected amortized steps, got {calls} calls");
}

#[test]
fn test_rejected_drafts_do_not_change_output() {
    // A draft that is wrong at position 1 of every window is corrected by
    // the verifier; the emitted stream must be byte-identical to what the
    // target model would produce alone.
    let (tokens, terminal, _) = run_engine(Some(Box::new(LyingDraft)), 4, 4, 8);

    assert_eq!(tokens, expected_tokens(4, 8));
    assert_eq!(terminal, Some(StreamEvent::Finished(FinishReason::MaxTokens)));
}

#[test]
fn test_malformed_drafts_degrade_to_plain_decoding() {
    let (tokens, terminal, calls) = run_engine(Some(Box::new(ShortDraft)), 4, 4, 8);

    assert_eq!(tokens, expected_tokens(4, 8));
    assert_eq!(terminal, Some(StreamEvent::Finished(FinishReason::MaxTokens)));
    // Every decode step fell back to one token per forward pass.
    assert_eq!(calls, 8);
}

#[test]
fn test_window_zero_bypasses_verifier() {
    let (tokens, terminal, calls) = run_engine(Some(Box::new(AgreeableDraft)), 0, 4, 6);

    assert_eq!(tokens, expected_tokens(4, 6));
    assert_eq!(terminal, Some(StreamEvent::Finished(FinishReason::MaxTokens)));
    assert_eq!(calls, 6);
}

#[test]
fn test_speculative_and_plain_agree() {
    let (with_spec, _, spec_calls) = run_engine(Some(Box::new(AgreeableDraft)), 4, 3, 10);
    let (plain, _, plain_calls) = run_engine(None, 4, 3, 10);

    assert_eq!(with_spec, plain);
    assert!(spec_calls < plain_calls);
}
