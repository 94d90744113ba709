//! Demo driver for the tokenflow serving core.
//!
//! Runs the engine against a deterministic built-in "model" (no weights, no
//! GPU): each sequence's next token is a fixed function of its position, so
//! the scheduler, paged allocator, and speculative verifier can be exercised
//! end to end from the command line.

use candle_core::{Device, Tensor};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tokenflow::speculative::DraftProposal;
use tokenflow::{
    DraftModel, Engine, EngineConfig, Result, SequenceState, SpeculativeConfig, StepOutput,
    StepPlan, StepRunner, StreamEvent, SubmitRequest,
};

#[derive(Parser, Debug)]
#[command(name = "tokenflow")]
#[command(about = "Continuous-batching serving core demo")]
struct Args {
    /// Number of KV cache pages in the pool
    #[arg(long, default_value = "64")]
    num_pages: usize,

    /// Tokens per page
    #[arg(long, default_value = "16")]
    page_capacity: usize,

    /// Number of concurrent demo requests
    #[arg(short, long, default_value = "4")]
    requests: usize,

    /// Prompt length per request
    #[arg(long, default_value = "8")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Speculative window (0 disables the draft model)
    #[arg(short, long, default_value = "0")]
    speculative: usize,
}

const VOCAB: usize = 256;

/// The demo "model": the token at history index `pos` is a fixed function
/// of the sequence and the position.
fn token_at(seq_id: u64, pos: usize) -> u32 {
    ((pos as u64 * 31 + seq_id * 7) % VOCAB as u64) as u32
}

/// Deterministic step runner: one-hot logits predicting `token_at`.
struct DemoRunner;

impl StepRunner for DemoRunner {
    fn run(&mut self, plan: &StepPlan) -> Result<StepOutput> {
        let mut outputs = StepOutput::new();
        for seq_id in plan.scheduled_ids() {
            let Some(input) = plan.inputs.get(&seq_id) else {
                continue;
            };
            let fed = input.tokens.len();
            let mut data = vec![0.0f32; fed * VOCAB];
            for row in 0..fed {
                // The row after consuming the token at `position + row`
                // predicts the token at the next history index.
                let predicted = token_at(seq_id, input.position + row + 1);
                data[row * VOCAB + predicted as usize] = 50.0;
            }
            outputs.insert(seq_id, Tensor::from_vec(data, (fed, VOCAB), &Device::Cpu)?);
        }
        Ok(outputs)
    }
}

/// Draft model that agrees with the demo runner, so drafts verify at full
/// acceptance.
struct DemoDraft;

impl DraftModel for DemoDraft {
    fn propose(&mut self, seq: &SequenceState, k: usize) -> Result<DraftProposal> {
        let tokens: Vec<u32> = (0..k).map(|j| token_at(seq.id(), seq.total_len() + j)).collect();
        let mut data = vec![0.0f32; k * VOCAB];
        for (row, &token) in tokens.iter().enumerate() {
            data[row * VOCAB + token as usize] = 1.0;
        }
        Ok(DraftProposal {
            sequence_id: seq.id(),
            tokens,
            probs: Tensor::from_vec(data, (k, VOCAB), &Device::Cpu)?,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    println!("tokenflow v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig {
        num_pages: args.num_pages,
        page_capacity: args.page_capacity,
        speculative: SpeculativeConfig::new(args.speculative),
        ..Default::default()
    };

    let draft: Option<Box<dyn DraftModel + Send>> = if args.speculative > 0 {
        Some(Box::new(DemoDraft))
    } else {
        None
    };

    let (handle, join) = Engine::spawn(config, Box::new(DemoRunner), draft)?;
    info!(requests = args.requests, "submitting demo requests");

    let mut streams = Vec::new();
    for i in 0..args.requests {
        let prompt: Vec<u32> = (0..args.prompt_len)
            .map(|p| token_at(i as u64 + 1, p))
            .collect();
        let request = SubmitRequest::new(prompt)
            .max_tokens(args.max_tokens)
            .temperature(0.0)
            .priority(i as i32 % 2);
        let (seq_id, events) = handle.submit(request)?;
        streams.push((seq_id, events));
    }
    drop(handle);

    for (seq_id, mut events) in streams {
        let mut tokens = Vec::new();
        let mut outcome = String::from("no terminal event");
        while let Some(event) = events.blocking_recv() {
            match event {
                StreamEvent::Token(token) => tokens.push(token),
                StreamEvent::Finished(reason) => {
                    outcome = format!("{reason:?}");
                    break;
                }
                StreamEvent::Error(message) => {
                    outcome = format!("error: {message}");
                    break;
                }
            }
        }
        println!(
            "sequence {seq_id}: {} tokens ({outcome}): {:?}",
            tokens.len(),
            tokens
        );
    }

    join.join()
        .map_err(|_| tokenflow::Error::Config("engine thread panicked".to_string()))?;
    Ok(())
}
