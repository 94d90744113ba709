//! Token sampling from next-token distributions.
//!
//! Selects the next token from a logits row:
//!
//! - **Temperature**: scales logits (0 = greedy argmax)
//! - **Top-k**: limits choices to the k most likely tokens
//! - **Top-p (nucleus)**: limits choices to tokens covering p probability
//!   mass
//!
//! Each request carries its own [`Sampler`] so seeds and settings never leak
//! between sequences.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler from a request's sampling configuration.
    ///
    /// Uses the configured seed when present, entropy otherwise.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Get the configured temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Sample a token from a `[vocab_size]` logits row.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        // Greedy decoding at zero temperature.
        if self.temperature <= 0.0 {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let scaled = if (self.temperature - 1.0).abs() > f32::EPSILON {
            (logits / self.temperature as f64)?
        } else {
            logits.clone()
        };
        let probs = softmax(&scaled, D::Minus1)?.to_vec1::<f32>()?;

        // Candidates sorted by probability, descending.
        let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 && self.top_k < indexed.len() {
            indexed.truncate(self.top_k);
        }

        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = indexed.len();
            for (i, (_, p)) in indexed.iter().enumerate() {
                cumulative += p;
                if cumulative > self.top_p {
                    // Keep the token that pushed us over.
                    cutoff = i + 1;
                    break;
                }
            }
            indexed.truncate(cutoff);
        }

        let weights: Vec<f32> = indexed.iter().map(|(_, p)| *p).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::Config(format!("degenerate sampling distribution: {e}")))?;
        Ok(indexed[dist.sample(&mut self.rng)].0 as u32)
    }
}
