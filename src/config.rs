//! Configuration types for tokenflow.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::speculative::SpeculativeConfig;

/// Engine configuration.
///
/// The static configuration surface of the serving core: KV cache pool
/// geometry, batching limits, and the default speculative window. All values
/// are fixed at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total number of KV cache pages in the pool.
    pub num_pages: usize,
    /// Page capacity in tokens.
    pub page_capacity: usize,
    /// Maximum number of sequences in flight (running at once).
    pub max_seqs_in_flight: usize,
    /// Maximum prefill tokens to schedule per step, across the batch.
    pub max_step_tokens: usize,
    /// End-of-sequence token ID, if the deployment uses one.
    pub eos_token_id: Option<u32>,
    /// Default speculative decoding settings, applied to sequences that do
    /// not request a window of their own. Only takes effect when a draft
    /// model is supplied.
    pub speculative: SpeculativeConfig,
    /// Weight of queue age (in seconds) relative to explicit priority when
    /// ordering admissions.
    pub age_weight: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_pages: 1024,
            page_capacity: 16,
            max_seqs_in_flight: 256,
            max_step_tokens: 4096,
            eos_token_id: None,
            speculative: SpeculativeConfig::disabled(),
            age_weight: 0.0,
        }
    }
}

impl EngineConfig {
    /// Load an engine configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Derive the scheduler configuration from this engine configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_seqs_in_flight: self.max_seqs_in_flight,
            max_step_tokens: self.max_step_tokens,
            age_weight: self.age_weight,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of sequences scheduled per step.
    pub max_seqs_in_flight: usize,
    /// Maximum prefill tokens per step, across the batch. Prompts longer
    /// than this prefill over several steps.
    pub max_step_tokens: usize,
    /// Weight of queue age (in seconds) relative to explicit priority when
    /// ordering admissions. Zero means strict priority with FIFO ties.
    pub age_weight: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_seqs_in_flight: 256,
            max_step_tokens: 4096,
            age_weight: 0.0,
        }
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change, 0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
        }
    }
}
