//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// A cheap draft model proposes `window` tokens per step; the target model
/// verifies all of them in a single forward pass. Larger windows raise
/// throughput when the draft agrees with the target often, and waste
/// verification work when it does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Number of tokens to draft per step (K). Zero disables speculative
    /// decoding even when a draft model is configured.
    pub window: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self { window: 4 }
    }
}

impl SpeculativeConfig {
    /// Create a config with the given window.
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// A config with speculative decoding turned off.
    pub fn disabled() -> Self {
        Self { window: 0 }
    }

    /// Check whether speculative decoding is enabled.
    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }
}
