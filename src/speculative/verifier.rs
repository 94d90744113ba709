//! Draft verification by rejection sampling.
//!
//! Given the target model's next-token distributions for the draft
//! positions, the verifier accepts the longest draft prefix that survives
//! the standard rejection test: draft token `i` is accepted with probability
//! `min(1, p_target / p_draft)`. On the first rejection one corrected token
//! is resampled from the normalized residual `max(0, p_target - p_draft)`.
//! The marginal distribution of emitted tokens is exactly the target
//! model's, so speculation never changes output quality, only latency.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::sequence::SequenceId;
use crate::error::{Error, Result};

/// Draft tokens proposed for one sequence, with the probabilities the draft
/// model drew them with.
#[derive(Debug, Clone)]
pub struct DraftProposal {
    /// The sequence these drafts extend.
    pub sequence_id: SequenceId,
    /// Proposed tokens, in position order (length K).
    pub tokens: Vec<u32>,
    /// Draft distribution per position, `[K, vocab_size]` probabilities.
    pub probs: Tensor,
}

/// Outcome of verifying one draft proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// The sequence the drafts belonged to.
    pub sequence_id: SequenceId,
    /// Length of the accepted draft prefix (`<= K`).
    pub accepted_count: usize,
    /// The accepted draft tokens themselves.
    pub accepted_tokens: Vec<u32>,
    /// Token resampled at the first rejected position, if any. `None` means
    /// the whole draft was accepted.
    pub corrected_token: Option<u32>,
}

impl VerificationResult {
    /// Tokens appended to the sequence by this verification.
    pub fn emitted_tokens(&self) -> Vec<u32> {
        let mut tokens = self.accepted_tokens.clone();
        if let Some(corrected) = self.corrected_token {
            tokens.push(corrected);
        }
        tokens
    }

    /// How far the decode position advances: `accepted_count + 1` when a
    /// correction was emitted, `accepted_count` (= K) on full acceptance.
    pub fn decode_advance(&self) -> usize {
        self.accepted_count + usize::from(self.corrected_token.is_some())
    }
}

/// Accept/reject judge for draft proposals.
#[derive(Debug)]
pub struct SpeculativeVerifier {
    rng: StdRng,
}

impl Default for SpeculativeVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeculativeVerifier {
    /// Create a verifier with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a verifier with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Check a proposal before it is fed to the target model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedDraftProposal`] when the draft has the
    /// wrong length, a probability row that is non-finite or unnormalized,
    /// an out-of-vocabulary token, or zero draft probability on a token it
    /// claims to have drawn. The caller degrades that sequence to
    /// single-token decoding for the step; nothing panics.
    pub fn validate(&self, proposal: &DraftProposal, expected_k: usize) -> Result<()> {
        let malformed = |reason: String| Error::MalformedDraftProposal {
            id: proposal.sequence_id,
            reason,
        };

        let k = proposal.tokens.len();
        if k == 0 || k != expected_k {
            return Err(malformed(format!(
                "expected {expected_k} draft tokens, got {k}"
            )));
        }

        let (rows, vocab) = proposal.probs.dims2()?;
        if rows != k {
            return Err(malformed(format!(
                "probability rows ({rows}) do not match draft length ({k})"
            )));
        }

        let probs = proposal.probs.to_vec2::<f32>()?;
        for (i, row) in probs.iter().enumerate() {
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(malformed(format!("non-finite probability at position {i}")));
            }
            let sum: f32 = row.iter().sum();
            if (sum - 1.0).abs() > 1e-2 {
                return Err(malformed(format!(
                    "probability row {i} sums to {sum}, expected 1"
                )));
            }
            let token = proposal.tokens[i] as usize;
            if token >= vocab {
                return Err(malformed(format!(
                    "draft token {token} out of vocabulary ({vocab})"
                )));
            }
            if row[token] <= 0.0 {
                return Err(malformed(format!(
                    "zero draft probability for proposed token at position {i}"
                )));
            }
        }

        Ok(())
    }

    /// Verify a draft against the target model's logits.
    ///
    /// `target_logits` must hold one row per draft position,
    /// `[K, vocab_size]`; row `i` is the target's next-token distribution at
    /// the position draft token `i` would occupy. `temperature == 0` means
    /// greedy verification: a draft token is accepted exactly when it is the
    /// target's argmax.
    pub fn verify(
        &mut self,
        proposal: &DraftProposal,
        target_logits: &Tensor,
        temperature: f32,
    ) -> Result<VerificationResult> {
        let k = proposal.tokens.len();
        let (rows, vocab) = target_logits.dims2()?;
        if rows != k {
            return Err(Error::MalformedDraftProposal {
                id: proposal.sequence_id,
                reason: format!("target logits rows ({rows}) do not match draft length ({k})"),
            });
        }

        let greedy = temperature <= 0.0;
        let target_probs = if greedy {
            target_logits.to_vec2::<f32>()?
        } else {
            let scaled = if (temperature - 1.0).abs() > f32::EPSILON {
                (target_logits / temperature as f64)?
            } else {
                target_logits.clone()
            };
            softmax(&scaled, D::Minus1)?.to_vec2::<f32>()?
        };
        let draft_probs = proposal.probs.to_vec2::<f32>()?;

        let mut accepted_tokens = Vec::with_capacity(k);
        for i in 0..k {
            let token = proposal.tokens[i] as usize;
            if token >= vocab || draft_probs[i].len() != vocab {
                return Err(Error::MalformedDraftProposal {
                    id: proposal.sequence_id,
                    reason: format!("vocabulary mismatch at position {i}"),
                });
            }

            let accept = if greedy {
                argmax(&target_probs[i]) == token
            } else {
                let p_target = target_probs[i][token];
                let p_draft = draft_probs[i][token];
                let ratio = if p_draft > 0.0 {
                    (p_target / p_draft).min(1.0)
                } else {
                    0.0
                };
                self.rng.gen::<f32>() < ratio
            };

            if accept {
                accepted_tokens.push(proposal.tokens[i]);
                continue;
            }

            // First rejection: resample from the residual distribution and
            // stop.
            let corrected = if greedy {
                argmax(&target_probs[i]) as u32
            } else {
                self.sample_residual(&target_probs[i], &draft_probs[i])
            };
            return Ok(VerificationResult {
                sequence_id: proposal.sequence_id,
                accepted_count: accepted_tokens.len(),
                accepted_tokens,
                corrected_token: Some(corrected),
            });
        }

        Ok(VerificationResult {
            sequence_id: proposal.sequence_id,
            accepted_count: k,
            accepted_tokens,
            corrected_token: None,
        })
    }

    /// Sample from `max(0, p_target - p_draft)`, renormalized. Falls back to
    /// the target distribution if the residual has no mass, and to argmax if
    /// the weights cannot form a distribution at all.
    fn sample_residual(&mut self, target: &[f32], draft: &[f32]) -> u32 {
        let residual: Vec<f32> = target
            .iter()
            .zip(draft)
            .map(|(t, d)| (t - d).max(0.0))
            .collect();

        let weights = if residual.iter().sum::<f32>() > 0.0 {
            residual
        } else {
            target.to_vec()
        };

        match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut self.rng) as u32,
            Err(_) => argmax(target) as u32,
        }
    }
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
