//! Speculative decoding.
//!
//! A cheap external draft model proposes K tokens; the target model verifies
//! all of them in one forward pass; rejection sampling accepts a prefix and
//! corrects the first disagreement.
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Target verify:   one forward pass over the drafted positions
//! Rejection:       accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! ```
//!
//! The accepted output distribution is identical to sampling directly from
//! the target model; a rejected or malformed draft costs one step of
//! speedup, never correctness.

pub mod config;
pub mod verifier;

pub use config::SpeculativeConfig;
pub use verifier::{DraftProposal, SpeculativeVerifier, VerificationResult};
