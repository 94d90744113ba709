//! Integration tests for speculative draft verification.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenflow::{DraftProposal, Error, SpeculativeVerifier};

const VOCAB: usize = 8;

fn probs_row(mass_on: usize, weight: f32) -> Vec<f32> {
    let rest = (1.0 - weight) / (VOCAB - 1) as f32;
    (0..VOCAB)
        .map(|i| if i == mass_on { weight } else { rest })
        .collect()
}

fn tensor(rows: Vec<Vec<f32>>) -> Tensor {
    let k = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Tensor::from_vec(flat, (k, VOCAB), &Device::Cpu).unwrap()
}

/// Logit rows whose softmax puts zero mass everywhere except `hot`.
fn hard_logit_row(hot: usize) -> Vec<f32> {
    (0..VOCAB)
        .map(|i| if i == hot { 20.0 } else { -1e9 })
        .collect()
}

#[test]
fn test_rejection_at_position_two_advances_by_three() {
    // Window of 4; the target agrees with the first two draft tokens and
    // puts zero probability on the third. The verifier must accept exactly
    // 2, emit one corrected token, and advance the decode position by 3.
    let mut verifier = SpeculativeVerifier::with_seed(17);

    let draft = DraftProposal {
        sequence_id: 9,
        tokens: vec![1, 2, 5, 5],
        probs: tensor(vec![
            probs_row(1, 0.6),
            probs_row(2, 0.6),
            probs_row(5, 0.6),
            probs_row(5, 0.6),
        ]),
    };
    // Target fully agrees at positions 0 and 1 (ratio >= 1 always accepts),
    // then rejects token 5 with certainty at position 2.
    let target = tensor(vec![
        hard_logit_row(1),
        hard_logit_row(2),
        hard_logit_row(3),
        hard_logit_row(3),
    ]);

    let result = verifier.verify(&draft, &target, 1.0).unwrap();
    assert_eq!(result.accepted_count, 2);
    assert_eq!(result.accepted_tokens, vec![1, 2]);
    assert_eq!(result.corrected_token, Some(3));
    assert_eq!(result.decode_advance(), 3);
    assert_eq!(result.emitted_tokens(), vec![1, 2, 3]);
}

#[test]
fn test_full_acceptance_advances_by_window() {
    let mut verifier = SpeculativeVerifier::with_seed(5);

    let draft = DraftProposal {
        sequence_id: 1,
        tokens: vec![4, 6, 0],
        probs: tensor(vec![probs_row(4, 0.5), probs_row(6, 0.5), probs_row(0, 0.5)]),
    };
    let target = tensor(vec![hard_logit_row(4), hard_logit_row(6), hard_logit_row(0)]);

    let result = verifier.verify(&draft, &target, 1.0).unwrap();
    assert_eq!(result.accepted_count, 3);
    assert_eq!(result.corrected_token, None);
    assert_eq!(result.decode_advance(), 3);
}

#[test]
fn test_malformed_drafts_are_rejected_not_panicked() {
    let verifier = SpeculativeVerifier::with_seed(0);

    // Wrong length.
    let short = DraftProposal {
        sequence_id: 1,
        tokens: vec![1],
        probs: tensor(vec![probs_row(1, 0.5)]),
    };
    assert!(matches!(
        verifier.validate(&short, 4),
        Err(Error::MalformedDraftProposal { .. })
    ));

    // NaN probability mass.
    let mut bad_row = probs_row(1, 0.5);
    bad_row[0] = f32::NAN;
    let nan = DraftProposal {
        sequence_id: 2,
        tokens: vec![1],
        probs: tensor(vec![bad_row]),
    };
    assert!(verifier.validate(&nan, 1).is_err());

    // Probability row that does not sum to one.
    let unnormalized = DraftProposal {
        sequence_id: 3,
        tokens: vec![1],
        probs: Tensor::from_vec(vec![0.9f32; VOCAB], (1, VOCAB), &Device::Cpu).unwrap(),
    };
    assert!(verifier.validate(&unnormalized, 1).is_err());
}

#[test]
fn test_accepted_marginal_matches_target_distribution() {
    // Drawing the draft token from the draft distribution and then running
    // the accept/reject test must emit tokens with the target's marginal
    // distribution. This is the correctness guarantee of speculative
    // decoding: speedup without distribution drift.
    let target_dist = [0.05f32, 0.1, 0.15, 0.2, 0.25, 0.1, 0.1, 0.05];
    let draft_dist = [0.25f32, 0.05, 0.05, 0.25, 0.05, 0.05, 0.25, 0.05];

    let target = tensor(vec![target_dist.iter().map(|p| p.ln()).collect()]);
    let draft_probs = tensor(vec![draft_dist.to_vec()]);

    let trials = 40_000;
    let mut rng = StdRng::seed_from_u64(2024);
    let mut counts = [0usize; VOCAB];

    for _ in 0..trials {
        // Draw the proposal from the draft distribution.
        let mut u: f32 = rng.gen();
        let mut token = VOCAB - 1;
        for (i, p) in draft_dist.iter().enumerate() {
            if u < *p {
                token = i;
                break;
            }
            u -= p;
        }

        let proposal = DraftProposal {
            sequence_id: 1,
            tokens: vec![token as u32],
            probs: draft_probs.clone(),
        };
        let mut verifier = SpeculativeVerifier::with_seed(rng.gen());
        let emitted = verifier
            .verify(&proposal, &target, 1.0)
            .unwrap()
            .emitted_tokens();
        assert_eq!(emitted.len(), 1);
        counts[emitted[0] as usize] += 1;
    }

    for (i, &expected) in target_dist.iter().enumerate() {
        let observed = counts[i] as f32 / trials as f32;
        assert!(
            (observed - expected).abs() < 0.015,
            "token {i}: observed {observed:.4}, expected {expected:.4}"
        );
    }
}
