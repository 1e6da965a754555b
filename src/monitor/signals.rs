//! Pure signal computations.

use crate::adapters::Candidate;
use crate::claims::ClaimGraph;
use crate::text;

const HEDGE_PENALTY: f64 = 0.5;

/// Binary entropy H(p) in bits.
pub fn binary_entropy_bits(p: f64) -> f64 {
    let p = p.clamp(1e-10, 1.0 - 1e-10);
    -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

/// 1 - mean pairwise token-overlap similarity of the candidates' answers.
/// Zero with fewer than two candidates.
pub fn k_sample_variance(candidates: &[Candidate]) -> f64 {
    if candidates.len() < 2 {
        return 0.0;
    }
    let sets: Vec<_> = candidates.iter().map(|c| text::token_set(&c.text)).collect();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            total += text::jaccard(&sets[i], &sets[j]);
            pairs += 1;
        }
    }
    (1.0 - total / pairs as f64).clamp(0.0, 1.0)
}

/// Least-squares slope of `ys` against their index.
pub fn slope(ys: &[f64]) -> Option<f64> {
    let n = ys.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n_f;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid of the per-token entropy slope over the first `prefix` tokens.
///
/// Entropy dropping fast maps toward 0, flat to 0.5, rising toward 1.
/// Without at least two finite log-probs the signal is 0.5.
pub fn entropy_prefix_slope(token_log_probs: &[f64], prefix: usize, gain: f64) -> f64 {
    let entropies: Vec<f64> = token_log_probs
        .iter()
        .take(prefix)
        .filter(|lp| lp.is_finite())
        .map(|lp| binary_entropy_bits(lp.min(0.0).exp()))
        .collect();
    match slope(&entropies) {
        Some(s) if s.is_finite() => sigmoid(gain * s),
        _ => 0.5,
    }
}

/// Model-side confidence of a candidate: self-reported if present, else the
/// geometric-mean token probability, else 0.5.
pub fn model_confidence(candidate: &Candidate) -> f64 {
    if let Some(c) = candidate.self_reported_confidence.filter(|c| c.is_finite()) {
        return c.clamp(0.0, 1.0);
    }
    let finite: Vec<f64> = candidate
        .token_log_probs
        .iter()
        .copied()
        .filter(|lp| lp.is_finite())
        .collect();
    if finite.is_empty() {
        return 0.5;
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    mean.min(0.0).exp()
}

/// Judge-free confidence: model confidence averaged with the fraction of the
/// candidate's claims that survived the consistency pass. Hedged surviving
/// claims count for half.
pub fn heuristic_confidence(candidate: &Candidate, graph: &ClaimGraph) -> f64 {
    let support = graph.survival_rate(candidate.index)
        * (1.0 - HEDGE_PENALTY * graph.hedged_rate(candidate.index));
    0.5 * model_confidence(candidate) + 0.5 * support
}

/// Position of the candidate with the highest heuristic confidence; the
/// earliest wins ties.
pub fn best_candidate(candidates: &[Candidate], graph: &ClaimGraph) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .map(|(pos, c)| (pos, heuristic_confidence(c, graph)))
        .fold(None::<(usize, f64)>, |best, (pos, conf)| match best {
            Some((_, b)) if conf <= b => best,
            _ => Some((pos, conf)),
        })
        .map(|(pos, _)| pos)
}
