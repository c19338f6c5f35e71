//! Maximal Marginal Relevance reranking.

use crate::vector::{Matrix, cosine};

/// Default relevance/diversity trade-off.
pub const DEFAULT_LAMBDA: f32 = 0.7;

/// Greedily pick `k` rows of `embeddings` balancing relevance against
/// redundancy.
///
/// The first pick is the most relevant row. Each following pick maximizes
/// `λ·relevance(c) − (1−λ)·max_s cos(c, s)` over the rows not yet chosen.
/// Ties go to the lower index. `k` is clamped to the number of rows.
///
/// Returns row indices in pick order.
pub fn mmr_rerank(
    embeddings: &Matrix,
    scores: &[f32],
    k: usize,
    lambda: f32,
) -> Vec<usize> {
    let n = embeddings.rows().min(scores.len());
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }

    let Some(first) = argmax(scores[..n].iter().copied()) else {
        return Vec::new();
    };

    let mut selected = Vec::with_capacity(k);
    let mut taken = vec![false; n];
    // max similarity of each row to anything selected so far
    let mut redundancy = vec![f32::NEG_INFINITY; n];

    let mut pick = first;
    loop {
        selected.push(pick);
        taken[pick] = true;
        if selected.len() == k {
            break;
        }

        let chosen = embeddings.row(pick);
        for (c, r) in redundancy.iter_mut().enumerate() {
            if !taken[c] {
                *r = r.max(cosine(embeddings.row(c), chosen));
            }
        }

        let next = argmax((0..n).map(|c| {
            if taken[c] {
                f32::NEG_INFINITY
            } else {
                lambda * scores[c] - (1.0 - lambda) * redundancy[c]
            }
        }));
        match next {
            Some(c) if !taken[c] => pick = c,
            _ => break,
        }
    }

    selected
}

/// Index of the first maximum, ignoring NaN.
fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
