use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How often one studio appears in a candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StudioStat {
    pub name: String,
    pub count: usize,
    /// `count / candidate_size`
    pub ratio: f64,
}

/// Count studios over a whole candidate set.
///
/// Blank or missing names are skipped but still count toward
/// `candidate_size`. Output is ordered by count descending, then name, and
/// holds at most `top_k` entries (at least one slot is always allowed).
pub fn aggregate_studios<'a>(
    studios: impl IntoIterator<Item = Option<&'a str>>,
    top_k: usize,
) -> (Vec<StudioStat>, usize) {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut candidate_size = 0usize;

    for studio in studios {
        candidate_size += 1;
        if let Some(name) = studio.map(str::trim).filter(|s| !s.is_empty()) {
            *counts.entry(name).or_default() += 1;
        }
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(top_k.max(1));

    let denom = candidate_size.max(1) as f64;
    let stats = ranked
        .into_iter()
        .map(|(name, count)| StudioStat {
            name: name.to_string(),
            count,
            ratio: count as f64 / denom,
        })
        .collect();
    (stats, candidate_size)
}
