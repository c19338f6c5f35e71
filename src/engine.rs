use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    artifact::ArtifactBundle,
    embedding::{EmbeddingProvider, encode_factor, encode_factors, factor_dims},
    error::{Error, Result},
    factor::{FACTOR_ORDER, Factor, PerFactor},
    mmr::{DEFAULT_LAMBDA, mmr_rerank},
    record::RecordHandle,
    studio_stats::{StudioStat, aggregate_studios},
    vector::{Matrix, dot, finite_or_zero, fuse, mean_of, normalized},
};

/// Factors averaged into the diversity embedding. `what` lives in a
/// different vector space and is left out.
const DIVERSITY_FACTORS: [Factor; 4] =
    [Factor::Full, Factor::Desc, Factor::How, Factor::Style];

/// Candidate-width knobs shared by every query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchTuning {
    /// Multiplier on `k` for diversity queries.
    pub candidate_alpha: usize,
    /// Candidate floor for diversity queries.
    pub min_cands: usize,
    /// Upper bound on the candidate width, never below `k`.
    pub max_candidates: usize,
    pub mmr_lambda: f32,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            candidate_alpha: 4,
            min_cands: 10,
            max_candidates: 500,
            mmr_lambda: DEFAULT_LAMBDA,
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub k: usize,
    pub diversity: bool,
    pub min_candidates: usize,
    pub want_studio_stats: bool,
    pub top_studio_k: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 5,
            diversity: false,
            min_candidates: 30,
            want_studio_stats: false,
            top_studio_k: 5,
        }
    }
}

/// One ranked portfolio with its score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RankedResult {
    pub final_score: f32,
    pub full_score: f32,
    pub desc_score: f32,
    pub what_score: f32,
    pub how_score: f32,
    pub style_score: f32,
    pub desc: String,
    pub what: String,
    pub how: String,
    pub style: String,
    pub id: i64,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub studio: Option<String>,
    pub cost: Option<f64>,
    pub period: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchOutcome {
    pub results: Vec<RankedResult>,
    pub candidate_size: usize,
    pub studio_stats: Option<Vec<StudioStat>>,
}

/// A single-factor diagnostic hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeHit {
    pub id: i64,
    pub name: String,
    pub score: f32,
}

/// Online ranking over an immutable [`ArtifactBundle`].
///
/// Holds no interior mutability; share it behind an `Arc` for concurrent
/// queries.
pub struct FusedSearchEngine {
    bundle: ArtifactBundle,
    encoder: Box<dyn EmbeddingProvider>,
    tuning: SearchTuning,
}

impl FusedSearchEngine {
    /// Pair a bundle with an encoder. The encoder's output dimensions must
    /// match the ones the bundle was built with.
    pub fn new(
        bundle: ArtifactBundle,
        encoder: Box<dyn EmbeddingProvider>,
        tuning: SearchTuning,
    ) -> Result<Self> {
        let dims = factor_dims(encoder.as_ref())?;
        if &dims != bundle.dims() {
            return Err(Error::artifact(
                "encoder",
                format!(
                    "encoder produces dimensions {dims:?}, bundle expects {:?}",
                    bundle.dims()
                ),
            ));
        }
        info!(
            records = bundle.len(),
            fused_dim = bundle.fused().dim(),
            "search engine ready"
        );
        Ok(Self {
            bundle,
            encoder,
            tuning,
        })
    }

    /// Load the bundle at `path` and rebuild the encoder it records.
    pub fn open(path: &Path, tuning: SearchTuning) -> Result<Self> {
        let bundle = ArtifactBundle::load(path)?;
        let encoder = bundle.encoder().instantiate()?;
        Self::new(bundle, encoder, tuning)
    }

    pub fn corpus_size(&self) -> usize {
        self.bundle.len()
    }

    pub fn bundle(&self) -> &ArtifactBundle {
        &self.bundle
    }

    pub fn tuning(&self) -> &SearchTuning {
        &self.tuning
    }

    /// Candidate width `M` for a query, in `[1, n]`; 0 only when `n` is 0.
    pub fn candidate_width(
        &self,
        k: usize,
        diversity: bool,
        min_candidates: usize,
        n: usize,
    ) -> usize {
        if n == 0 {
            return 0;
        }
        let k = k.clamp(1, n);
        let wanted = if diversity {
            (k * self.tuning.candidate_alpha)
                .max(self.tuning.min_cands)
                .max(min_candidates)
        } else {
            k.max(min_candidates)
        };
        wanted.min(self.tuning.max_candidates.max(k)).clamp(1, n)
    }

    /// Rank the corpus against per-factor query texts.
    pub fn search(
        &self,
        query: &PerFactor<String>,
        opts: &SearchOptions,
    ) -> Result<SearchOutcome> {
        let n = self.bundle.len();
        if n == 0 {
            debug!("empty corpus");
            return Ok(SearchOutcome {
                studio_stats: opts.want_studio_stats.then(Vec::new),
                ..Default::default()
            });
        }

        let k = opts.k.clamp(1, n);
        let m = self.candidate_width(k, opts.diversity, opts.min_candidates, n);

        let query_vectors =
            encode_factors(self.encoder.as_ref(), query, self.bundle.dims())?;
        let fused_query = fuse(&query_vectors, self.bundle.sqrt_weights());

        let candidates: Vec<RecordHandle> = self
            .bundle
            .fused()
            .search_by_key(&fused_query, m, |h| self.bundle.record(h).id)
            .into_iter()
            .map(|hit| hit.handle)
            .filter(|h| h.index() < n)
            .collect();
        debug!(
            k,
            m,
            candidates = candidates.len(),
            diversity = opts.diversity,
            "fused retrieval"
        );

        // exact per-factor rescoring of the candidates
        let weights = self.bundle.weights();
        let scored: Vec<(PerFactor<f32>, f32)> = candidates
            .iter()
            .map(|&h| {
                let scores = PerFactor::from_fn(|f| {
                    let stored = self.bundle.factor_vector(f, h);
                    finite_or_zero(dot(&query_vectors[f], stored))
                });
                let total = FACTOR_ORDER
                    .iter()
                    .map(|&f| weights[f] * scores[f])
                    .sum::<f32>();
                (scores, finite_or_zero(total))
            })
            .collect();

        let order = if opts.diversity {
            let embeddings = self.diversity_embeddings(&candidates)?;
            let relevance: Vec<f32> = scored.iter().map(|(_, s)| *s).collect();
            mmr_rerank(&embeddings, &relevance, k, self.tuning.mmr_lambda)
        } else {
            let mut order: Vec<usize> = (0..candidates.len()).collect();
            order.sort_by(|&a, &b| {
                scored[b]
                    .1
                    .total_cmp(&scored[a].1)
                    .then_with(|| {
                        self.bundle
                            .record(candidates[a])
                            .id
                            .cmp(&self.bundle.record(candidates[b]).id)
                    })
            });
            order.truncate(k);
            order
        };

        let results = order
            .into_iter()
            .map(|i| self.assemble(candidates[i], &scored[i].0, scored[i].1))
            .collect();

        let studio_stats = opts.want_studio_stats.then(|| {
            let studios =
                candidates.iter().map(|&h| self.bundle.record(h).studio());
            aggregate_studios(studios, opts.top_studio_k).0
        });

        Ok(SearchOutcome {
            results,
            candidate_size: candidates.len(),
            studio_stats,
        })
    }

    /// Search one factor's index directly.
    pub fn probe(
        &self,
        factor: Factor,
        text: &str,
        m: usize,
    ) -> Result<Vec<ProbeHit>> {
        let dim = self.bundle.dims()[factor];
        let query = encode_factor(self.encoder.as_ref(), factor, text, dim)?;
        Ok(self
            .bundle
            .probe(factor, &query, m)
            .into_iter()
            .map(|hit| {
                let record = self.bundle.record(hit.handle);
                ProbeHit {
                    id: record.id,
                    name: record.name.clone(),
                    score: hit.score,
                }
            })
            .collect())
    }

    /// Renormalized mean of the sentence-space factor vectors per candidate.
    fn diversity_embeddings(
        &self,
        candidates: &[RecordHandle],
    ) -> Result<Matrix> {
        let dim = self.bundle.dims().full;
        let rows: Vec<Vec<f32>> = candidates
            .iter()
            .map(|&h| {
                let vectors = DIVERSITY_FACTORS
                    .iter()
                    .map(|&f| self.bundle.factor_vector(f, h));
                let mean =
                    mean_of(dim, vectors).unwrap_or_else(|| vec![0.0; dim]);
                normalized(mean)
            })
            .collect();
        Matrix::from_rows(dim, &rows).ok_or_else(|| {
            Error::artifact("diversity", "sentence factor dimensions differ")
        })
    }

    fn assemble(
        &self,
        handle: RecordHandle,
        scores: &PerFactor<f32>,
        final_score: f32,
    ) -> RankedResult {
        let record = self.bundle.record(handle);
        RankedResult {
            final_score,
            full_score: scores.full,
            desc_score: scores.desc,
            what_score: scores.what,
            how_score: scores.how,
            style_score: scores.style,
            desc: record.texts.desc.clone(),
            what: record.texts.what.clone(),
            how: record.texts.how.clone(),
            style: record.texts.style.clone(),
            id: record.id,
            name: record.name.clone(),
            description: record.description.clone(),
            tags: self.bundle.tags(handle).to_vec(),
            studio: record.studio().map(str::to_string),
            cost: record.meta.cost,
            period: record.meta.period.clone(),
            link: record.meta.link.clone(),
        }
    }
}

impl std::fmt::Debug for FusedSearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusedSearchEngine")
            .field("records", &self.bundle.len())
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::{EncoderSpec, HashingEncoder},
        factor::{ExtractedFactors, FactorWeights},
        record::{RecordMeta, StoredRecord},
        vector::norm,
    };

    const SENTENCE_DIM: usize = 64;
    const WORD_DIM: usize = 32;

    fn factors(desc: &str, what: &str, how: &str, style: &str) -> PerFactor<String> {
        ExtractedFactors {
            desc: desc.to_string(),
            what: what.to_string(),
            how: how.to_string(),
            style: style.to_string(),
        }
        .into_texts()
    }

    fn engine_with(
        entries: &[(i64, Option<&str>, PerFactor<String>)],
        weights: FactorWeights,
    ) -> FusedSearchEngine {
        let encoder = HashingEncoder::new(SENTENCE_DIM, WORD_DIM).unwrap();
        let dims = factor_dims(&encoder).unwrap();

        let mut rows: PerFactor<Vec<Vec<f32>>> = PerFactor::default();
        let mut records = Vec::new();
        for (id, studio, texts) in entries {
            let vectors = encode_factors(&encoder, texts, &dims).unwrap();
            for f in FACTOR_ORDER {
                rows[f].push(vectors[f].clone());
            }
            records.push(StoredRecord {
                id: *id,
                name: format!("portfolio {id}"),
                description: String::new(),
                meta: RecordMeta {
                    studio: studio.map(str::to_string),
                    ..Default::default()
                },
                texts: texts.clone(),
            });
        }
        let matrices = rows.map(|f, r| Matrix::from_rows(dims[f], r).unwrap());
        let tags = vec![Vec::new(); records.len()];
        let spec = EncoderSpec::Hashing {
            sentence_dim: SENTENCE_DIM,
            word_dim: WORD_DIM,
        };
        let bundle = ArtifactBundle::assemble(matrices, records, tags, weights, spec).unwrap();
        FusedSearchEngine::new(bundle, Box::new(encoder), SearchTuning::default()).unwrap()
    }

    fn corpus() -> Vec<(i64, Option<&'static str>, PerFactor<String>)> {
        vec![
            (1, Some("North"), factors("calm skincare film", "cosmetics", "video", "minimal")),
            (2, Some("South"), factors("energetic sneaker launch", "shoes", "video", "dynamic")),
            (3, Some("North"), factors("family dinner table", "food", "photo", "warm")),
            (4, None, factors("city night drive", "cars", "video", "cinematic")),
            (5, Some("  "), factors("summer drink splash", "beverage", "animation", "bright")),
        ]
    }

    #[test]
    fn results_sorted_and_sized() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let query = factors("calm skincare video", "cosmetics", "video", "minimal");
        let opts = SearchOptions {
            k: 3,
            min_candidates: 0,
            ..Default::default()
        };
        let out = engine.search(&query, &opts).unwrap();

        assert_eq!(out.results.len(), 3.min(out.candidate_size));
        assert!(out.candidate_size <= engine.corpus_size());
        for pair in out.results.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
        assert_eq!(out.results[0].id, 1);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let same = factors("same brief", "same", "same", "same");
        let entries = vec![
            (30, None, same.clone()),
            (10, None, same.clone()),
            (20, None, same.clone()),
        ];
        let engine = engine_with(&entries, FactorWeights::uniform(1.0));
        let out = engine.search(&same, &SearchOptions::default()).unwrap();
        let ids: Vec<i64> = out.results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);

        // candidate cut at k: the tie must still resolve to the lowest id
        let narrow = SearchOptions {
            k: 1,
            min_candidates: 0,
            ..Default::default()
        };
        let out = engine.search(&same, &narrow).unwrap();
        assert_eq!(out.candidate_size, 1);
        assert_eq!(out.results[0].id, 10);
    }

    #[test]
    fn final_score_is_weighted_factor_sum() {
        let mut weights = FactorWeights::uniform(0.5);
        weights.style = 2.0;
        let engine = engine_with(&corpus(), weights);
        let query = factors("night drive", "cars", "video", "cinematic");
        let out = engine.search(&query, &SearchOptions::default()).unwrap();
        for r in &out.results {
            let expected = 0.5 * (r.full_score + r.desc_score + r.what_score + r.how_score)
                + 2.0 * r.style_score;
            assert!((r.final_score - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn k_is_clamped_to_corpus() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let query = factors("anything", "thing", "video", "any");

        let big = SearchOptions {
            k: 100,
            ..Default::default()
        };
        assert_eq!(engine.search(&query, &big).unwrap().results.len(), 5);

        let zero = SearchOptions {
            k: 0,
            min_candidates: 0,
            ..Default::default()
        };
        assert_eq!(engine.search(&query, &zero).unwrap().results.len(), 1);
    }

    #[test]
    fn empty_query_text_scores_zero() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let empty = PerFactor::from_fn(|_| String::new());
        let out = engine.search(&empty, &SearchOptions::default()).unwrap();
        assert_eq!(out.results.len(), 5);
        assert!(out.results.iter().all(|r| r.final_score == 0.0));
    }

    #[test]
    fn diversity_returns_distinct_records() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let query = factors("calm skincare video", "cosmetics", "video", "minimal");
        let opts = SearchOptions {
            k: 4,
            diversity: true,
            ..Default::default()
        };
        let out = engine.search(&query, &opts).unwrap();
        assert_eq!(out.results.len(), 4);
        assert_eq!(out.results[0].id, 1);
        let mut ids: Vec<i64> = out.results.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn diversity_embedding_ignores_what() {
        let base = factors("calm skincare film", "cosmetics", "video", "minimal");
        let mut renamed = base.clone();
        renamed.what = "automobile".to_string();
        let other = factors("family dinner table", "food", "photo", "warm");
        let engine = engine_with(
            &[(1, None, base), (2, None, renamed), (3, None, other)],
            FactorWeights::uniform(1.0),
        );

        let handles = [RecordHandle(0), RecordHandle(1), RecordHandle(2)];
        let emb = engine.diversity_embeddings(&handles).unwrap();
        assert_eq!(emb.dim(), SENTENCE_DIM);
        for row in 0..3 {
            assert!((norm(emb.row(row)) - 1.0).abs() < 1e-5);
        }
        assert!((dot(emb.row(0), emb.row(1)) - 1.0).abs() < 1e-5);
        assert!(dot(emb.row(0), emb.row(2)) < 0.5);

        // records differing only in `what` are fully redundant to MMR
        let picks = mmr_rerank(&emb, &[1.0, 0.95, 0.9], 2, DEFAULT_LAMBDA);
        assert_eq!(picks, vec![0, 2]);
    }

    #[test]
    fn studio_stats_cover_candidates() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let query = factors("film", "cosmetics", "video", "minimal");
        let opts = SearchOptions {
            k: 1,
            want_studio_stats: true,
            ..Default::default()
        };
        let out = engine.search(&query, &opts).unwrap();
        let stats = out.studio_stats.unwrap();
        assert_eq!(out.candidate_size, 5);
        assert_eq!(stats[0].name, "North");
        assert_eq!(stats[0].count, 2);
        assert!(stats.iter().map(|s| s.count).sum::<usize>() <= out.candidate_size);
        assert!(stats.iter().map(|s| s.ratio).sum::<f64>() <= 1.0 + 1e-9);
    }

    #[test]
    fn empty_corpus_returns_nothing() {
        let engine = engine_with(&[], FactorWeights::uniform(1.0));
        let query = factors("a", "b", "c", "d");
        let out = engine.search(&query, &SearchOptions::default()).unwrap();
        assert!(out.results.is_empty());
        assert_eq!(out.candidate_size, 0);
    }

    #[test]
    fn candidate_width_rules() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        // plain: max(k, min_candidates), clamped to n
        assert_eq!(engine.candidate_width(2, false, 0, 1000), 2);
        assert_eq!(engine.candidate_width(2, false, 30, 1000), 30);
        assert_eq!(engine.candidate_width(2, false, 30, 7), 7);
        // diversity: max(k * alpha, min_cands, min_candidates)
        assert_eq!(engine.candidate_width(5, true, 0, 1000), 20);
        assert_eq!(engine.candidate_width(1, true, 0, 1000), 10);
        assert_eq!(engine.candidate_width(5, true, 40, 1000), 40);
        // capped, but never below k
        assert_eq!(engine.candidate_width(200, true, 0, 10_000), 500);
        assert_eq!(engine.candidate_width(600, false, 0, 10_000), 600);
        assert_eq!(engine.candidate_width(3, false, 0, 0), 0);
    }

    #[test]
    fn encoder_dimension_mismatch_is_fatal() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let bundle = engine.bundle().clone();
        let other = HashingEncoder::new(SENTENCE_DIM * 2, WORD_DIM).unwrap();
        let err = FusedSearchEngine::new(bundle, Box::new(other), SearchTuning::default()).unwrap_err();
        assert!(matches!(err, Error::ArtifactUnavailable { .. }));
    }

    #[test]
    fn probe_hits_one_factor() {
        let engine = engine_with(&corpus(), FactorWeights::uniform(1.0));
        let hits = engine.probe(Factor::What, "shoes", 2).unwrap();
        assert_eq!(hits[0].id, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }
}
