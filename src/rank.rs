use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::Settings,
    engine::{FusedSearchEngine, RankedResult, SearchOptions},
    error::{Error, Result},
    extraction::FactorExtractor,
    factor::ExtractedFactors,
    studio_stats::StudioStat,
};

/// Answer to a rank query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RankResponse {
    /// Factors the query was ranked with.
    pub generated: ExtractedFactors,
    pub results: Vec<RankedResult>,
    pub top_studios: Vec<StudioStat>,
    pub candidate_size: usize,
}

/// Limits applied to every rank request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankLimits {
    pub default_limit: usize,
    pub max_limit: usize,
    pub min_candidates: usize,
    pub top_studio_k: usize,
}

impl Default for RankLimits {
    fn default() -> Self {
        Self {
            default_limit: 5,
            max_limit: 50,
            min_candidates: 30,
            top_studio_k: 5,
        }
    }
}

impl From<&Settings> for RankLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            default_limit: settings.default_limit,
            max_limit: settings.max_limit,
            min_candidates: settings.min_candidates,
            top_studio_k: settings.top_studio_k,
        }
    }
}

/// The query operation: brief or factors in, ranked portfolios and top
/// studios out.
///
/// Built once at startup and shared by reference.
pub struct RankService {
    engine: FusedSearchEngine,
    extractor: Option<FactorExtractor>,
    limits: RankLimits,
}

impl RankService {
    pub fn new(
        engine: FusedSearchEngine,
        extractor: Option<FactorExtractor>,
        limits: RankLimits,
    ) -> Self {
        Self {
            engine,
            extractor,
            limits,
        }
    }

    pub fn engine(&self) -> &FusedSearchEngine {
        &self.engine
    }

    pub fn limits(&self) -> &RankLimits {
        &self.limits
    }

    /// Turn a requested limit into a result count.
    ///
    /// Missing, non-integer or non-positive limits become the default limit.
    /// Anything above the maximum is clamped.
    pub fn resolve_limit(&self, requested: Option<&Value>) -> usize {
        let limit = match requested {
            None | Some(Value::Null) => self.limits.default_limit,
            Some(value) => match value.as_i64() {
                Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
                _ => {
                    warn!(
                        limit = %value,
                        default = self.limits.default_limit,
                        "invalid limit, using default"
                    );
                    self.limits.default_limit
                }
            },
        };
        limit.min(self.limits.max_limit).max(1)
    }

    /// Extract factors from a brief.
    pub fn extract(&self, brief: &str) -> Result<ExtractedFactors> {
        let extractor = self.extractor.as_ref().ok_or_else(|| {
            Error::Config("no extraction provider is configured".to_string())
        })?;
        extractor.extract(brief)
    }

    /// Extract factors from `brief`, then rank with them.
    pub fn rank_brief(
        &self,
        brief: &str,
        limit: Option<&Value>,
        diversity: bool,
    ) -> Result<RankResponse> {
        let factors = self.extract(brief)?;
        debug!(?factors, "brief factors");
        self.rank_factors(factors, limit, diversity)
    }

    /// Rank with already extracted factors.
    pub fn rank_factors(
        &self,
        factors: ExtractedFactors,
        limit: Option<&Value>,
        diversity: bool,
    ) -> Result<RankResponse> {
        let opts = SearchOptions {
            k: self.resolve_limit(limit),
            diversity,
            min_candidates: self.limits.min_candidates,
            want_studio_stats: true,
            top_studio_k: self.limits.top_studio_k.max(1),
        };
        let outcome = self.engine.search(&factors.clone().into_texts(), &opts)?;

        Ok(RankResponse {
            generated: factors,
            results: outcome.results,
            top_studios: outcome.studio_stats.unwrap_or_default(),
            candidate_size: outcome.candidate_size,
        })
    }
}

impl std::fmt::Debug for RankService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankService")
            .field("engine", &self.engine)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
