use std::{str::FromStr, time::Duration};

use serde::Serialize;
use tracing::debug;

use crate::{
    chat::{ChatBackend, GeminiClient, OllamaClient, ProviderKind},
    config_db::ConfigDb,
    engine::SearchTuning,
    error::{Error, Result},
    extraction::FactorExtractor,
    factor::{Factor, FactorWeights},
    mmr::DEFAULT_LAMBDA,
    rate_limiter::RateLimiter,
};

/// Environment variable prefix for overrides, e.g. `BRIEFMATCH_MAX_LIMIT`.
pub const ENV_PREFIX: &str = "BRIEFMATCH_";

/// Secret key that is read from the environment only.
const API_KEY: &str = "gemini_api_key";

/// Every recognized setting key, in display order.
pub const KEYS: &[&str] = &[
    "full_weight",
    "desc_weight",
    "what_weight",
    "how_weight",
    "style_weight",
    "candidate_alpha",
    "min_cands",
    "max_candidates",
    "min_candidates",
    "top_studio_k",
    "default_limit",
    "max_limit",
    "requests_per_minute",
    "max_retries",
    "mmr_lambda",
    "llm_provider",
    "gemini_model",
    "gemini_api_url",
    API_KEY,
    "ollama_model",
    "ollama_url",
    "request_timeout_secs",
];

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub weights: FactorWeights,
    pub candidate_alpha: usize,
    pub min_cands: usize,
    pub max_candidates: usize,
    pub min_candidates: usize,
    pub top_studio_k: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    pub requests_per_minute: usize,
    pub max_retries: usize,
    pub mmr_lambda: f32,
    pub llm_provider: ProviderKind,
    pub gemini_model: String,
    pub gemini_api_url: String,
    #[serde(skip)]
    pub gemini_api_key: Option<String>,
    pub ollama_model: String,
    pub ollama_url: String,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            weights: FactorWeights::uniform(1.0),
            candidate_alpha: 4,
            min_cands: 10,
            max_candidates: 500,
            min_candidates: 30,
            top_studio_k: 5,
            default_limit: 5,
            max_limit: 50,
            requests_per_minute: 15,
            max_retries: 3,
            mmr_lambda: DEFAULT_LAMBDA,
            llm_provider: ProviderKind::Gemini,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_api_url: "https://generativelanguage.googleapis.com".to_string(),
            gemini_api_key: None,
            ollama_model: "llama3.1".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 60,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("invalid value for {key}: {value:?}"))
    })
}

fn weight_factor(key: &str) -> Option<Factor> {
    key.strip_suffix("_weight").and_then(|f| f.parse().ok())
}

impl Settings {
    /// Defaults, then the settings table, then `BRIEFMATCH_*` variables.
    pub fn resolve(db: Option<&ConfigDb>) -> Result<Self> {
        Self::resolve_with(db, |name| std::env::var(name).ok())
    }

    /// [`Settings::resolve`] with an injectable environment lookup.
    pub fn resolve_with(
        db: Option<&ConfigDb>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(db) = db {
            for (key, value) in db.list_settings()? {
                if key == API_KEY || !KEYS.contains(&key.as_str()) {
                    debug!(key = %key, "ignoring stored setting");
                    continue;
                }
                settings.apply(&key, &value)?;
            }
        }

        for key in KEYS {
            let name = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = env(&name) {
                settings.apply(key, &value)?;
            }
        }
        if settings.gemini_api_key.is_none() {
            settings.gemini_api_key = env("GEMINI_API_KEY");
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Set one key from its string form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(factor) = weight_factor(key) {
            self.weights[factor] = parse(key, value)?;
            return Ok(());
        }
        match key {
            "candidate_alpha" => self.candidate_alpha = parse(key, value)?,
            "min_cands" => self.min_cands = parse(key, value)?,
            "max_candidates" => self.max_candidates = parse(key, value)?,
            "min_candidates" => self.min_candidates = parse(key, value)?,
            "top_studio_k" => self.top_studio_k = parse(key, value)?,
            "default_limit" => self.default_limit = parse(key, value)?,
            "max_limit" => self.max_limit = parse(key, value)?,
            "requests_per_minute" => self.requests_per_minute = parse(key, value)?,
            "max_retries" => self.max_retries = parse(key, value)?,
            "mmr_lambda" => self.mmr_lambda = parse(key, value)?,
            "llm_provider" => self.llm_provider = ProviderKind::parse_lenient(value),
            "gemini_model" => self.gemini_model = value.trim().to_string(),
            "gemini_api_url" => self.gemini_api_url = value.trim().to_string(),
            "gemini_api_key" => {
                self.gemini_api_key =
                    Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            "ollama_model" => self.ollama_model = value.trim().to_string(),
            "ollama_url" => self.ollama_url = value.trim().to_string(),
            "request_timeout_secs" => {
                self.request_timeout_secs = parse(key, value)?;
            }
            _ => {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// String form of one key. The API key is redacted.
    pub fn get(&self, key: &str) -> Result<String> {
        if let Some(factor) = weight_factor(key) {
            return Ok(self.weights[factor].to_string());
        }
        Ok(match key {
            "candidate_alpha" => self.candidate_alpha.to_string(),
            "min_cands" => self.min_cands.to_string(),
            "max_candidates" => self.max_candidates.to_string(),
            "min_candidates" => self.min_candidates.to_string(),
            "top_studio_k" => self.top_studio_k.to_string(),
            "default_limit" => self.default_limit.to_string(),
            "max_limit" => self.max_limit.to_string(),
            "requests_per_minute" => self.requests_per_minute.to_string(),
            "max_retries" => self.max_retries.to_string(),
            "mmr_lambda" => self.mmr_lambda.to_string(),
            "llm_provider" => self.llm_provider.to_string(),
            "gemini_model" => self.gemini_model.clone(),
            "gemini_api_url" => self.gemini_api_url.clone(),
            "gemini_api_key" => match self.gemini_api_key {
                Some(_) => "<set>".to_string(),
                None => "<unset>".to_string(),
            },
            "ollama_model" => self.ollama_model.clone(),
            "ollama_url" => self.ollama_url.clone(),
            "request_timeout_secs" => self.request_timeout_secs.to_string(),
            _ => {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.to_string(),
                });
            }
        })
    }

    /// Every key with its current string form.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        KEYS.iter()
            .filter_map(|&key| self.get(key).ok().map(|v| (key, v)))
            .collect()
    }

    /// Check that `key = value` may be written to the settings table.
    pub fn check_persistable(key: &str, value: &str) -> Result<()> {
        if key == API_KEY {
            return Err(Error::Config(format!(
                "{key} is read from {ENV_PREFIX}GEMINI_API_KEY or GEMINI_API_KEY only"
            )));
        }
        let mut probe = Self::default();
        probe.apply(key, value)?;
        probe.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(Error::Config(format!(
                "mmr_lambda must be within [0, 1], got {}",
                self.mmr_lambda
            )));
        }
        if self.max_limit == 0 || self.default_limit == 0 {
            return Err(Error::Config(
                "max_limit and default_limit must be positive".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn search_tuning(&self) -> SearchTuning {
        SearchTuning {
            candidate_alpha: self.candidate_alpha,
            min_cands: self.min_cands,
            max_candidates: self.max_candidates,
            mmr_lambda: self.mmr_lambda,
        }
    }

    /// Build the configured chat backend.
    pub fn chat_backend(&self) -> Result<ChatBackend> {
        let timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(match self.llm_provider {
            ProviderKind::Gemini => {
                let key = self.gemini_api_key.as_deref().ok_or_else(|| {
                    Error::Config(format!(
                        "gemini provider needs {ENV_PREFIX}GEMINI_API_KEY or GEMINI_API_KEY"
                    ))
                })?;
                ChatBackend::Gemini(GeminiClient::new(
                    &self.gemini_api_url,
                    &self.gemini_model,
                    key,
                    timeout,
                )?)
            }
            ProviderKind::Ollama => ChatBackend::Ollama(OllamaClient::new(
                &self.ollama_url,
                &self.ollama_model,
                timeout,
            )?),
        })
    }

    /// Factor extractor over the configured backend and rate limit.
    pub fn extractor(&self) -> Result<FactorExtractor> {
        Ok(FactorExtractor::new(
            Box::new(self.chat_backend()?),
            RateLimiter::new(self.requests_per_minute),
            self.max_retries,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::resolve_with(None, env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.max_limit, 50);
        assert_eq!(settings.mmr_lambda, 0.7);
    }

    #[test]
    fn env_overrides_database() {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        db.set_setting("max_limit", "20").unwrap();
        db.set_setting("desc_weight", "2.5").unwrap();
        db.set_setting("llm_provider", "ollama").unwrap();

        let settings = Settings::resolve_with(
            Some(&db),
            env(&[("BRIEFMATCH_MAX_LIMIT", "10")]),
        )
        .unwrap();
        assert_eq!(settings.max_limit, 10);
        assert_eq!(settings.weights.desc, 2.5);
        assert_eq!(settings.llm_provider, ProviderKind::Ollama);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let bad = [
            ("BRIEFMATCH_MMR_LAMBDA", "1.5"),
            ("BRIEFMATCH_HOW_WEIGHT", "-1"),
            ("BRIEFMATCH_MAX_LIMIT", "many"),
        ];
        for pair in bad {
            let err = Settings::resolve_with(None, env(&[pair])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{pair:?}: {err}");
        }
    }

    #[test]
    fn unknown_provider_falls_back_to_gemini() {
        let settings = Settings::resolve_with(
            None,
            env(&[("BRIEFMATCH_LLM_PROVIDER", "openai")]),
        )
        .unwrap();
        assert_eq!(settings.llm_provider, ProviderKind::Gemini);
    }

    #[test]
    fn api_key_never_persisted_or_shown() {
        assert!(Settings::check_persistable(API_KEY, "secret").is_err());
        assert!(Settings::check_persistable("max_limit", "10").is_ok());
        assert!(Settings::check_persistable("mmr_lambda", "2").is_err());
        assert!(matches!(
            Settings::check_persistable("colour", "red"),
            Err(Error::NotFound { .. })
        ));

        let settings =
            Settings::resolve_with(None, env(&[("GEMINI_API_KEY", "secret")]))
                .unwrap();
        assert_eq!(settings.gemini_api_key.as_deref(), Some("secret"));
        assert_eq!(settings.get(API_KEY).unwrap(), "<set>");
        assert!(serde_json::to_string(&settings).unwrap().find("secret").is_none());
    }

    #[test]
    fn gemini_without_key_is_config_error() {
        let settings = Settings::default();
        assert!(matches!(settings.chat_backend(), Err(Error::Config(_))));
    }

    #[test]
    fn entries_cover_every_key() {
        let entries = Settings::default().entries();
        assert_eq!(entries.len(), KEYS.len());
        assert_eq!(entries[0], ("full_weight", "1".to_string()));
    }
}
