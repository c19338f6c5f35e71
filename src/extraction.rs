use std::{sync::Mutex, time::Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    chat::{ChatProvider, ProviderError},
    error::{Error, Result},
    factor::ExtractedFactors,
    rate_limiter::RateLimiter,
};

/// Instruction sent with every extraction call.
pub const SYSTEM_PROMPT: &str = "You are an advertising expert. From the user's \
input, extract the following four items:\n\
1) desc: a one-sentence summary of the requested ad. Do not include brand or product names.\n\
2) what: one word naming what is being advertised, as a mid-level category, never a brand.\n\
3) how: one word naming the medium, tool or format of the ad.\n\
4) style: one word naming the tone or style of the ad.\n\n\
Never include brand, company or product names. Reply only in this format:\n\
{\"desc\": \"...\", \"what\": \"...\", \"how\": \"...\", \"style\": \"...\"}";

/// Turns free text into `{desc, what, how, style}` through a chat provider.
///
/// Malformed replies and transport failures are retried up to
/// `max_attempts` times and then degrade to empty factors. Quota
/// exhaustion is returned immediately as [`Error::QuotaExceeded`].
pub struct FactorExtractor {
    provider: Box<dyn ChatProvider>,
    limiter: Mutex<RateLimiter>,
    max_attempts: usize,
}

impl FactorExtractor {
    pub fn new(
        provider: Box<dyn ChatProvider>,
        limiter: RateLimiter,
        max_attempts: usize,
    ) -> Self {
        debug!(
            provider = provider.name(),
            rpm = limiter.requests_per_minute(),
            max_attempts,
            "extractor configured"
        );
        Self {
            provider,
            limiter: Mutex::new(limiter),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn extract(&self, text: &str) -> Result<ExtractedFactors> {
        let provider = self.provider.name();

        for attempt in 1..=self.max_attempts {
            self.limiter
                .lock()
                .map_err(|_| Error::Config("rate limiter lock poisoned".to_string()))?
                .acquire();

            let start = Instant::now();
            let outcome = self.provider.chat(SYSTEM_PROMPT, text);
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            let failure = match outcome {
                Ok(reply) => {
                    info!(provider, attempt, elapsed_ms, "extraction call finished");
                    debug!(provider, reply = %reply, "extraction reply");
                    match parse_factors(&reply) {
                        Some(factors) => return Ok(factors),
                        None => "reply did not contain a JSON object".to_string(),
                    }
                }
                Err(ProviderError::QuotaExhausted { provider, detail }) => {
                    error!(provider, %detail, "extraction quota exhausted");
                    return Err(Error::QuotaExceeded { provider, detail });
                }
                Err(e) => e.to_string(),
            };

            warn!(
                provider,
                attempt,
                max_attempts = self.max_attempts,
                error = %failure,
                "extraction attempt failed"
            );
        }

        error!(
            provider,
            max_attempts = self.max_attempts,
            "extraction retries exhausted, using empty factors"
        );
        Ok(ExtractedFactors::default())
    }
}

impl std::fmt::Debug for FactorExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorExtractor")
            .field("provider", &self.provider.name())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Pull the factor object out of a model reply.
///
/// A fenced code block is unwrapped first. If the remaining text is not a
/// JSON object, the first balanced `{...}` span is tried instead. Missing
/// keys become empty strings; non-string values are stringified.
pub fn parse_factors(reply: &str) -> Option<ExtractedFactors> {
    let body = unfence(reply).unwrap_or(reply).trim();

    let object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => match first_object(body).map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(map))) => map,
            _ => return None,
        },
    };

    let field = |key: &str| match object.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    Some(ExtractedFactors {
        desc: field("desc"),
        what: field("what"),
        how: field("how"),
        style: field("style"),
    })
}

/// Contents of the first ```` ``` ```` block, minus an optional `json` tag.
fn unfence(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let end = rest.find("```")?;
    let inner = &rest[..end];
    Some(inner.strip_prefix("json").unwrap_or(inner))
}

/// First brace-balanced span, skipping braces inside string literals.
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
