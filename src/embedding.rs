use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    factor::{Factor, PerFactor, Space},
    model_manager::ColbertEncoder,
    vector::{mean_of, normalized},
};

/// Sentence and word vector encoding. Deterministic for a fixed model.
pub trait EmbeddingProvider: Send + Sync {
    /// Output dimension of [`EmbeddingProvider::encode_sentence`].
    fn sentence_dim(&self) -> Result<usize>;

    /// Output dimension of [`EmbeddingProvider::encode_word`].
    fn word_dim(&self) -> usize;

    fn encode_sentence(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector for a single token. Unknown tokens map to the zero vector.
    fn encode_word(&self, token: &str) -> Result<Vec<f32>>;
}

/// Per-factor output dimensions for `provider`.
pub fn factor_dims(provider: &dyn EmbeddingProvider) -> Result<PerFactor<usize>> {
    let sentence = provider.sentence_dim()?;
    let word = provider.word_dim();
    Ok(PerFactor::from_fn(|f| match f.space() {
        Space::Sentence => sentence,
        Space::Word => word,
    }))
}

/// Encode one factor text into an L2-normalized vector.
///
/// Empty text yields the zero vector. The `what` factor is the mean of its
/// whitespace-separated token vectors; the rest go through the sentence
/// encoder.
pub fn encode_factor(
    provider: &dyn EmbeddingProvider,
    factor: Factor,
    text: &str,
    dim: usize,
) -> Result<Vec<f32>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(vec![0.0; dim]);
    }

    let raw = match factor.space() {
        Space::Sentence => provider.encode_sentence(text)?,
        Space::Word => {
            let tokens = text
                .split_whitespace()
                .map(|t| provider.encode_word(t))
                .collect::<Result<Vec<_>>>()?;
            if let Some(bad) = tokens.iter().find(|v| v.len() != dim) {
                return Err(dim_mismatch(factor, dim, bad.len()));
            }
            mean_of(dim, tokens.iter().map(Vec::as_slice))
                .unwrap_or_else(|| vec![0.0; dim])
        }
    };

    if raw.len() != dim {
        return Err(dim_mismatch(factor, dim, raw.len()));
    }
    Ok(normalized(raw))
}

/// Encode all five factor texts.
pub fn encode_factors(
    provider: &dyn EmbeddingProvider,
    texts: &PerFactor<String>,
    dims: &PerFactor<usize>,
) -> Result<PerFactor<Vec<f32>>> {
    PerFactor::try_from_fn(|f| encode_factor(provider, f, &texts[f], dims[f]))
}

fn dim_mismatch(factor: Factor, expected: usize, got: usize) -> Error {
    Error::Model(format!(
        "{factor} encoder returned a {got}-dimensional vector, expected {expected}"
    ))
}

/// Which encoder produced an artifact bundle. Persisted in the manifest so
/// queries are embedded exactly as the corpus was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EncoderSpec {
    Hashing {
        sentence_dim: usize,
        word_dim: usize,
    },
    Colbert {
        model_id: String,
        word_vectors: PathBuf,
    },
}

impl EncoderSpec {
    pub fn hashing_default() -> Self {
        Self::Hashing {
            sentence_dim: HashingEncoder::DEFAULT_SENTENCE_DIM,
            word_dim: HashingEncoder::DEFAULT_WORD_DIM,
        }
    }

    pub fn instantiate(&self) -> Result<Box<dyn EmbeddingProvider>> {
        match self {
            Self::Hashing {
                sentence_dim,
                word_dim,
            } => Ok(Box::new(HashingEncoder::new(*sentence_dim, *word_dim)?)),
            Self::Colbert {
                model_id,
                word_vectors,
            } => Ok(Box::new(ColbertEncoder::open(
                model_id.clone(),
                word_vectors,
            )?)),
        }
    }
}

/// Feature-hashing encoder.
///
/// Sentences hash lowercased unigrams and bigrams into signed buckets;
/// words hash their boundary-marked character trigrams, so related word
/// forms share components. Needs no model download.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    sentence_dim: usize,
    word_dim: usize,
}

impl HashingEncoder {
    pub const DEFAULT_SENTENCE_DIM: usize = 384;
    pub const DEFAULT_WORD_DIM: usize = 100;

    pub fn new(sentence_dim: usize, word_dim: usize) -> Result<Self> {
        if sentence_dim == 0 || word_dim == 0 {
            return Err(Error::Config(
                "hashing encoder dimensions must be positive".to_string(),
            ));
        }
        Ok(Self {
            sentence_dim,
            word_dim,
        })
    }

    fn bump(out: &mut [f32], feature: &str) {
        let h = fnv1a(feature.as_bytes());
        let slot = (h % out.len() as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        out[slot] += sign;
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self {
            sentence_dim: Self::DEFAULT_SENTENCE_DIM,
            word_dim: Self::DEFAULT_WORD_DIM,
        }
    }
}

impl EmbeddingProvider for HashingEncoder {
    fn sentence_dim(&self) -> Result<usize> {
        Ok(self.sentence_dim)
    }

    fn word_dim(&self) -> usize {
        self.word_dim
    }

    fn encode_sentence(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.sentence_dim];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        for token in &tokens {
            Self::bump(&mut out, token);
        }
        for pair in tokens.windows(2) {
            Self::bump(&mut out, &format!("{} {}", pair[0], pair[1]));
        }
        Ok(out)
    }

    fn encode_word(&self, token: &str) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.word_dim];
        let marked: Vec<char> = format!("<{}>", token.to_lowercase()).chars().collect();
        Self::bump(&mut out, &marked.iter().collect::<String>());
        for gram in marked.windows(3) {
            Self::bump(&mut out, &gram.iter().collect::<String>());
        }
        Ok(out)
    }
}

/// 64-bit FNV-1a; stable across builds, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes
        .iter()
        .fold(OFFSET, |h, &b| (h ^ u64::from(b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{dot, norm};

    fn encoder() -> HashingEncoder {
        HashingEncoder::new(64, 32).unwrap()
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let enc = encoder();
        for f in crate::factor::FACTOR_ORDER {
            let dim = if f == Factor::What { 32 } else { 64 };
            let v = encode_factor(&enc, f, "   ", dim).unwrap();
            assert_eq!(v.len(), dim);
            assert!(v.iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn factor_vectors_are_unit_norm() {
        let enc = encoder();
        let v = encode_factor(&enc, Factor::Desc, "bright summer drink film", 64)
            .unwrap();
        assert!((norm(&v) - 1.0).abs() < 1e-5);
        let w = encode_factor(&enc, Factor::What, "beverage drink", 32).unwrap();
        assert!((norm(&w) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn encoding_is_deterministic() {
        let enc = encoder();
        let a = enc.encode_sentence("Minimal skincare campaign").unwrap();
        let b = enc.encode_sentence("minimal skincare campaign").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn related_words_share_components() {
        let enc = encoder();
        let a = encode_factor(&enc, Factor::What, "cosmetics", 32).unwrap();
        let b = encode_factor(&enc, Factor::What, "cosmetic", 32).unwrap();
        let c = encode_factor(&enc, Factor::What, "automobile", 32).unwrap();
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[test]
    fn word_factor_averages_tokens() {
        let enc = encoder();
        let single = encode_factor(&enc, Factor::What, "food", 32).unwrap();
        let repeated = encode_factor(&enc, Factor::What, "food food", 32).unwrap();
        for (a, b) in single.iter().zip(&repeated) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn wrong_dimension_is_an_error() {
        let enc = encoder();
        assert!(matches!(
            encode_factor(&enc, Factor::How, "video", 10),
            Err(Error::Model(_))
        ));
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = EncoderSpec::hashing_default();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"hashing\""));
        let back: EncoderSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        let provider = back.instantiate().unwrap();
        assert_eq!(provider.sentence_dim().unwrap(), 384);
        assert_eq!(provider.word_dim(), 100);
    }

    #[test]
    fn factor_dims_split_by_space() {
        let dims = factor_dims(&encoder()).unwrap();
        assert_eq!(dims.what, 32);
        assert_eq!(dims.full, 64);
        assert_eq!(dims.style, 64);
    }
}
