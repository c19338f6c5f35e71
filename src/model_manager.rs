use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    path::Path,
    sync::{Mutex, OnceLock},
};

use candle_core::Device;
use pylate_rs::ColBERT;
use tracing::info;

use crate::{
    embedding::EmbeddingProvider,
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "BRIEFMATCH_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Manages the ColBERT model lifecycle, supporting lazy loading on first use.
///
/// Token embeddings are mean-pooled into one sentence vector.
pub struct ModelManager {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
    dim: OnceLock<usize>,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a new `ModelManager`. The model ID is resolved from:
    /// 1. The `BRIEFMATCH_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`lightonai/GTE-ModernColBERT-v1`)
    ///
    /// The model is not loaded until the first encode call.
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    /// Creates a `ModelManager` with an explicit model ID, bypassing
    /// environment variable resolution.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
            dim: OnceLock::new(),
        }
    }

    /// Returns the model ID that will be (or has been) loaded.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Encodes one text into a mean-pooled sentence vector.
    pub fn encode_sentence(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| Error::Model("model lock poisoned".to_string()))?;

        if guard.is_none() {
            info!(model = %self.model_id, "loading sentence model");
            let builder = ColBERT::from(&self.model_id).with_device(default_device());
            let loaded: std::result::Result<ColBERT, _> = builder.try_into();
            *guard = Some(loaded.map_err(|e| {
                Error::Model(format!("failed to load {}: {e}", self.model_id))
            })?);
        }
        let Some(model) = guard.as_mut() else {
            return Err(Error::Model("model not loaded".to_string()));
        };

        // [1, T, D] -> [T, D] -> [D]
        let embeddings = model
            .encode(&[text.to_string()], false)
            .map_err(|e| Error::Model(format!("encode failed: {e}")))?;
        let pooled = embeddings
            .squeeze(0)
            .and_then(|t| t.mean(0))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(map_candle_err)?;
        Ok(pooled)
    }

    /// Output dimension, probing the model once if needed.
    pub fn dimension(&self) -> Result<usize> {
        if let Some(dim) = self.dim.get() {
            return Ok(*dim);
        }
        let dim = self.encode_sentence("dimension probe")?.len();
        Ok(*self.dim.get_or_init(|| dim))
    }
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Model(format!("tensor computation error: {e}"))
}

/// Static word vectors loaded from a word2vec / fastText `.vec` text file.
///
/// Lines are `token v1 v2 ... vD`; an optional `count dim` header line is
/// skipped.
#[derive(Debug, Clone)]
pub struct WordVectors {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl WordVectors {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Config(format!(
                "cannot open word vectors {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(BufReader::new(file))
    }

    pub fn parse(reader: impl BufRead) -> Result<Self> {
        let mut dim: Option<usize> = None;
        let mut vectors = HashMap::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(token) = parts.next() else {
                continue;
            };
            let values = match parts
                .map(str::parse::<f32>)
                .collect::<std::result::Result<Vec<_>, _>>()
            {
                Ok(v) => v,
                Err(_) => {
                    return Err(Error::Config(format!(
                        "word vectors line {}: non-numeric component",
                        line_no + 1
                    )));
                }
            };

            // `count dim` header
            if line_no == 0 && values.len() == 1 && token.parse::<usize>().is_ok() {
                dim = Some(values[0] as usize);
                continue;
            }

            let expected = *dim.get_or_insert(values.len());
            if values.len() != expected || expected == 0 {
                return Err(Error::Config(format!(
                    "word vectors line {}: expected {expected} components, got {}",
                    line_no + 1,
                    values.len()
                )));
            }
            vectors.insert(token.to_string(), values);
        }

        let dim = dim
            .filter(|d| *d > 0)
            .ok_or_else(|| Error::Config("word vectors file is empty".to_string()))?;
        Ok(Self { dim, vectors })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Exact match first, then the lowercased token.
    pub fn get(&self, token: &str) -> Option<&[f32]> {
        self.vectors
            .get(token)
            .or_else(|| self.vectors.get(&token.to_lowercase()))
            .map(Vec::as_slice)
    }
}

/// ColBERT sentence vectors plus static word vectors.
pub struct ColbertEncoder {
    sentences: ModelManager,
    words: WordVectors,
}

impl ColbertEncoder {
    pub fn open(model_id: String, word_vectors: &Path) -> Result<Self> {
        let words = WordVectors::load(word_vectors)?;
        info!(
            tokens = words.len(),
            dim = words.dim(),
            "loaded word vectors"
        );
        Ok(Self {
            sentences: ModelManager::with_model_id(model_id),
            words,
        })
    }
}

impl EmbeddingProvider for ColbertEncoder {
    fn sentence_dim(&self) -> Result<usize> {
        self.sentences.dimension()
    }

    fn word_dim(&self) -> usize {
        self.words.dim()
    }

    fn encode_sentence(&self, text: &str) -> Result<Vec<f32>> {
        self.sentences.encode_sentence(text)
    }

    fn encode_word(&self, token: &str) -> Result<Vec<f32>> {
        Ok(self
            .words
            .get(token)
            .map(<[f32]>::to_vec)
            .unwrap_or_else(|| vec![0.0; self.words.dim()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::with_model_id("custom/model".to_string());
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn with_model_id_not_loaded_by_default() {
        let manager = ModelManager::with_model_id(DEFAULT_MODEL_ID.to_string());
        assert!(!manager.is_loaded());
        assert_eq!(manager.model_id(), DEFAULT_MODEL_ID);
    }

    #[test]
    fn parses_vec_file_with_header() {
        let text = "2 3\ncoffee 1.0 0.0 0.0\nCar 0.0 1.0 0.5\n";
        let wv = WordVectors::parse(text.as_bytes()).unwrap();
        assert_eq!(wv.dim(), 3);
        assert_eq!(wv.len(), 2);
        assert_eq!(wv.get("coffee"), Some(&[1.0, 0.0, 0.0][..]));
        assert!(wv.get("car").is_none());
        assert!(wv.get("Car").is_some());
    }

    #[test]
    fn lowercase_fallback() {
        let wv = WordVectors::parse("coffee 1.0 2.0\n".as_bytes()).unwrap();
        assert_eq!(wv.dim(), 2);
        assert_eq!(wv.get("Coffee"), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn ragged_rows_rejected() {
        let text = "a 1.0 2.0\nb 1.0\n";
        assert!(matches!(
            WordVectors::parse(text.as_bytes()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_file_rejected() {
        assert!(WordVectors::parse("".as_bytes()).is_err());
    }

    #[test]
    fn unknown_word_maps_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("words.vec");
        std::fs::write(&path, "video 0.5 0.5\n").unwrap();
        let enc = ColbertEncoder::open(DEFAULT_MODEL_ID.to_string(), &path).unwrap();
        assert_eq!(enc.word_dim(), 2);
        assert_eq!(enc.encode_word("print").unwrap(), vec![0.0, 0.0]);
        assert_eq!(enc.encode_word("video").unwrap(), vec![0.5, 0.5]);
        assert!(!enc.sentences.is_loaded());
    }
}
