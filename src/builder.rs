use std::path::{Path, PathBuf};

use kdam::{BarExt, tqdm};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    artifact::ArtifactBundle,
    embedding::{EmbeddingProvider, EncoderSpec, encode_factors, factor_dims},
    error::{Error, Result},
    extraction::FactorExtractor,
    factor::{FACTOR_ORDER, FactorWeights, PerFactor},
    record::{PortfolioRecord, StoredRecord},
    vector::Matrix,
};

/// Summary of a finished build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub path: PathBuf,
    pub records: usize,
    pub dims: PerFactor<usize>,
    pub fused_dim: usize,
    /// Records whose extraction degraded to empty factors.
    pub empty_extractions: usize,
}

/// Offline batch build: extract, embed, normalize, fuse, persist.
///
/// All-or-nothing: a quota failure or an encoding error aborts the batch
/// before anything is written.
pub struct FusionIndexBuilder<'a> {
    extractor: &'a FactorExtractor,
    encoder: &'a dyn EmbeddingProvider,
    encoder_spec: EncoderSpec,
    weights: FactorWeights,
    progress: bool,
}

impl<'a> FusionIndexBuilder<'a> {
    pub fn new(
        extractor: &'a FactorExtractor,
        encoder: &'a dyn EmbeddingProvider,
        encoder_spec: EncoderSpec,
        weights: FactorWeights,
    ) -> Self {
        Self {
            extractor,
            encoder,
            encoder_spec,
            weights,
            progress: false,
        }
    }

    /// Show a progress bar on stderr while extracting.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Build the bundle in memory.
    pub fn build(&self, records: &[PortfolioRecord]) -> Result<(ArtifactBundle, usize)> {
        self.weights.validate()?;
        let dims = factor_dims(self.encoder)?;
        info!(
            provider = self.extractor.provider_name(),
            records = records.len(),
            "extracting factors"
        );

        let mut pb = tqdm!(
            total = records.len(),
            desc = "extracting",
            unit = "rec",
            disable = !self.progress
        );
        let mut texts = Vec::with_capacity(records.len());
        let mut empty_extractions = 0usize;
        for record in records {
            let factors = self.extractor.extract(&record.extraction_input())?;
            if factors.is_empty() {
                empty_extractions += 1;
                warn!(id = record.id, "record has no extracted factors");
            }
            texts.push(factors.into_texts());
            pb.update(1)?;
        }
        if self.progress {
            pb.refresh()?;
            eprintln!();
        }

        let vectors = texts
            .par_iter()
            .map(|t| encode_factors(self.encoder, t, &dims))
            .collect::<Result<Vec<_>>>()?;

        let matrices = PerFactor::try_from_fn(|f| {
            let rows: Vec<Vec<f32>> = vectors.iter().map(|v| v[f].clone()).collect();
            Matrix::from_rows(dims[f], &rows).ok_or_else(|| {
                Error::Model(format!("{f} vectors have inconsistent dimensions"))
            })
        })?;
        let stored = records
            .iter()
            .zip(texts)
            .map(|(record, texts)| StoredRecord::new(record, texts))
            .collect();
        let tags = records.iter().map(|r| r.tags.clone()).collect();

        let bundle = ArtifactBundle::assemble(
            matrices,
            stored,
            tags,
            self.weights.clone(),
            self.encoder_spec.clone(),
        )?;
        for factor in FACTOR_ORDER {
            let index = bundle.factor_index(factor);
            info!(
                factor = %factor,
                ntotal = index.len(),
                dim = index.dim(),
                "factor index built"
            );
        }
        info!(
            ntotal = bundle.fused().len(),
            dim = bundle.fused().dim(),
            "fused index built"
        );
        Ok((bundle, empty_extractions))
    }

    /// Build and persist to `dest`, replacing any previous bundle only once
    /// the new one is fully written.
    pub fn build_to(&self, records: &[PortfolioRecord], dest: &Path) -> Result<BuildReport> {
        let (bundle, empty_extractions) = self.build(records)?;

        let staging = staging_path(dest);
        if staging.exists() {
            std::fs::remove_file(&staging)?;
        }
        if let Err(e) = bundle.persist(&staging) {
            if let Err(cleanup) = std::fs::remove_file(&staging) {
                warn!(
                    path = %staging.display(),
                    error = %cleanup,
                    "failed to remove staging file"
                );
            }
            return Err(e);
        }
        std::fs::rename(&staging, dest)?;
        info!(path = %dest.display(), records = bundle.len(), "artifact bundle written");

        Ok(BuildReport {
            path: dest.to_path_buf(),
            records: bundle.len(),
            dims: bundle.dims().clone(),
            fused_dim: bundle.fused().dim(),
            empty_extractions,
        })
    }
}

impl std::fmt::Debug for FusionIndexBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionIndexBuilder")
            .field("encoder_spec", &self.encoder_spec)
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

/// `<dest>.staging`, next to the destination so the rename stays on one
/// filesystem.
fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".staging");
    PathBuf::from(name)
}
