use std::{collections::BTreeMap, path::Path};

use tracing::info;

use crate::{
    artifact_db::{ArtifactDb, BundleWrite},
    embedding::EncoderSpec,
    error::{Error, Result},
    factor::{FACTOR_ORDER, Factor, FactorWeights, PerFactor},
    flat_index::{FlatIpIndex, Hit},
    record::{RecordHandle, StoredRecord},
    vector::{Matrix, fuse},
};

/// Name of the fused matrix inside the `matrices` table.
pub const FUSED: &str = "fused";

const FACTOR_ORDER_KEY: &str = "factor_order";
const FACTOR_DIMS_KEY: &str = "factor_dims";
const WEIGHTS_KEY: &str = "weights";
const ENCODER_KEY: &str = "encoder";

/// The immutable, process-lifetime search artifacts.
///
/// Every matrix row, record and tag set shares the same [`RecordHandle`].
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    factors: PerFactor<FlatIpIndex>,
    fused: FlatIpIndex,
    records: Vec<StoredRecord>,
    tags: Vec<Vec<String>>,
    weights: FactorWeights,
    sqrt_weights: FactorWeights,
    dims: PerFactor<usize>,
    encoder: EncoderSpec,
}

impl ArtifactBundle {
    /// Assemble a bundle from unit-normalized per-factor matrices, computing
    /// the fused matrix.
    pub fn assemble(
        matrices: PerFactor<Matrix>,
        records: Vec<StoredRecord>,
        tags: Vec<Vec<String>>,
        weights: FactorWeights,
        encoder: EncoderSpec,
    ) -> Result<Self> {
        weights.validate()?;
        let sqrt_weights = weights.sqrt();
        let rows = records.len();

        let mut fused_rows = Vec::with_capacity(rows);
        for row in 0..rows {
            let vectors = PerFactor::try_from_fn(|f| {
                let m = &matrices[f];
                if m.rows() != rows {
                    return Err(row_mismatch(f.name(), m.rows(), rows));
                }
                Ok(m.row(row).to_vec())
            })?;
            fused_rows.push(fuse(&vectors, &sqrt_weights));
        }
        let fused_dim: usize = matrices.iter().map(|(_, m)| m.dim()).sum();
        let fused = Matrix::from_rows(fused_dim, &fused_rows)
            .ok_or_else(|| Error::artifact(FUSED, "ragged fused rows"))?;

        Self::from_parts(matrices, fused, records, tags, weights, encoder)
    }

    /// Validate and index already-computed parts.
    fn from_parts(
        matrices: PerFactor<Matrix>,
        fused: Matrix,
        records: Vec<StoredRecord>,
        tags: Vec<Vec<String>>,
        weights: FactorWeights,
        encoder: EncoderSpec,
    ) -> Result<Self> {
        let rows = records.len();
        if tags.len() != rows {
            return Err(row_mismatch("tags", tags.len(), rows));
        }
        for (factor, m) in matrices.iter() {
            if m.rows() != rows {
                return Err(row_mismatch(factor.name(), m.rows(), rows));
            }
        }
        if fused.rows() != rows {
            return Err(row_mismatch(FUSED, fused.rows(), rows));
        }

        let dims = matrices.map(|_, m| m.dim());
        let expected_fused: usize = dims.iter().map(|(_, d)| d).sum();
        if fused.dim() != expected_fused {
            return Err(Error::artifact(
                FUSED,
                format!(
                    "dimension {} is not the factor dimension sum {expected_fused}",
                    fused.dim()
                ),
            ));
        }

        weights
            .validate()
            .map_err(|e| Error::artifact(WEIGHTS_KEY, e.to_string()))?;

        Ok(Self {
            factors: matrices.into_map(FlatIpIndex::new),
            fused: FlatIpIndex::new(fused),
            records,
            tags,
            sqrt_weights: weights.sqrt(),
            weights,
            dims,
            encoder,
        })
    }

    /// Write the bundle to a fresh database at `path`.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let db = ArtifactDb::create(path)?;

        let order: Vec<&str> = FACTOR_ORDER.iter().map(|f| f.name()).collect();
        let dims: BTreeMap<&str, usize> =
            self.dims.iter().map(|(f, d)| (f.name(), *d)).collect();
        let weights: BTreeMap<&str, f32> =
            self.weights.iter().map(|(f, w)| (f.name(), *w)).collect();

        let mut matrices: Vec<(&str, &Matrix)> = self
            .factors
            .iter()
            .map(|(f, idx)| (f.name(), idx.vectors()))
            .collect();
        matrices.push((FUSED, self.fused.vectors()));

        db.store_bundle(&BundleWrite {
            matrices,
            records: &self.records,
            tags: &self.tags,
            manifest: vec![
                (FACTOR_ORDER_KEY, serde_json::to_string(&order)?),
                (FACTOR_DIMS_KEY, serde_json::to_string(&dims)?),
                (WEIGHTS_KEY, serde_json::to_string(&weights)?),
                (ENCODER_KEY, serde_json::to_string(&self.encoder)?),
            ],
        })
    }

    /// Load and validate a bundle. Any missing or inconsistent part is
    /// [`Error::ArtifactUnavailable`].
    pub fn load(path: &Path) -> Result<Self> {
        let db = ArtifactDb::open(path)?;

        let order: Vec<String> = manifest_json(&db, FACTOR_ORDER_KEY)?;
        let expected: Vec<&str> = FACTOR_ORDER.iter().map(|f| f.name()).collect();
        if order != expected {
            return Err(Error::artifact(
                FACTOR_ORDER_KEY,
                format!("expected {expected:?}, found {order:?}"),
            ));
        }

        let stored_dims: BTreeMap<String, usize> =
            manifest_json(&db, FACTOR_DIMS_KEY)?;
        let stored_weights: BTreeMap<String, f32> =
            manifest_json(&db, WEIGHTS_KEY)?;
        let encoder: EncoderSpec = manifest_json(&db, ENCODER_KEY)?;

        let weights = FactorWeights::try_from_fn(|f| {
            stored_weights.get(f.name()).copied().ok_or_else(|| {
                Error::artifact(WEIGHTS_KEY, format!("no weight for {f}"))
            })
        })?;

        let matrices = PerFactor::try_from_fn(|f| {
            let m = require_matrix(&db, f.name())?;
            match stored_dims.get(f.name()) {
                Some(&d) if d == m.dim() => Ok(m),
                Some(&d) => Err(Error::artifact(
                    f.name(),
                    format!("manifest says dimension {d}, matrix has {}", m.dim()),
                )),
                None => Err(Error::artifact(
                    FACTOR_DIMS_KEY,
                    format!("no dimension for {f}"),
                )),
            }
        })?;
        let fused = require_matrix(&db, FUSED)?;
        let records = db.load_records()?;
        let tags = db.load_tags()?;

        let bundle =
            Self::from_parts(matrices, fused, records, tags, weights, encoder)?;
        info!(
            records = bundle.len(),
            fused_dim = bundle.fused.dim(),
            sentence_dim = bundle.dims.full,
            word_dim = bundle.dims.what,
            "loaded artifact bundle"
        );
        Ok(bundle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fused(&self) -> &FlatIpIndex {
        &self.fused
    }

    pub fn factor_index(&self, factor: Factor) -> &FlatIpIndex {
        &self.factors[factor]
    }

    /// Stored unit vector of `factor` for `handle`.
    pub fn factor_vector(&self, factor: Factor, handle: RecordHandle) -> &[f32] {
        self.factors[factor].vectors().row(handle.index())
    }

    pub fn record(&self, handle: RecordHandle) -> &StoredRecord {
        &self.records[handle.index()]
    }

    pub fn records(&self) -> &[StoredRecord] {
        &self.records
    }

    pub fn tags(&self, handle: RecordHandle) -> &[String] {
        &self.tags[handle.index()]
    }

    pub fn weights(&self) -> &FactorWeights {
        &self.weights
    }

    pub fn sqrt_weights(&self) -> &FactorWeights {
        &self.sqrt_weights
    }

    pub fn dims(&self) -> &PerFactor<usize> {
        &self.dims
    }

    pub fn encoder(&self) -> &EncoderSpec {
        &self.encoder
    }

    /// Single-factor diagnostic search.
    pub fn probe(&self, factor: Factor, query: &[f32], m: usize) -> Vec<Hit> {
        self.factors[factor].search(query, m)
    }
}

fn manifest_json<T: serde::de::DeserializeOwned>(
    db: &ArtifactDb,
    key: &str,
) -> Result<T> {
    let raw = db.require_manifest(key)?;
    serde_json::from_str(&raw).map_err(|e| Error::artifact(key, e.to_string()))
}

fn require_matrix(db: &ArtifactDb, name: &str) -> Result<Matrix> {
    db.load_matrix(name)?
        .ok_or_else(|| Error::artifact(name, "matrix missing"))
}

fn row_mismatch(part: &str, got: usize, expected: usize) -> Error {
    Error::artifact(part, format!("{got} rows, expected {expected}"))
}
