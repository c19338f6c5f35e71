use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    record::StoredRecord,
    vector::Matrix,
};

const MATRICES: TableDefinition<&str, &[u8]> = TableDefinition::new("matrices");
const RECORDS: TableDefinition<u32, &str> = TableDefinition::new("records");
const TAGS: TableDefinition<u32, &str> = TableDefinition::new("tags");
const MANIFEST: TableDefinition<&str, &str> = TableDefinition::new("manifest");

/// Header size: 4 bytes row count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// Everything one bundle write commits, in a single transaction.
#[derive(Debug)]
pub struct BundleWrite<'a> {
    pub matrices: Vec<(&'a str, &'a Matrix)>,
    pub records: &'a [StoredRecord],
    pub tags: &'a [Vec<String>],
    pub manifest: Vec<(&'a str, String)>,
}

/// redb-backed storage for an artifact bundle.
///
/// Matrix entry format:
/// - 4 bytes: row count N (u32 LE)
/// - 4 bytes: dimension D (u32 LE)
/// - N * D * 4 bytes: f32 LE values in row-major order
///
/// Records and tag sets are JSON, keyed by record handle.
pub struct ArtifactDb {
    db: Database,
}

impl ArtifactDb {
    /// Create or open a database and ensure all tables exist.
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(MATRICES)?;
        txn.open_table(RECORDS)?;
        txn.open_table(TAGS)?;
        txn.open_table(MANIFEST)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open an existing database. A missing file is an error.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::artifact(
                path.display().to_string(),
                "file does not exist; run `briefmatch build` first",
            ));
        }
        let db = Database::open(path)
            .map_err(unreadable(&path.display().to_string()))?;
        Ok(Self { db })
    }

    /// Write a whole bundle atomically.
    pub fn store_bundle(&self, bundle: &BundleWrite<'_>) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut matrices = txn.open_table(MATRICES)?;
            for (name, matrix) in &bundle.matrices {
                let data = matrix.as_flat();
                let byte_len = HEADER_SIZE + std::mem::size_of_val(data);
                let mut guard = matrices.insert_reserve(*name, byte_len)?;
                let dest = guard.as_mut();

                dest[0..4].copy_from_slice(&(matrix.rows() as u32).to_le_bytes());
                dest[4..8].copy_from_slice(&(matrix.dim() as u32).to_le_bytes());
                dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(data));
            }

            let mut records = txn.open_table(RECORDS)?;
            for (handle, record) in bundle.records.iter().enumerate() {
                let json = serde_json::to_string(record)?;
                records.insert(handle as u32, json.as_str())?;
            }

            let mut tags = txn.open_table(TAGS)?;
            for (handle, set) in bundle.tags.iter().enumerate() {
                let json = serde_json::to_string(set)?;
                tags.insert(handle as u32, json.as_str())?;
            }

            let mut manifest = txn.open_table(MANIFEST)?;
            for (key, value) in &bundle.manifest {
                manifest.insert(*key, value.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Load a matrix by name. Returns `None` if absent.
    pub fn load_matrix(&self, name: &str) -> Result<Option<Matrix>> {
        let txn = self.db.begin_read().map_err(unreadable(name))?;
        let table = txn.open_table(MATRICES).map_err(unreadable("matrices"))?;

        let Some(guard) = table.get(name).map_err(unreadable(name))? else {
            return Ok(None);
        };
        decode_matrix(name, guard.value()).map(Some)
    }

    /// All records in handle order.
    pub fn load_records(&self) -> Result<Vec<StoredRecord>> {
        let txn = self.db.begin_read().map_err(unreadable("records"))?;
        let table = txn.open_table(RECORDS).map_err(unreadable("records"))?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(unreadable("records"))? {
            let (k, v) = entry.map_err(unreadable("records"))?;
            expect_handle("records", k.value(), result.len())?;
            result.push(
                serde_json::from_str(v.value()).map_err(unreadable("records"))?,
            );
        }
        Ok(result)
    }

    /// All tag sets in handle order.
    pub fn load_tags(&self) -> Result<Vec<Vec<String>>> {
        let txn = self.db.begin_read().map_err(unreadable("tags"))?;
        let table = txn.open_table(TAGS).map_err(unreadable("tags"))?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(unreadable("tags"))? {
            let (k, v) = entry.map_err(unreadable("tags"))?;
            expect_handle("tags", k.value(), result.len())?;
            result.push(serde_json::from_str(v.value()).map_err(unreadable("tags"))?);
        }
        Ok(result)
    }

    pub fn manifest(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read().map_err(unreadable(key))?;
        let table = txn.open_table(MANIFEST).map_err(unreadable("manifest"))?;
        Ok(table
            .get(key)
            .map_err(unreadable(key))?
            .map(|v| v.value().to_string()))
    }

    /// Manifest entry that must be present.
    pub fn require_manifest(&self, key: &str) -> Result<String> {
        self.manifest(key)?
            .ok_or_else(|| Error::artifact(key, "manifest entry missing"))
    }
}

/// Read-side failures all mean the bundle cannot be served.
fn unreadable<E: std::fmt::Display>(part: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::artifact(part, e.to_string())
}

fn expect_handle(table: &str, got: u32, expected: usize) -> Result<()> {
    if got as usize != expected {
        return Err(Error::artifact(
            table,
            format!("handle gap: expected {expected}, found {got}"),
        ));
    }
    Ok(())
}

fn decode_matrix(name: &str, bytes: &[u8]) -> Result<Matrix> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::artifact(name, "matrix entry shorter than its header"));
    }
    let rows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dim = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let expected_len = HEADER_SIZE + rows * dim * 4;
    if bytes.len() != expected_len {
        return Err(Error::artifact(
            name,
            format!(
                "{rows}x{dim} matrix needs {expected_len} bytes, found {}",
                bytes.len()
            ),
        ));
    }

    // redb values carry no alignment guarantee
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]);
    Matrix::from_flat(rows, dim, data)
        .ok_or_else(|| Error::artifact(name, "matrix payload length mismatch"))
}

impl std::fmt::Debug for ArtifactDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{factor::PerFactor, record::RecordMeta};

    fn test_db() -> (tempfile::TempDir, ArtifactDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ArtifactDb::create(&tmp.path().join("artifacts.redb")).unwrap();
        (tmp, db)
    }

    fn record(id: i64) -> StoredRecord {
        StoredRecord {
            id,
            name: format!("record {id}"),
            description: String::new(),
            meta: RecordMeta {
                studio: Some("North".to_string()),
                ..Default::default()
            },
            texts: PerFactor::from_fn(|f| f.name().to_string()),
        }
    }

    #[test]
    fn matrix_survives_storage() {
        let (_tmp, db) = test_db();
        let m = Matrix::from_flat(2, 3, vec![0.5, -1.0, 2.0, 3.25, 0.0, -0.125])
            .unwrap();
        let bundle = BundleWrite {
            matrices: vec![("desc", &m)],
            records: &[],
            tags: &[],
            manifest: vec![],
        };
        db.store_bundle(&bundle).unwrap();

        assert_eq!(db.load_matrix("desc").unwrap(), Some(m));
        assert_eq!(db.load_matrix("style").unwrap(), None);
    }

    #[test]
    fn empty_matrix_keeps_dimension() {
        let (_tmp, db) = test_db();
        let m = Matrix::zeros(0, 16);
        db.store_bundle(&BundleWrite {
            matrices: vec![("fused", &m)],
            records: &[],
            tags: &[],
            manifest: vec![],
        })
        .unwrap();
        let loaded = db.load_matrix("fused").unwrap().unwrap();
        assert_eq!(loaded.rows(), 0);
        assert_eq!(loaded.dim(), 16);
    }

    #[test]
    fn records_tags_and_manifest() {
        let (_tmp, db) = test_db();
        let records = vec![record(10), record(3)];
        let tags = vec![vec!["beauty".to_string()], vec![]];
        db.store_bundle(&BundleWrite {
            matrices: vec![],
            records: &records,
            tags: &tags,
            manifest: vec![("weights", "{}".to_string())],
        })
        .unwrap();

        let loaded = db.load_records().unwrap();
        assert_eq!(loaded, records);
        assert_eq!(db.load_tags().unwrap(), tags);
        assert_eq!(db.require_manifest("weights").unwrap(), "{}");
        assert!(matches!(
            db.require_manifest("encoder"),
            Err(Error::ArtifactUnavailable { .. })
        ));
    }

    #[test]
    fn truncated_matrix_is_unavailable() {
        assert!(matches!(
            decode_matrix("full", &[1, 0, 0, 0, 4, 0, 0, 0, 0, 0]),
            Err(Error::ArtifactUnavailable { .. })
        ));
        assert!(decode_matrix("full", &[1, 2]).is_err());
    }

    #[test]
    fn open_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ArtifactDb::open(&tmp.path().join("nope.redb")).unwrap_err();
        assert!(matches!(err, Error::ArtifactUnavailable { .. }));
    }

    #[test]
    fn garbage_file_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifacts.redb");
        std::fs::write(&path, b"garbage, not a database").unwrap();
        let err = ArtifactDb::open(&path).unwrap_err();
        assert!(matches!(err, Error::ArtifactUnavailable { .. }), "{err:?}");
    }

    #[test]
    fn foreign_database_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.redb");
        crate::config_db::ConfigDb::open(&path).unwrap();

        let db = ArtifactDb::open(&path).unwrap();
        assert!(matches!(
            db.manifest("weights"),
            Err(Error::ArtifactUnavailable { .. })
        ));
        assert!(matches!(
            db.load_matrix("fused"),
            Err(Error::ArtifactUnavailable { .. })
        ));
        assert!(matches!(db.load_records(), Err(Error::ArtifactUnavailable { .. })));
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifacts.redb");
        let m = Matrix::from_flat(1, 2, vec![1.0, 2.0]).unwrap();
        {
            let db = ArtifactDb::create(&path).unwrap();
            db.store_bundle(&BundleWrite {
                matrices: vec![("what", &m)],
                records: &[],
                tags: &[],
                manifest: vec![],
            })
            .unwrap();
        }
        let db = ArtifactDb::open(&path).unwrap();
        assert_eq!(db.load_matrix("what").unwrap(), Some(m));
    }
}
