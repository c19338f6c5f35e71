use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::{Error, Result},
    factor::PerFactor,
};

/// Row position of a record inside an artifact bundle.
///
/// The same handle addresses every per-factor matrix, the fused matrix,
/// the record arena and the tag lookup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RecordHandle(pub u32);

impl RecordHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Optional production metadata attached to a portfolio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(default)]
    pub studio: Option<String>,
    #[serde(default, deserialize_with = "lenient_cost")]
    pub cost: Option<f64>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// A source portfolio record as handed to the index builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

impl PortfolioRecord {
    /// Text handed to factor extraction for this record.
    pub fn extraction_input(&self) -> String {
        format!(
            "Title: {}. Description: {}. Tags: {}",
            self.name.trim(),
            self.description.trim(),
            self.tags.join(", ")
        )
    }

    /// Studio name, or `None` when missing or blank.
    pub fn studio(&self) -> Option<&str> {
        self.meta
            .studio
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A record as persisted in the artifact bundle, with its factor texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub texts: PerFactor<String>,
}

impl StoredRecord {
    pub fn new(record: &PortfolioRecord, texts: PerFactor<String>) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            description: record.description.clone(),
            meta: record.meta.clone(),
            texts,
        }
    }

    pub fn studio(&self) -> Option<&str> {
        self.meta
            .studio
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Accepts a number, a numeric string, or null. Anything else becomes `None`.
fn lenient_cost<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite()))
}

/// Parse records from a JSON array or JSON Lines text.
///
/// Tags are deduplicated and sorted; duplicate ids are rejected.
pub fn parse_records(text: &str) -> Result<Vec<PortfolioRecord>> {
    let trimmed = text.trim_start();
    let mut records: Vec<PortfolioRecord> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    let mut seen = HashSet::with_capacity(records.len());
    for record in &mut records {
        if !seen.insert(record.id) {
            return Err(Error::Config(format!(
                "duplicate portfolio id {} in record set",
                record.id
            )));
        }
        let tags: BTreeSet<String> = record
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        record.tags = tags.into_iter().collect();
    }

    Ok(records)
}

/// Load records from a file. See [`parse_records`].
pub fn load_records(path: &Path) -> Result<Vec<PortfolioRecord>> {
    let text = std::fs::read_to_string(path)?;
    parse_records(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let text = r#"[
            {"id": 1, "name": "Spring Launch", "description": "A launch film",
             "tags": ["video", "beauty", "video"], "studio": "North", "cost": "1200.5"},
            {"id": 2, "name": "Banner Set"}
        ]"#;
        let records = parse_records(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tags, vec!["beauty", "video"]);
        assert_eq!(records[0].meta.cost, Some(1200.5));
        assert_eq!(records[0].studio(), Some("North"));
        assert!(records[1].tags.is_empty());
        assert_eq!(records[1].studio(), None);
    }

    #[test]
    fn parses_json_lines() {
        let text = "{\"id\": 7, \"name\": \"A\"}\n\n{\"id\": 8, \"name\": \"B\", \"cost\": 30}\n";
        let records = parse_records(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].meta.cost, Some(30.0));
    }

    #[test]
    fn non_numeric_cost_is_none() {
        let text = r#"[{"id": 1, "name": "A", "cost": "negotiable"},
                       {"id": 2, "name": "B", "cost": true}]"#;
        let records = parse_records(text).unwrap();
        assert_eq!(records[0].meta.cost, None);
        assert_eq!(records[1].meta.cost, None);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let text = r#"[{"id": 1, "name": "A"}, {"id": 1, "name": "B"}]"#;
        assert!(matches!(parse_records(text), Err(Error::Config(_))));
    }

    #[test]
    fn blank_studio_is_missing() {
        let record = PortfolioRecord {
            id: 1,
            name: "A".to_string(),
            description: String::new(),
            tags: vec![],
            meta: RecordMeta {
                studio: Some("   ".to_string()),
                ..Default::default()
            },
        };
        assert_eq!(record.studio(), None);
    }

    #[test]
    fn extraction_input_lists_tags() {
        let record = PortfolioRecord {
            id: 3,
            name: "Winter Sale".to_string(),
            description: "Motion graphics for a retail sale".to_string(),
            tags: vec!["retail".to_string(), "motion".to_string()],
            meta: RecordMeta::default(),
        };
        assert_eq!(
            record.extraction_input(),
            "Title: Winter Sale. Description: Motion graphics for a retail sale. Tags: retail, motion"
        );
    }
}
