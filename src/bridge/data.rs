use crate::error::ConfigError;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a run's dataset comes from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// A file holding a JSON array of records.
    File(PathBuf),
    /// A JSON array given inline (tests, embedded fixtures).
    Inline(String),
    /// Records already built in memory.
    Records(Vec<JsonValue>),
}

impl DatasetSource {
    fn origin(&self) -> String {
        match self {
            DatasetSource::File(path) => path.display().to_string(),
            DatasetSource::Inline(_) => "<inline>".to_string(),
            DatasetSource::Records(_) => "<records>".to_string(),
        }
    }
}

/// Ordered, immutable sequence of records shared read-only by every VU.
///
/// Cloning is cheap: clones share the same allocation. Per-user customization
/// works on a copy of a record (`record.clone()`), never on the dataset.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Arc<Vec<JsonValue>>,
}

impl Dataset {
    pub fn new(records: Vec<JsonValue>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&JsonValue> {
        self.records.get(index)
    }

    /// Record for `index`, wrapping modulo the dataset length.
    /// `None` only when the dataset is empty.
    pub fn wrapped(&self, index: usize) -> Option<&JsonValue> {
        if self.records.is_empty() {
            None
        } else {
            self.records.get(index % self.records.len())
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &JsonValue> {
        self.records.iter()
    }

    pub fn shares_storage_with(&self, other: &Dataset) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }
}

/// Read and parse `source` exactly once. Failures are fatal configuration errors.
pub fn load(source: &DatasetSource, require_non_empty: bool) -> Result<Dataset, ConfigError> {
    let records = match source {
        DatasetSource::File(path) => {
            let content =
                std::fs::read_to_string(path).map_err(|source| ConfigError::DatasetUnreadable {
                    path: path.clone(),
                    source,
                })?;
            parse_records(&content, source)?
        }
        DatasetSource::Inline(content) => parse_records(content, source)?,
        DatasetSource::Records(records) => records.clone(),
    };

    if require_non_empty && records.is_empty() {
        return Err(ConfigError::DatasetEmpty(source.origin()));
    }
    tracing::info!(origin = %source.origin(), records = records.len(), "dataset loaded");
    Ok(Dataset::new(records))
}

fn parse_records(content: &str, source: &DatasetSource) -> Result<Vec<JsonValue>, ConfigError> {
    serde_json::from_str::<Vec<JsonValue>>(content).map_err(|e| ConfigError::DatasetMalformed {
        origin: source.origin(),
        source: e,
    })
}
