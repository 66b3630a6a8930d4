//! Dataset profiles and the catalog seam they are fetched through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::SessionError;

/// Shape of a single dataset column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProfile {
    /// Column name, exactly as it appears in the data
    pub name: String,
    /// Storage dtype, e.g. `int64` or `object`
    pub dtype: String,
    /// Optional human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Structural summary of a dataset, embedded into prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    /// Display name of the dataset
    pub name: String,
    /// Total row count
    pub row_count: u64,
    /// Per-column shapes, in dataset order
    pub columns: Vec<ColumnProfile>,
}

impl DatasetProfile {
    /// Profile as a JSON value, the form prompt contexts carry
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A dataset ready for session priming: its profile plus loadable bytes
#[derive(Debug, Clone)]
pub struct DatasetPayload {
    /// Structural summary for prompts
    pub profile: DatasetProfile,
    /// Opaque snapshot bytes the prime code loads
    pub bytes: Vec<u8>,
}

/// Source of datasets, keyed by an opaque reference string
#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Fetch a dataset by reference
    async fn fetch(&self, dataset: &str) -> Result<DatasetPayload, SessionError>;
}

/// Filesystem catalog: `<root>/<ref>.json` holds the profile,
/// `<root>/<ref>.bin` holds the snapshot bytes.
pub struct FsDatasetCatalog {
    root: PathBuf,
}

impl FsDatasetCatalog {
    /// Catalog rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Catalog root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DatasetCatalog for FsDatasetCatalog {
    async fn fetch(&self, dataset: &str) -> Result<DatasetPayload, SessionError> {
        // References are flat names, never paths.
        if dataset.is_empty() || dataset.contains(['/', '\\']) || dataset.contains("..") {
            return Err(SessionError::DatasetNotFound {
                dataset: dataset.to_string(),
            });
        }

        let profile_path = self.root.join(format!("{dataset}.json"));
        let data_path = self.root.join(format!("{dataset}.bin"));

        let profile_bytes = match tokio::fs::read(&profile_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::DatasetNotFound {
                    dataset: dataset.to_string(),
                });
            }
            Err(err) => {
                return Err(SessionError::Catalog {
                    reason: format!("reading {}: {err}", profile_path.display()),
                });
            }
        };
        let profile: DatasetProfile =
            serde_json::from_slice(&profile_bytes).map_err(|err| SessionError::Catalog {
                reason: format!("parsing {}: {err}", profile_path.display()),
            })?;

        let bytes = match tokio::fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::DatasetNotFound {
                    dataset: dataset.to_string(),
                });
            }
            Err(err) => {
                return Err(SessionError::Catalog {
                    reason: format!("reading {}: {err}", data_path.display()),
                });
            }
        };

        debug!(dataset, bytes = bytes.len(), "dataset fetched");
        Ok(DatasetPayload { profile, bytes })
    }
}
