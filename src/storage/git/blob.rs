//! Blob operations for row storage.
//!
//! Each row is stored as a separate JSON file, with metadata for version
//! tracking next to the field values.

use serde::{Deserialize, Serialize};

use crate::catalog::{KeyValue, Record};
use crate::storage::error::{StorageError, StorageResult};

/// A stored row with metadata.
///
/// The format stored in Git:
/// ```text
/// {
///   "_pk": 42,
///   "_version": 1,
///   "_created_at": "xxxx-xx-xxT00:00:00Z",
///   "_updated_at": "xxxx-xx-xxT00:00:00Z",
///   "id": 42,
///   "name": "abc"
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredRow {
    pub key: KeyValue,
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    pub data: Record,
}

impl StoredRow {
    /// A first version of a row.
    pub fn new(key: KeyValue, data: Record) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// The next version of this row, carrying `data`.
    pub fn with_update(&self, data: Record) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version + 1,
            created_at: self.created_at.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }
}

/// `_` prefixed metadata never collides with field names.
#[derive(Serialize, Deserialize)]
struct RowJson {
    #[serde(rename = "_pk")]
    pk: KeyValue,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: Record,
}

/// File name of a row blob inside its collection directory.
pub(crate) fn file_name(key: &KeyValue) -> StorageResult<String> {
    if let KeyValue::Text(s) = key {
        let safe = !s.is_empty()
            && s.len() <= 200
            && !s.starts_with('.')
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(StorageError::InvalidKey(format!(
                "'{}' cannot be stored as a file name",
                s
            )));
        }
    }
    Ok(format!("{}.json", key))
}

/// Serialize a row to JSON bytes. `Record` is ordered, so identical rows
/// produce identical blobs.
pub(crate) fn serialize_row(row: &StoredRow) -> StorageResult<Vec<u8>> {
    let json = RowJson {
        pk: row.key.clone(),
        version: row.version,
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
        data: row.data.clone(),
    };
    Ok(serde_json::to_vec_pretty(&json)?)
}

/// Deserialize a row, checking the key against the file it came from.
pub(crate) fn deserialize_row(bytes: &[u8], path: &str) -> StorageResult<StoredRow> {
    let json: RowJson = serde_json::from_slice(bytes)?;
    let expected = path.rsplit('/').next().unwrap_or(path);
    if file_name(&json.pk)? != expected {
        return Err(StorageError::CorruptedData {
            path: path.into(),
            reason: format!("primary key mismatch: content has '{}'", json.pk),
        });
    }
    Ok(StoredRow {
        key: json.pk,
        version: json.version,
        created_at: json.created_at,
        updated_at: json.updated_at,
        data: json.data,
    })
}

/// Write any serializable value as a pretty JSON blob.
pub(crate) fn write_json<T: Serialize>(repo: &git2::Repository, value: &T) -> StorageResult<git2::Oid> {
    let bytes = serde_json::to_vec_pretty(value)?;
    Ok(repo.blob(&bytes)?)
}

pub(crate) fn parse_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StorageResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}
