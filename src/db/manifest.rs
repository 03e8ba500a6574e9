//! JSON manifest: record types plus migration steps.
//!
//! ```json
//! {
//!   "types": [
//!     {"name": "tag", "primary_key": "id",
//!      "fields": [{"name": "id", "data_type": "integer", "constraints": ["primary_key"]}]}
//!   ],
//!   "migrations": [
//!     {"id": "001_tags", "changes": [{"op": "create_collection", "shape": {...}}]}
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, RecordType};
use crate::db::api::{DatabaseError, DatabaseResult};
use crate::migration::MigrationStep;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub types: Vec<RecordType>,
    #[serde(default)]
    pub migrations: Vec<MigrationStep>,
}

impl Manifest {
    pub fn from_path(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            DatabaseError::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> DatabaseResult<Self> {
        serde_json::from_str(text).map_err(|e| DatabaseError::Manifest(e.to_string()))
    }

    /// Validate the declared types into a catalog.
    pub fn catalog(&self) -> DatabaseResult<Catalog> {
        Ok(Catalog::from_types(self.types.clone())?)
    }

    /// Append a step, e.g. one produced by `Migrator::plan`.
    pub fn push_step(&mut self, step: MigrationStep) {
        self.migrations.push(step);
    }

    pub fn to_json_pretty(&self) -> DatabaseResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DatabaseError::Manifest(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> DatabaseResult<()> {
        fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}
