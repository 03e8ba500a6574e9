//! Migration steps.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::{PhysicalSchema, SchemaChange, StorageResult};

/// One reversible schema change set, identified by a stable id.
///
/// Steps are immutable once applied: the history records a checksum of
/// `changes`, and a declared step that no longer matches it is a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub changes: Vec<SchemaChange>,
}

impl MigrationStep {
    pub fn new(id: impl Into<String>, changes: Vec<SchemaChange>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            changes,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// SHA-256 over the serialized change list, hex encoded.
    pub fn checksum(&self) -> String {
        let encoded = serde_json::to_vec(&self.changes).unwrap_or_default();
        let digest = Sha256::digest(encoded);
        format!("{digest:x}")
    }

    /// Changes that undo this step, in the order they must run.
    pub fn revert_changes(&self) -> Vec<SchemaChange> {
        self.changes.iter().rev().map(SchemaChange::inverse).collect()
    }

    /// Project the step onto a schema without touching a store.
    pub fn apply_to(&self, schema: &mut PhysicalSchema) -> StorageResult<()> {
        for change in &self.changes {
            change.apply_to(schema)?;
        }
        Ok(())
    }

    pub fn revert_from(&self, schema: &mut PhysicalSchema) -> StorageResult<()> {
        for change in self.revert_changes() {
            change.apply_to(schema)?;
        }
        Ok(())
    }
}
