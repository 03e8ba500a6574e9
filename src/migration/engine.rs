//! The migrator: pending steps, apply, revert, planning.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::migration::diff::{declared_schema, diff};
use crate::migration::error::{MigrationError, MigrationResult};
use crate::migration::step::MigrationStep;
use crate::storage::{
    HistoryEntry, PhysicalSchema, SchemaChange, StorageError, StorageResult, Store,
    StoreTransaction,
};

/// Shared halt marker. Set on a migration conflict, cleared by an operator.
pub(crate) type HaltFlag = Arc<RwLock<Option<String>>>;

/// Steps touched by one `apply_all` or `revert_last` call, in the order
/// they ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub steps: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Applied and pending steps at a glance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub current: Option<String>,
    pub applied: Vec<HistoryEntry>,
    pub pending: Vec<String>,
}

/// Runs declared migration steps against one store.
pub struct Migrator {
    store: Arc<dyn Store>,
    catalog: Catalog,
    steps: Vec<MigrationStep>,
    owner: String,
    halt: HaltFlag,
}

impl Migrator {
    /// Build a migrator over `steps`, which must have unique ids.
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Catalog,
        steps: Vec<MigrationStep>,
    ) -> MigrationResult<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(MigrationError::DuplicateStep(step.id.clone()));
            }
        }
        Ok(Self {
            store,
            catalog,
            steps,
            owner: format!("migrator-{}", ulid::Ulid::new()),
            halt: HaltFlag::default(),
        })
    }

    /// Name recorded as the lock holder.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub(crate) fn with_halt(mut self, halt: HaltFlag) -> Self {
        self.halt = halt;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Whether a conflict halted this migrator (or its database).
    pub fn halted(&self) -> Option<String> {
        self.halt.read().clone()
    }

    /// The store's history, oldest first.
    pub fn history(&self) -> MigrationResult<Vec<HistoryEntry>> {
        Ok(self.store.read_migration_history()?)
    }

    /// Declared steps not yet in the history, in declared order.
    ///
    /// Fails with [`MigrationError::Uncovered`] when the catalog declares
    /// schema that the store would still lack after every declared step.
    pub fn pending_steps(&self) -> MigrationResult<Vec<MigrationStep>> {
        self.ensure_running()?;
        let history = self.checked_history()?;
        let pending = &self.steps[history.len()..];
        self.check_coverage(pending)?;
        Ok(pending.to_vec())
    }

    /// Id of the last applied step.
    pub fn current_version(&self) -> MigrationResult<Option<String>> {
        self.ensure_running()?;
        let history = self.checked_history()?;
        Ok(history.last().map(|e| e.step_id.clone()))
    }

    pub fn status(&self) -> MigrationResult<MigrationStatus> {
        self.ensure_running()?;
        let applied = self.checked_history()?;
        Ok(MigrationStatus {
            current: applied.last().map(|e| e.step_id.clone()),
            pending: self.steps[applied.len()..]
                .iter()
                .map(|s| s.id.clone())
                .collect(),
            applied,
        })
    }

    /// Apply every pending step, one store transaction per step.
    ///
    /// A failing step is rolled back; steps before it stay applied and are
    /// listed in the error. Nothing runs when the steps don't cover the
    /// catalog.
    pub fn apply_all(&self) -> MigrationResult<MigrationReport> {
        self.ensure_running()?;
        let _lock = self.lock()?;
        let history = self.checked_history()?;
        let pending = &self.steps[history.len()..];
        self.check_coverage(pending)?;

        let mut report = MigrationReport::default();
        for step in pending {
            let entry = HistoryEntry::new(&step.id, step.checksum());
            let result = self.run_in_transaction(|tx| {
                for change in &step.changes {
                    tx.alter(change)?;
                }
                tx.append_migration_history(entry)
            });
            if let Err(source) = result {
                tracing::warn!(step = %step.id, applied = report.steps.len(), error = %source, "migration step failed");
                return Err(MigrationError::StepFailed {
                    step_id: step.id.clone(),
                    applied: report.steps,
                    source,
                });
            }
            tracing::info!(step = %step.id, changes = step.changes.len(), "migration step applied");
            report.steps.push(step.id.clone());
        }
        Ok(report)
    }

    /// Revert the last `n` applied steps, newest first.
    pub fn revert_last(&self, n: usize) -> MigrationResult<MigrationReport> {
        self.ensure_running()?;
        let _lock = self.lock()?;
        let history = self.checked_history()?;
        if n > history.len() {
            return Err(MigrationError::NothingToRevert {
                requested: n,
                applied: history.len(),
            });
        }

        let mut report = MigrationReport::default();
        for step in self.steps[..history.len()].iter().rev().take(n) {
            let result = self.run_in_transaction(|tx| {
                for change in step.revert_changes() {
                    tx.alter(&change)?;
                }
                tx.remove_migration_history(&step.id)
            });
            if let Err(source) = result {
                tracing::warn!(step = %step.id, reverted = report.steps.len(), error = %source, "migration revert failed");
                return Err(MigrationError::StepFailed {
                    step_id: step.id.clone(),
                    applied: report.steps,
                    source,
                });
            }
            tracing::info!(step = %step.id, "migration step reverted");
            report.steps.push(step.id.clone());
        }
        Ok(report)
    }

    /// A new step taking the store, with every pending step applied, to the
    /// catalog's declared schema. `None` when nothing is left to do.
    pub fn plan(&self, step_id: &str) -> MigrationResult<Option<MigrationStep>> {
        self.ensure_running()?;
        if self.steps.iter().any(|s| s.id == step_id) {
            return Err(MigrationError::DuplicateStep(step_id.to_string()));
        }
        let history = self.checked_history()?;
        let mut projected = self.store.physical_schema()?;
        for step in &self.steps[history.len()..] {
            step.apply_to(&mut projected)?;
        }
        let changes = self.uncovered(&projected)?;
        if changes.is_empty() {
            return Ok(None);
        }
        let description = format!("{} generated changes", changes.len());
        Ok(Some(
            MigrationStep::new(step_id, changes).with_description(description),
        ))
    }

    /// Differences between the store's current schema and the catalog.
    pub fn verify(&self) -> MigrationResult<Vec<SchemaChange>> {
        self.ensure_running()?;
        let drift = self.uncovered(&self.store.physical_schema()?)?;
        if !drift.is_empty() {
            tracing::warn!(changes = drift.len(), "store schema drifts from the catalog");
        }
        Ok(drift)
    }

    /// What `schema` lacks to match the catalog.
    fn uncovered(&self, schema: &PhysicalSchema) -> MigrationResult<Vec<SchemaChange>> {
        Ok(diff(schema, &declared_schema(&self.catalog))?)
    }

    /// Fail unless the store, after `pending`, matches the catalog.
    fn check_coverage(&self, pending: &[MigrationStep]) -> MigrationResult<()> {
        let mut projected = self.store.physical_schema()?;
        for step in pending {
            // a step that can't be projected fails again when applied
            if step.apply_to(&mut projected).is_err() {
                return Ok(());
            }
        }
        let changes = self.uncovered(&projected)?;
        if changes.is_empty() {
            return Ok(());
        }
        tracing::warn!(changes = changes.len(), "declared steps don't cover the catalog");
        Err(MigrationError::Uncovered {
            changes: changes.iter().map(ToString::to_string).collect(),
        })
    }

    fn ensure_running(&self) -> MigrationResult<()> {
        match self.halted() {
            Some(reason) => Err(MigrationError::Halted(reason)),
            None => Ok(()),
        }
    }

    /// Read the history and check it is a prefix of the declared steps.
    /// Any mismatch halts.
    fn checked_history(&self) -> MigrationResult<Vec<HistoryEntry>> {
        let history = self.history()?;
        if let Err(err) = self.check_history(&history) {
            tracing::warn!(error = %err, "migration history conflict, halting");
            *self.halt.write() = Some(err.to_string());
            return Err(err);
        }
        Ok(history)
    }

    fn check_history(&self, history: &[HistoryEntry]) -> MigrationResult<()> {
        for (i, entry) in history.iter().enumerate() {
            let Some(position) = self.steps.iter().position(|s| s.id == entry.step_id) else {
                return Err(MigrationError::conflict(
                    &entry.step_id,
                    "recorded in the store but not declared",
                ));
            };
            if position != i {
                return Err(MigrationError::conflict(
                    &entry.step_id,
                    format!("recorded at position {} but declared at {}", i, position),
                ));
            }
            if self.steps[position].checksum() != entry.checksum {
                return Err(MigrationError::conflict(
                    &entry.step_id,
                    "declared changes differ from the applied ones",
                ));
            }
        }
        Ok(())
    }

    fn lock(&self) -> MigrationResult<LockGuard<'_>> {
        self.store
            .try_lock_migrations(&self.owner)
            .map_err(|err| match err {
                StorageError::MigrationLocked { holder } => MigrationError::Locked { holder },
                other => MigrationError::Storage(other),
            })?;
        Ok(LockGuard {
            store: self.store.as_ref(),
            owner: &self.owner,
        })
    }

    fn run_in_transaction<F>(&self, stage: F) -> StorageResult<()>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> StorageResult<()>,
    {
        let mut tx = self.store.begin()?;
        match stage(tx.as_mut()) {
            Ok(()) => tx.commit(),
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("store", &self.store.name())
            .field("steps", &self.steps.len())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Releases the migration lock on drop.
struct LockGuard<'a> {
    store: &'a dyn Store,
    owner: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.unlock_migrations(self.owner) {
            tracing::warn!(owner = self.owner, error = %err, "failed to release migration lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Constraint, DataType, FieldDef, RecordTypeBuilder};
    use crate::migration::diff::same_schema;
    use crate::storage::{CollectionShape, MemoryStore};

    fn catalog() -> Catalog {
        Catalog::builder()
            .register(
                RecordTypeBuilder::new("tag")
                    .key("id", DataType::Integer)
                    .add_field("label", DataType::Text)
                    .add_field("colour", DataType::Text)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep::new(
                "001_tags",
                vec![SchemaChange::CreateCollection {
                    shape: CollectionShape {
                        name: "tag".into(),
                        fields: vec![
                            FieldDef::new("id", DataType::Integer)
                                .with_constraint(Constraint::PrimaryKey),
                            FieldDef::new("label", DataType::Text),
                        ],
                        primary_key: "id".into(),
                        key_generation: None,
                        references: vec![],
                    },
                }],
            ),
            MigrationStep::new(
                "002_colour",
                vec![SchemaChange::AddField {
                    collection: "tag".into(),
                    field: FieldDef::new("colour", DataType::Text),
                }],
            ),
        ]
    }

    fn migrator(store: &Arc<MemoryStore>, steps: Vec<MigrationStep>) -> Migrator {
        Migrator::new(store.clone(), catalog(), steps).unwrap()
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let m = migrator(&store, steps());

        assert_eq!(m.pending_steps().unwrap().len(), 2);
        let report = m.apply_all().unwrap();
        assert_eq!(report.steps, vec!["001_tags", "002_colour"]);
        assert!(m.pending_steps().unwrap().is_empty());
        assert!(m.apply_all().unwrap().is_empty());
        assert_eq!(m.current_version().unwrap().as_deref(), Some("002_colour"));
        assert!(m.verify().unwrap().is_empty());
    }

    #[test]
    fn test_revert_then_reapply() {
        let store = Arc::new(MemoryStore::new());
        let m = migrator(&store, steps());
        m.apply_all().unwrap();
        let applied = store.physical_schema().unwrap();

        let report = m.revert_last(2).unwrap();
        assert_eq!(report.steps, vec!["002_colour", "001_tags"]);
        assert!(store.physical_schema().unwrap().is_empty());
        assert_eq!(m.current_version().unwrap(), None);

        m.apply_all().unwrap();
        assert!(same_schema(&store.physical_schema().unwrap(), &applied));
        assert!(matches!(
            m.revert_last(3),
            Err(MigrationError::NothingToRevert { requested: 3, applied: 2 })
        ));
    }

    #[test]
    fn test_unknown_history_halts() {
        let store = Arc::new(MemoryStore::new());
        migrator(&store, steps()).apply_all().unwrap();

        let older = migrator(&store, steps()[..1].to_vec());
        let err = older.pending_steps().unwrap_err();
        assert!(err.is_fatal());
        assert!(older.halted().is_some());
        assert!(matches!(older.apply_all(), Err(MigrationError::Halted(_))));
    }

    #[test]
    fn test_edited_step_is_conflict() {
        let store = Arc::new(MemoryStore::new());
        migrator(&store, steps()).apply_all().unwrap();

        let mut edited = steps();
        edited[1].changes[0] = SchemaChange::AddField {
            collection: "tag".into(),
            field: FieldDef::new("colour", DataType::Json),
        };
        let err = migrator(&store, edited).current_version().unwrap_err();
        assert!(matches!(err, MigrationError::Conflict { ref step_id, .. } if step_id == "002_colour"));
    }

    #[test]
    fn test_failed_step_reports_progress() {
        let store = Arc::new(MemoryStore::new());
        let mut broken = steps();
        broken.push(MigrationStep::new(
            "003_bad",
            vec![SchemaChange::AddField {
                collection: "ghost".into(),
                field: FieldDef::new("x", DataType::Text),
            }],
        ));
        let m = migrator(&store, broken);
        let err = m.apply_all().unwrap_err();
        assert_eq!(err.applied_steps(), ["001_tags", "002_colour"]);
        assert_eq!(m.current_version().unwrap().as_deref(), Some("002_colour"));
        // the lock was released
        store.try_lock_migrations("someone").unwrap();
    }

    #[test]
    fn test_concurrent_apply_is_locked() {
        let store = Arc::new(MemoryStore::new());
        store.try_lock_migrations("other-host").unwrap();
        let err = migrator(&store, steps()).apply_all().unwrap_err();
        assert!(matches!(err, MigrationError::Locked { ref holder } if holder == "other-host"));
        assert!(store.read_migration_history().unwrap().is_empty());
    }

    #[test]
    fn test_catalog_field_without_step_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let m = migrator(&store, steps()[..1].to_vec());

        let err = m.pending_steps().unwrap_err();
        assert!(matches!(&err, MigrationError::Uncovered { changes } if changes.len() == 1 && changes[0].contains("colour")));
        assert!(!err.is_fatal());
        assert!(m.halted().is_none());

        assert!(matches!(m.apply_all(), Err(MigrationError::Uncovered { .. })));
        assert!(store.physical_schema().unwrap().is_empty());
        assert!(store.read_migration_history().unwrap().is_empty());
        store.try_lock_migrations("someone").unwrap();
    }

    #[test]
    fn test_plan_and_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let m = migrator(&store, steps()[..1].to_vec());
        let planned = m.plan("002_auto").unwrap().unwrap();
        assert_eq!(planned.changes.len(), 1);
        assert!(matches!(&planned.changes[0], SchemaChange::AddField { field, .. } if field.name == "colour"));
        assert!(matches!(m.plan("001_tags"), Err(MigrationError::DuplicateStep(_))));

        let full = migrator(&store, steps());
        assert!(full.plan("003").unwrap().is_none());
        assert!(matches!(
            Migrator::new(store.clone(), catalog(), vec![steps()[0].clone(), steps()[0].clone()]),
            Err(MigrationError::DuplicateStep(_))
        ));
    }
}
