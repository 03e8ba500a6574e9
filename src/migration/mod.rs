//! Migration engine.
//!
//! Declared [`MigrationStep`]s are applied in order, one store transaction
//! per step. The store keeps the history (`step_id`, `applied_at`,
//! `checksum`); a history that isn't a prefix of the declared steps is a
//! conflict and halts the migrator until an operator steps in.

mod diff;
mod engine;
mod error;
mod step;

pub use diff::{declared_schema, diff, same_schema};
pub use engine::{MigrationReport, MigrationStatus, Migrator};
pub use error::{MigrationError, MigrationResult};
pub use step::MigrationStep;

pub(crate) use engine::HaltFlag;
