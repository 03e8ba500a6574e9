//! High-level database handle, configuration and manifest loading.

mod api;
mod manifest;

pub use api::{Database, DatabaseConfig, DatabaseError, DatabaseResult};
pub use manifest::Manifest;
