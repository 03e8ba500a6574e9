//! Database API - the handle callers open sessions and migrators from.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{Catalog, SchemaError};
use crate::db::manifest::Manifest;
use crate::migration::{HaltFlag, MigrationError, MigrationStep, Migrator};
use crate::session::{Session, SessionError, SessionOptions};
use crate::storage::{GitSignature, GitStore, MemoryStore, StorageError, Store};

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// A migration conflict halted the database.
    #[error("database halted: {0}")]
    Halted(String),

    #[error("database not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatabaseError {
    /// Whether the error needs an operator before the database is usable
    /// again.
    pub fn is_fatal(&self) -> bool {
        match self {
            DatabaseError::Halted(_) => true,
            DatabaseError::Migration(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the store's git repository.
    pub path: PathBuf,
    /// Create if doesn't exist.
    pub create_if_missing: bool,
    /// Resolve associations that weren't included on first access.
    pub lazy_loading: bool,
    /// Lock holder name for migrations. A fresh ULID-based name when unset.
    pub migration_owner: Option<String>,
    /// Commit author name.
    pub signature_name: String,
    /// Commit author email.
    pub signature_email: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let signature = GitSignature::default();
        Self {
            path: PathBuf::from(".gitorm"),
            create_if_missing: true,
            lazy_loading: true,
            migration_owner: None,
            signature_name: signature.name,
            signature_email: signature.email,
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn lazy_loading(mut self, value: bool) -> Self {
        self.lazy_loading = value;
        self
    }

    pub fn migration_owner(mut self, owner: impl Into<String>) -> Self {
        self.migration_owner = Some(owner.into());
        self
    }

    /// Set the commit signature.
    pub fn signature(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.signature_name = name.into();
        self.signature_email = email.into();
        self
    }

    fn validate(&self) -> DatabaseResult<()> {
        if self.signature_name.trim().is_empty() || self.signature_email.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig(
                "commit signature needs a name and an email".into(),
            ));
        }
        if matches!(&self.migration_owner, Some(owner) if owner.trim().is_empty()) {
            return Err(DatabaseError::InvalidConfig("migration owner is empty".into()));
        }
        Ok(())
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            lazy_loading: self.lazy_loading,
        }
    }
}

/// The main database handle: a store, the catalog describing it and the
/// declared migration steps.
pub struct Database {
    config: DatabaseConfig,
    store: Arc<dyn Store>,
    catalog: Catalog,
    steps: Vec<MigrationStep>,
    halt: HaltFlag,
}

impl Database {
    /// Open or create a git-backed database at the given path.
    pub fn open(path: impl AsRef<Path>, catalog: Catalog) -> DatabaseResult<Self> {
        Self::open_with_config(DatabaseConfig::new(path.as_ref()), catalog)
    }

    /// Open or create a git-backed database with custom configuration.
    pub fn open_with_config(config: DatabaseConfig, catalog: Catalog) -> DatabaseResult<Self> {
        config.validate()?;
        let signature = GitSignature::new(&config.signature_name, &config.signature_email);
        let store = if config.create_if_missing {
            GitStore::open_or_init(&config.path, signature)?
        } else if config.path.exists() {
            GitStore::open_with_signature(&config.path, signature)?
        } else {
            return Err(DatabaseError::NotFound(config.path.clone()));
        };
        tracing::info!(path = %config.path.display(), types = catalog.all_types().len(), "database opened");
        Ok(Self::with_store(Arc::new(store), catalog, config))
    }

    /// Open the database a manifest describes.
    pub fn from_manifest(config: DatabaseConfig, manifest: &Manifest) -> DatabaseResult<Self> {
        let catalog = manifest.catalog()?;
        Ok(Self::open_with_config(config, catalog)?.with_migrations(manifest.migrations.clone()))
    }

    /// A database over a fresh in-process store.
    pub fn in_memory(catalog: Catalog) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), catalog, DatabaseConfig::default())
    }

    /// A database over any store.
    pub fn with_store(store: Arc<dyn Store>, catalog: Catalog, config: DatabaseConfig) -> Self {
        Self {
            config,
            store,
            catalog,
            steps: Vec::new(),
            halt: HaltFlag::default(),
        }
    }

    /// Declare the migration steps, in the order they apply.
    pub fn with_migrations(mut self, steps: Vec<MigrationStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Open a session. Fails while the database is halted.
    pub fn session(&self) -> DatabaseResult<Session> {
        self.ensure_running()?;
        Ok(Session::with_options(
            Arc::clone(&self.store),
            self.catalog.clone(),
            self.config.session_options(),
        ))
    }

    /// A migrator over the declared steps, sharing this database's halt
    /// state.
    pub fn migrator(&self) -> DatabaseResult<Migrator> {
        self.ensure_running()?;
        let migrator = Migrator::new(
            Arc::clone(&self.store),
            self.catalog.clone(),
            self.steps.clone(),
        )?
        .with_halt(Arc::clone(&self.halt));
        Ok(match &self.config.migration_owner {
            Some(owner) => migrator.with_owner(owner),
            None => migrator,
        })
    }

    /// Why the database is halted, if it is.
    pub fn halted(&self) -> Option<String> {
        self.halt.read().clone()
    }

    /// Resume after an operator resolved a migration conflict.
    pub fn clear_halt(&self) {
        if let Some(reason) = self.halt.write().take() {
            tracing::warn!(reason = %reason, "migration halt cleared");
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn ensure_running(&self) -> DatabaseResult<()> {
        match self.halted() {
            Some(reason) => Err(DatabaseError::Halted(reason)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("store", &self.store.name())
            .field("path", &self.config.path)
            .field("types", &self.catalog.all_types().len())
            .field("steps", &self.steps.len())
            .field("halted", &self.halted().is_some())
            .finish()
    }
}
