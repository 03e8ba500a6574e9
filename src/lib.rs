//! gitorm - an object persistence core over pluggable stores
//!
//! Record types are declared once in a [`catalog::Catalog`]. A
//! [`session::Session`] tracks the instances it loads: one instance per
//! (type, key), edits classified as added, modified or deleted, and a
//! single all-or-nothing commit guarded by an optimistic check. Queries
//! are built from typed predicates and can load associations eagerly.
//! Schema changes go through versioned migration steps recorded in the
//! store.
//!
//! Two stores ship with the crate: an in-process [`storage::MemoryStore`]
//! and [`storage::GitStore`], which keeps every row as a JSON blob in a git
//! repository and turns each commit into a git commit.
//!
//! # Example
//!
//! ```no_run
//! use gitorm::catalog::{Catalog, DataType, RecordTypeBuilder};
//! use gitorm::db::Database;
//! use gitorm::query::Predicate;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Catalog::builder()
//!     .register(
//!         RecordTypeBuilder::new("customer")
//!             .generated_key("id", DataType::Integer)
//!             .add_required_field("name", DataType::Text)
//!             .build()?,
//!     )
//!     .build()?;
//! let db = Database::open("./shop", catalog)?;
//!
//! let mut session = db.session()?;
//! let ada = session
//!     .query("customer")
//!     .filter(Predicate::eq("name", "Ada"))
//!     .first()?;
//! if let Some(ada) = ada {
//!     session.set(ada, "name", "Ada Lovelace")?;
//! }
//! session.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod db;
pub mod migration;
pub mod query;
pub mod session;
pub mod storage;
