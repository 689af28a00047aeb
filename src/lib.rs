//! Task-scoped database connection pooling and versioned schema migrations.
//!
//! Request-handling code obtains a connection whose identity and transaction
//! state are scoped to the concurrent unit of work currently running, while a
//! bounded number of physical connections is multiplexed across many
//! concurrent units. A migration engine evolves the schema through ordered,
//! auditable steps recorded in a history table.
//!
//! # Architecture
//!
//! - [`conn`] - Connection URL resolution, physical drivers, the task-scoped
//!   registry, and the pooled [`conn::ConnectionManager`].
//! - [`migrate`] - Step files on disk, the history table, the
//!   [`migrate::MigrationRouter`], and the dialect-aware
//!   [`migrate::SchemaMigrator`] operation batch.
//! - [`config`] - CLI arguments and environment variables.
//! - [`error`] - The [`error::DbError`] taxonomy shared by both layers.

pub mod config;
pub mod conn;
pub mod error;
pub mod migrate;

pub use conn::{ConnectionManager, Scope, ScopeId};
pub use error::{DbError, DbResult};
pub use migrate::{MigrationRouter, SchemaMigrator};
