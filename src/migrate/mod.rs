//! Migration engine: versioned step files, persistent history, and the
//! dialect-aware schema operation batch.

pub mod migrator;
pub mod router;
pub mod store;

pub use migrator::{ColumnDef, Dialect, SchemaMigrator, SchemaOp, dialect_for};
pub use router::MigrationRouter;
pub use store::{HISTORY_TABLE, MigrationStore, split_statements};
