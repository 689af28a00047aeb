//! Connection layer: URL resolution, physical drivers, scope registry,
//! and the pooled connection manager.

pub mod driver;
pub mod manager;
pub mod registry;
pub mod url;

pub use driver::DbConnection;
pub use manager::{ConnectionManager, DEFAULT_POOL_CAPACITY};
pub use registry::{ConnectionRegistry, Scope, ScopeId, Slot, SlotHandle};
pub use url::{ConnectInfo, DatabaseType};
