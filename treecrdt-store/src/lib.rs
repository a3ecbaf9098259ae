//! Storage for the treecrdt sync core: the `Backend` interface consumed by
//! the sync layer, and a SQLite reference implementation covering the op log,
//! tree index, pending/op-auth sidecars, and sealed-secret rows.

pub mod backend;
pub mod sqlite;

pub use backend::{Backend, PendingOp};
pub use sqlite::{SqliteBackend, StoreError};
