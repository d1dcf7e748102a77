pub mod models;
pub mod remote;
pub mod sqlite;

pub use remote::{ChangeEvent, ChangeFeed, ChangeKind, Predicate, RemoteError, RemoteQuery, RemoteStore};
pub use sqlite::SqliteBackend;
