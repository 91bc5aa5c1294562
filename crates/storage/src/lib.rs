pub mod dialect;
pub mod error;
pub mod mover;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use dialect::{Dialect, Query};
pub use error::StorageError;
pub use mover::{ObjectMover, State};
pub use sqlite::SqliteBackend;
pub use traits::*;
