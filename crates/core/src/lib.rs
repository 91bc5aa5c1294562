pub mod error;
pub mod fingerprint;
pub mod ids;
pub mod options;

pub use error::CoreError;
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use ids::*;
pub use options::{StorageMode, StoreOptions};
