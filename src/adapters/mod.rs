//! Adapters layer: Concrete implementations of ports.
//!
//! - `trees`: gradient-boosted tree scorers read from bundle JSON
//! - `bundle`: signed on-disk model bundles
//! - `sqlite`: SQLite review queue
//! - `sanitize`: PII filtering for logs

pub mod bundle;
pub mod sanitize;
pub mod sqlite;
pub mod trees;

pub use bundle::{BundleError, FsBundleStore, LoadOptions};
pub use sqlite::{ReviewStoreError, SqliteReviewQueue};
pub use trees::{TreeModel, TreeModelError};
