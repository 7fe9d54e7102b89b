//! Bundle port: Source of model snapshots.

use crate::domain::ModelSnapshot;

/// Loads a complete, verified model snapshot.
///
/// Implementations must verify integrity (signatures, hashes, schema) before
/// returning; a snapshot handed out by a store is ready to serve.
pub trait BundleStore: Send + Sync {
    /// Error type for load operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the current snapshot.
    ///
    /// # Errors
    /// Returns error if the bundle is missing, tampered with or inconsistent.
    fn load_snapshot(&self) -> Result<ModelSnapshot, Self::Error>;
}
