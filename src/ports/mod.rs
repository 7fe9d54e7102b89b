//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the decision core and external systems (bundle storage, review queue).

mod bundle;
mod review;

pub use bundle::BundleStore;
pub use review::{DiscardReviews, ReviewPage, ReviewSink};
