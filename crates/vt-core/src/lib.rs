//! virtual-tourist/crates/vt-core/src/lib.rs
//!
//! The domain model and port definitions for Virtual Tourist.

pub mod error;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use traits::*;
