//! virtual-tourist/crates/vt-fetch/src/lib.rs
//!
//! Orchestration on top of the ports: deciding when to search, persisting
//! hits, downloading images once, and tearing pins down cleanly.

pub mod coordinator;
pub mod lifecycle;
mod materialize;
mod single_flight;

pub use coordinator::{EnsureOutcome, FetchCoordinator, FetchOptions, FetchState, RefreshOutcome};
pub use lifecycle::{DeleteReport, PinLifecycleManager, SweepReport};
