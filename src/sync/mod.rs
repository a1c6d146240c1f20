//! Reconciliation pacing
//!
//! [`runner`] coalesces "please sync" requests into bounded-frequency
//! reconciliation passes; [`tracker`] collapses the service change stream
//! so each pass sees one (oldest-previous, newest-current) pair per
//! service.

pub mod runner;
pub mod tracker;

pub use runner::BoundedFrequencyRunner;
pub use tracker::{ServiceChange, ServiceChangeTracker};
