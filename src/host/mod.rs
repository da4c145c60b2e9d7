//! Host handling module
//!
//! This module turns raw service endpoints from the directory into the host
//! names used for grouping, health probing, and fetch requests.

mod normalize;
mod validate;

// Re-export main functions
pub use normalize::normalize_host;
pub use validate::sanitize_host;
