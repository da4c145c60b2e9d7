//! State module for tracking harvest progress
//!
//! # Components
//!
//! - `IdentityStatus`: where an identity stands (pending, processing, retry, completed, failed)
//! - `IdentityStateStore`: persists statuses so interrupted runs resume

mod identity_status;
mod store;

// Re-export main types
pub use identity_status::IdentityStatus;
pub use store::{count_statuses, IdentityStateStore, MemoryStateStore, SqliteStateStore};
