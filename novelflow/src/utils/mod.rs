//! Utility functions for id generation and timestamp handling.

pub mod timestamps;

pub use timestamps::{elapsed_ms, now_unix_ms, now_utc, Timestamp};

/// Generates a new random execution/lock id.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
