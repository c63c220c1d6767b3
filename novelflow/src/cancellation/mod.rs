//! Cooperative cancellation.
//!
//! Every long-running call in the engine takes a [`CancellationToken`]; the
//! same token is propagated into parallel workers.

mod token;

pub use token::CancellationToken;
