//! Error types for the recoverable API surface.
//!
//! Contract violations (draining a loop from a foreign thread) panic instead;
//! see the module docs on [`crate::event_loop`].

use thiserror::Error;

/// Errors raised while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The signal reference does not point inside the sender value, so the
    /// connection would outlive or misattribute its signal.
    #[error("signal is not a member of the sender object")]
    SignalNotMember,
}

/// Errors raised while spawning a coroutine context.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The fiber stack could not be allocated.
    #[error("failed to allocate coroutine stack: {0}")]
    Stack(#[from] std::io::Error),
}
