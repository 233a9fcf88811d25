//! Unified error handling for replicad.
//!
//! Object access and wire errors live in `replicad-proto`; this module
//! holds the server-side hierarchy, each with a static code for metric
//! labels.

use replicad_proto::{Oid, ProtoError};
use thiserror::Error;

// ============================================================================
// Invocation Errors (provider methods)
// ============================================================================

/// Outcome of a failed provider method.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Domain failure; the cause is sent to the client verbatim.
    #[error("{0}")]
    Failed(String),

    /// Anything unexpected. Logged server-side, reported to the client
    /// only as the generic internal error code.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl InvocationError {
    /// Shorthand for a domain failure.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed(cause.into())
    }

    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Internal(_) => "internal",
        }
    }
}

/// Provider registration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("a provider for module {0} is already registered")]
    DuplicateModule(String),
}

// ============================================================================
// Object Manager Errors
// ============================================================================

/// Transaction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("object {0} already has an open transaction")]
    AlreadyInTransaction(Oid),
}

// ============================================================================
// Shutdown Errors
// ============================================================================

/// Shutdown graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("unknown shutdown participant {0}")]
    UnknownParticipant(usize),

    #[error("constraint between {0} and {1} would create a cycle")]
    Cycle(String, String),

    #[error("shutdown already performed")]
    AlreadyShutDown,
}

impl ShutdownError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownParticipant(_) => "unknown_participant",
            Self::Cycle(..) => "cycle",
            Self::AlreadyShutDown => "already_shut_down",
        }
    }
}

/// Reboot scheduling errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebootError {
    #[error("no reboot lock with id {0}")]
    NoSuchLock(u32),
}

impl RebootError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSuchLock(_) => "no_such_lock",
        }
    }
}

// ============================================================================
// Session and Delivery Errors
// ============================================================================

/// Failure to hand a message to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    QueueFull,
}

impl DeliveryError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Connection handshake and session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("first message was {0}, expected authenticate")]
    NotAuthenticated(&'static str),

    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl SessionError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated(_) => "not_authenticated",
            Self::Rejected(_) => "rejected",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::ClosedDuringHandshake => "closed_during_handshake",
            Self::Proto(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_wrap_anyhow() {
        let err: InvocationError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.error_code(), "internal");
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn failed_displays_cause_only() {
        assert_eq!(InvocationError::failed("m.bad_item").to_string(), "m.bad_item");
    }
}
