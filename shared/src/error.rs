//! Error taxonomy shared by all FleetLink components

use thiserror::Error;

use crate::codec::CodecError;

/// Errors surfaced by the transport layer and by task bodies.
///
/// `Nack` means the remote refused the request and nothing happened.
/// `NoAnswer` means the request timed out and its effect is unknown; the
/// caller must reconcile by querying state, never by blind resend.
/// `AbortTask` is a clean cooperative stop, not a failure.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("request rejected: {0}")]
    Nack(String),

    #[error("no answer for '{fcn}' from {ip}:{port}")]
    NoAnswer {
        fcn: String,
        ip: String,
        port: u16,
    },

    #[error("task aborted")]
    AbortTask,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

impl LinkError {
    /// Nack with the remote's description text
    pub fn nack(description: impl Into<String>) -> Self {
        Self::Nack(description.into())
    }

    /// True for the cooperative-cancellation variant
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortTask)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
