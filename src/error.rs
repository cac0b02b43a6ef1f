//! Error taxonomy for the control surface.
//!
//! Every operation reports one of a closed set of kinds; the HTTP layer
//! maps kinds to status codes and serializes `{kind, message}`. Internal
//! errors carry a correlation id that also lands in the logs.

use netkit::NetError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    AddressConflict,
    Privilege,
    KernelError,
    ResourceExhausted,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::AddressConflict => 409,
            ErrorKind::Privilege => 403,
            ErrorKind::KernelError | ErrorKind::Internal => 500,
            ErrorKind::ResourceExhausted => 503,
            ErrorKind::Timeout => 504,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct EmuError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, EmuError>;

impl EmuError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn address_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AddressConflict, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// A bug. Logs the full message under a correlation id and returns an
    /// error that exposes only the id.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        let correlation = correlation_id();
        error!(correlation, %message, "internal error");
        Self::new(
            ErrorKind::Internal,
            format!("internal error (correlation id {correlation})"),
        )
    }
}

impl From<NetError> for EmuError {
    fn from(err: NetError) -> Self {
        let kind = match &err {
            NetError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            NetError::NotFound(_) => ErrorKind::NotFound,
            NetError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            NetError::Privilege(_) => ErrorKind::Privilege,
            NetError::Kernel(_) => ErrorKind::KernelError,
        };
        Self::new(kind, err.to_string())
    }
}

fn correlation_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:08x}-{:04x}", now.as_secs() as u32, now.subsec_nanos() & 0xffff)
}
