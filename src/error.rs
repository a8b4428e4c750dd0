//! Request fault classification shared by the parser and the connection handler.
//! Transport faults are deliberately not modeled here: socket read/write errors
//! propagate as plain I/O errors, terminate only the affected connection, and
//! are never surfaced on the wire.

use std::fmt::{Display, Formatter};

use crate::server::request::Response;

#[derive(Debug, Clone)]
pub enum ServiceError {
    /// The request bytes do not match the line grammar.
    Malformed { message: String },
    /// Unexpected fault inside the request path (a bug, not a client error).
    Internal { message: String },
}

impl ServiceError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        ServiceError::Malformed { message: msg.into() }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ServiceError::Internal { message: msg.into() }
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Malformed { message } | ServiceError::Internal { message } => {
                message.as_str()
            }
        }
    }

    /// Map to the single-line wire response. Both kinds answer `ERROR`; the
    /// distinction matters only for logging and for keeping refusals (`FAIL`)
    /// out of this enum entirely.
    pub fn wire_code(&self) -> Response {
        match self {
            ServiceError::Malformed { .. } | ServiceError::Internal { .. } => Response::Error,
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Malformed { message } => write!(f, "malformed request: {}", message),
            ServiceError::Internal { message } => write!(f, "internal fault: {}", message),
        }
    }
}

impl std::error::Error for ServiceError {}

pub type ServiceResult<T> = Result<T, ServiceError>;
