//! Error types for the operation engine
//!
//! `OperationError` is the taxonomy every operation fails with; it is cloned
//! freely so composites can surface a child's failure unchanged.
//! `SessionError` covers talking to the control plane itself.

use std::fmt;
use std::time::Duration;

/// Why an operation did not complete
#[derive(Debug, Clone, PartialEq)]
pub enum OperationError {
    /// The session's role lacks one or more required methods; no remote call was made
    PermissionDenied { missing: Vec<String> },

    /// Invalid input, object or connection detected before calling out
    LocalPrecondition { reason: String },

    /// The remote task reported an error; details are kept verbatim and in order
    RemoteTaskFailure { message: String, details: Vec<String> },

    /// A cancellation request was honoured
    Cancelled,

    /// Polling a remote task exceeded its bound
    Timeout { task: String, waited: Duration },

    /// The control plane could not be reached or refused the call
    Session(SessionError),
}

/// Control-plane transport error variants
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Connection to the control plane failed
    ConnectionFailed { endpoint: String, reason: String },

    /// The control plane answered with something unreadable
    InvalidResponse { endpoint: String, reason: String },

    /// The control plane refused the call (unknown method, restricted feature, ...)
    Rejected { method: String, message: String },

    /// The referenced task does not exist (anymore)
    UnknownTask { task: String },
}

impl OperationError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        OperationError::LocalPrecondition {
            reason: reason.into(),
        }
    }

    /// One-line summary suitable for a progress display
    pub fn short_message(&self) -> String {
        match self {
            OperationError::PermissionDenied { .. } => "Permission denied".to_string(),
            OperationError::LocalPrecondition { .. } => "Invalid request".to_string(),
            OperationError::RemoteTaskFailure { message, .. } => message.clone(),
            OperationError::Cancelled => "Cancelled".to_string(),
            OperationError::Timeout { .. } => "Timed out".to_string(),
            OperationError::Session(_) => "Connection error".to_string(),
        }
    }

    /// Ordered structured details, when the failure carries any
    pub fn details(&self) -> Vec<String> {
        match self {
            OperationError::PermissionDenied { missing } => missing.clone(),
            OperationError::RemoteTaskFailure { details, .. } => details.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::PermissionDenied { missing } => {
                write!(f, "Permission denied for: {}", missing.join(", "))
            }
            OperationError::LocalPrecondition { reason } => {
                write!(f, "Precondition failed: {}", reason)
            }
            OperationError::RemoteTaskFailure { message, details } => {
                if details.is_empty() {
                    write!(f, "Remote task failed: {}", message)
                } else {
                    write!(f, "Remote task failed: {} [{}]", message, details.join(", "))
                }
            }
            OperationError::Cancelled => write!(f, "Operation cancelled"),
            OperationError::Timeout { task, waited } => {
                write!(f, "Task {} did not finish within {}s", task, waited.as_secs())
            }
            OperationError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectionFailed { endpoint, reason } => {
                write!(f, "Connection to {} failed: {}", endpoint, reason)
            }
            SessionError::InvalidResponse { endpoint, reason } => {
                write!(f, "Invalid response from {}: {}", endpoint, reason)
            }
            SessionError::Rejected { method, message } => {
                write!(f, "Call {} rejected: {}", method, message)
            }
            SessionError::UnknownTask { task } => write!(f, "Task {} not found", task),
        }
    }
}

impl std::error::Error for OperationError {}
impl std::error::Error for SessionError {}

impl From<SessionError> for OperationError {
    fn from(err: SessionError) -> Self {
        OperationError::Session(err)
    }
}
