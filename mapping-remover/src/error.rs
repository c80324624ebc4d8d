// Error taxonomy shared by the remote client, the mapping services and the TUI.
//
// Application plumbing (config, logging, terminal) stays on anyhow::Result; everything that
// talks to Dataverse returns ServiceError so callers can tell a cancel from a real failure.

use std::fmt;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Malformed table / field identifiers. Raised before any remote call.
    #[error("{0}")]
    InvalidArgument(String),

    /// Aborted by a newer operation of the same kind or by an explicit cancel.
    #[error("operation was cancelled")]
    Cancelled,

    /// Anything the remote store (or the identity provider) rejected, plus transport and
    /// decode failures.
    #[error("{}", RemoteDisplay(.status, .code, .message))]
    RemoteFailure {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
}

struct RemoteDisplay<'a>(&'a Option<u16>, &'a Option<String>, &'a String);

impl fmt::Display for RemoteDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0, self.1) {
            (Some(status), Some(code)) => write!(f, "{} (HTTP {}, {})", self.2, status, code),
            (Some(status), None) => write!(f, "{} (HTTP {})", self.2, status),
            (None, Some(code)) => write!(f, "{} ({})", self.2, code),
            (None, None) => write!(f, "{}", self.2),
        }
    }
}

impl ServiceError {
    pub fn remote(message: impl Into<String>) -> Self {
        ServiceError::RemoteFailure {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn remote_status(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        ServiceError::RemoteFailure {
            status: Some(status),
            code,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServiceError::Cancelled)
    }

    /// Short title for message modals.
    pub fn title(&self) -> &'static str {
        match self {
            ServiceError::InvalidArgument(_) => "Input Error",
            ServiceError::Cancelled => "Canceled",
            ServiceError::RemoteFailure { .. } => "Error",
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            "The request to Dataverse timed out".to_string()
        } else if err.is_connect() {
            format!("Unable to reach Dataverse: {}", err)
        } else {
            err.to_string()
        };
        ServiceError::RemoteFailure {
            status,
            code: None,
            message,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::remote(format!("Unexpected response payload: {}", err))
    }
}
