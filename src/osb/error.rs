//! # OSB Errors
//!
//! Errors returned by broker calls and their classification.

use reqwest::StatusCode;

/// Error returned by an Open Service Broker call
#[derive(Debug, thiserror::Error)]
pub enum OsbError {
    /// The broker answered with a status code the operation does not accept
    #[error(
        "Status: {status}; ErrorMessage: {}; Description: {}",
        .error.as_deref().unwrap_or("<nil>"),
        .description.as_deref().unwrap_or("<nil>")
    )]
    Http {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },

    /// The request never produced a response (connect failure, timeout, TLS)
    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The broker response body could not be decoded
    #[error("couldn't decode broker response: {0}")]
    Decode(String),

    /// The client could not be built from the broker credentials
    #[error("{0}")]
    Configuration(String),
}

impl OsbError {
    pub fn http(status: StatusCode) -> Self {
        OsbError::Http {
            status: status.as_u16(),
            error: None,
            description: None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            OsbError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The broker reported a concurrent operation on the same resource (409)
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT.as_u16())
    }

    /// Worth retrying without changing state: a conflict or a broker side failure
    pub fn is_retryable(&self) -> bool {
        self.status()
            .is_some_and(|s| s == StatusCode::CONFLICT.as_u16() || s >= 500)
    }

    /// The broker no longer knows the resource (404 or 410)
    pub fn is_gone(&self) -> bool {
        self.status().is_some_and(|s| {
            s == StatusCode::NOT_FOUND.as_u16() || s == StatusCode::GONE.as_u16()
        })
    }
}

/// True exactly when the error is a broker 409
pub fn is_conflict_osb_error(err: &OsbError) -> bool {
    err.is_conflict()
}

/// Retryable when the error is a broker error that [`OsbError::is_retryable`] accepts
pub fn is_retryable_error(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<OsbError>()
        .is_some_and(OsbError::is_retryable)
}

/// Gone when the error is a broker 404 or 410
pub fn is_deleted_error(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<OsbError>().is_some_and(OsbError::is_gone)
}
