//! Network transport seam.
//!
//! The runtime hands a serialized request body to a [`NetworkTransport`] and
//! gets raw response bytes back. Concrete HTTP clients live outside this
//! crate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use strata_core::StrataError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub operation_name: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<Vec<u8>>,
    },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Request timed out after {millis}ms")]
    Timeout { millis: u64 },
}

impl From<TransportError> for StrataError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Http {
                status,
                message,
                body,
            } => StrataError::Http {
                status,
                message,
                body: body.map(|b| String::from_utf8_lossy(&b).into_owned()),
            },
            other => StrataError::Network {
                reason: other.to_string(),
            },
        }
    }
}

/// Executes one serialized request.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<Vec<u8>, TransportError>;
}
