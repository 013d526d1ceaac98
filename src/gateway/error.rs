//! The single error shape surfaced by the gateway client.
//!
//! Failures inside a session are collected as [`SessionFailure`] and
//! classified exactly once, when they cross into [`GatewayRpcError`].

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::RemoteError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification assigned to every gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    Remote,
    Timeout,
    Network,
    Protocol,
    Unknown,
}

impl ErrorKind {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Protocol
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Remote => "remote",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by gateway calls and subscriptions.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayRpcError {
    message: String,
    kind: ErrorKind,
    method: String,
    code: Option<String>,
    attempt: u32,
    details: Option<Value>,
    #[source]
    cause: Option<BoxError>,
}

impl GatewayRpcError {
    pub(crate) fn from_failure(failure: SessionFailure, method: &str, attempt: u32) -> Self {
        let kind = classify(&failure);
        let SessionFailure {
            message,
            remote,
            details,
            cause,
        } = failure;
        let (code, details) = match remote {
            Some(remote) => (remote.code, remote.details.or(details)),
            None => (None, details),
        };
        Self {
            message,
            kind,
            method: method.to_string(),
            code,
            attempt,
            details,
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Error code supplied by the gateway, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// 1-based attempt on which this failure happened.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// JSON view suitable for API responses and CLI output.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "type": self.kind,
            "method": self.method,
            "code": self.code,
            "attempt": self.attempt,
            "details": self.details,
        })
    }
}

/// An unclassified failure observed while driving a session.
#[derive(Debug)]
pub(crate) struct SessionFailure {
    pub message: String,
    pub remote: Option<RemoteError>,
    pub details: Option<Value>,
    pub cause: Option<BoxError>,
}

impl SessionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            remote: None,
            details: None,
            cause: None,
        }
    }

    pub fn with_cause<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// A structured `ok: false` error returned by the gateway.
    pub fn remote(context: &str, error: Option<RemoteError>) -> Self {
        let error = error.unwrap_or_default();
        let text = error
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| error.code.clone())
            .unwrap_or_else(|| "request rejected".to_string());
        Self {
            message: format!("{}: {}", context, text),
            remote: Some(error),
            details: None,
            cause: None,
        }
    }

    pub fn timeout(after_ms: u128) -> Self {
        Self::new(format!("gateway timeout after {}ms", after_ms))
    }
}

fn classify(failure: &SessionFailure) -> ErrorKind {
    let mut text = failure.message.to_ascii_lowercase();
    if let Some(code) = failure.remote.as_ref().and_then(|r| r.code.as_deref()) {
        text.push(' ');
        text.push_str(&code.to_ascii_lowercase());
    }
    let mentions = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if mentions(&["unauthorized", "forbidden", "auth"]) {
        ErrorKind::Auth
    } else if failure.remote.is_some() {
        ErrorKind::Remote
    } else if mentions(&["timeout", "timed out"]) {
        ErrorKind::Timeout
    } else if mentions(&[
        "closed",
        "connect",
        "socket",
        "network",
        "econnreset",
        "connection reset",
    ]) {
        ErrorKind::Network
    } else if mentions(&["parse", "json", "protocol"]) {
        ErrorKind::Protocol
    } else {
        ErrorKind::Unknown
    }
}
