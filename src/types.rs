use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::{error::preview, QaError, Result, BODY_PREVIEW_CHARS};

/// A completed HTTP exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    /// Response headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|err| {
            QaError::Decode(format!(
                "invalid JSON from {}: {err}; body: {}",
                self.url,
                preview(&self.body, BODY_PREVIEW_CHARS)
            ))
        })
    }

    /// Turns a non-2xx response into [`QaError::Http`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(QaError::Http {
                status: self.status,
                body: self.body,
            })
        }
    }
}

/// Why an attempt may be retried.
#[derive(Debug)]
pub enum RetryCause {
    /// The target answered with a configured retryable status.
    Status(HttpResponse),
    /// Network-layer failure: timeout, refused connection, protocol error.
    Network(QaError),
}

impl RetryCause {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(response) => Some(response.status),
            Self::Network(err) => err.status(),
        }
    }

    /// Short human-readable reason, used in attempt logs.
    pub fn reason(&self) -> String {
        match self {
            Self::Status(response) => format!(
                "retryable HTTP {} for {}. Body preview: {}",
                response.status,
                response.url,
                preview(&response.body, BODY_PREVIEW_CHARS)
            ),
            Self::Network(err) => err.to_string(),
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Completed exchange to hand back to the caller, whatever its status.
    Success(HttpResponse),
    RetryableFailure(RetryCause),
    /// Never retried.
    FatalFailure(QaError),
}

impl AttemptOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::RetryableFailure(_) => OutcomeKind::Retryable,
            Self::FatalFailure(_) => OutcomeKind::Fatal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutcomeKind {
    Success,
    Retryable,
    Fatal,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry for a single attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt index.
    pub attempt: u32,
    pub elapsed: Duration,
    pub kind: OutcomeKind,
}

impl AttemptRecord {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}
