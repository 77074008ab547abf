//! `httpbin-qa` is a QA harness for httpbin-style HTTP echo services.
//!
//! The core is a retrying request pipeline:
//! - [`Transport`] performs exactly one bounded-timeout call;
//! - [`policy`] classifies each outcome and decides whether to back off;
//! - [`QaClient::execute`] loops attempts and reports to [`Metrics`].
//!
//! [`HttpBinApi`] adds typed access to the echo endpoints, [`AppConfig`]
//! loads settings from YAML and the environment.

mod api;
mod client;
mod error;
mod models;
mod options;
mod request;
mod transport;
mod types;

pub mod config;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod report;

pub use api::HttpBinApi;
pub use client::QaClient;
pub use config::{AppConfig, MetricsConfig, ReportingConfig};
pub use error::{QaError, BODY_PREVIEW_CHARS};
pub use metrics::{Metrics, PushMode};
pub use models::{AnythingResponse, HeadersResponse, UuidResponse};
pub use options::{RetryConfig, ServiceOptions, DEFAULT_RETRY_STATUSES};
pub use policy::RetryDecision;
pub use report::{Attachment, DirectoryReport, MemoryReport, ReportSink};
pub use request::{RequestBody, RequestSpec};
pub use transport::{Transport, DEFAULT_USER_AGENT};
pub use types::{AttemptOutcome, AttemptRecord, HttpResponse, OutcomeKind, RetryCause};

pub use reqwest::Method;

pub type Result<T> = std::result::Result<T, QaError>;
