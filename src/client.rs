use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;

use crate::{
    error::preview,
    policy::{self, RetryDecision},
    AttemptOutcome, AttemptRecord, HttpResponse, Metrics, QaError, ReportSink, RequestSpec,
    Result, RetryCause, RetryConfig, ServiceOptions, Transport, BODY_PREVIEW_CHARS,
};

/// Retrying HTTP client for httpbin-style echo services.
///
/// Every call goes through the same loop: invoke the transport once,
/// classify the outcome, then either return, fail, or back off and retry.
#[derive(Clone)]
pub struct QaClient {
    transport: Transport,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for QaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QaClient")
            .field("transport", &self.transport)
            .field("retry", &self.retry)
            .finish()
    }
}

impl QaClient {
    /// Creates a client with its own connection pool and metrics registry.
    pub fn new(service: &ServiceOptions, retry: RetryConfig) -> Result<Self> {
        Ok(Self::from_transport(Transport::new(service)?, retry))
    }

    pub fn from_transport(transport: Transport, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Shares a metrics registry with other clients.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches every request and response to `sink`.
    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.transport = self.transport.with_report_sink(sink);
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Underlying `reqwest` client, e.g. for pushing metrics over the same pool.
    pub fn http(&self) -> &reqwest::Client {
        self.transport.http()
    }

    /// Sends a GET request for `path`.
    pub async fn get(&self, call: &str, path: &str) -> Result<HttpResponse> {
        self.execute(call, &RequestSpec::get(path)).await
    }

    /// Sends a POST request with a JSON body.
    pub async fn post_json(
        &self,
        call: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse> {
        self.execute(call, &RequestSpec::post(path).json(body)).await
    }

    /// Sends a POST request with a form-encoded body.
    pub async fn post_form<I, K, V>(&self, call: &str, path: &str, pairs: I) -> Result<HttpResponse>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.execute(call, &RequestSpec::post(path).form(pairs))
            .await
    }

    /// Executes `spec` with the client's retry configuration.
    ///
    /// `call` identifies the logical call (usually the test name) in metrics.
    pub async fn execute(&self, call: &str, spec: &RequestSpec) -> Result<HttpResponse> {
        self.execute_with_retry(call, spec, &self.retry).await
    }

    /// Executes `spec` with an explicit retry configuration.
    ///
    /// Any completed exchange whose status is not retryable is returned as is,
    /// including 4xx/5xx. Errors are:
    /// - [`QaError::RetriesExhausted`] when the last attempt still got a retryable status;
    /// - the original [`QaError::Transport`] when the last attempt failed at the network layer;
    /// - any non-network error, immediately and without retrying.
    pub async fn execute_with_retry(
        &self,
        call: &str,
        spec: &RequestSpec,
        retry: &RetryConfig,
    ) -> Result<HttpResponse> {
        retry.validate()?;
        let started = Instant::now();
        let result = self.run_attempts(call, spec, retry).await;
        self.metrics.observe_duration(call, started.elapsed());
        result
    }

    async fn run_attempts(
        &self,
        call: &str,
        spec: &RequestSpec,
        retry: &RetryConfig,
    ) -> Result<HttpResponse> {
        let total = retry.attempts;
        let mut attempt = 1u32;
        loop {
            let attempt_started = Instant::now();
            let outcome = policy::classify(self.transport.invoke(spec).await, retry);
            let record = AttemptRecord {
                attempt,
                elapsed: attempt_started.elapsed(),
                kind: outcome.kind(),
            };
            self.metrics.record_attempt(call, &record);

            match policy::evaluate(&outcome, attempt, retry) {
                RetryDecision::Retry(delay) => {
                    if let AttemptOutcome::RetryableFailure(cause) = &outcome {
                        tracing::warn!(
                            call,
                            "attempt {attempt}/{total} failed in {:.1} ms: {} | next retry in {:.2} s",
                            record.elapsed_ms(),
                            preview(&cause.reason(), BODY_PREVIEW_CHARS),
                            delay.as_secs_f64()
                        );
                    }
                    self.metrics.inc_retry(call, 1);
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return finish(call, outcome, &record, total),
            }
        }
    }
}

/// Turns the terminal outcome into the caller-facing result.
fn finish(
    call: &str,
    outcome: AttemptOutcome,
    record: &AttemptRecord,
    total: u32,
) -> Result<HttpResponse> {
    let attempt = record.attempt;
    let elapsed_ms = record.elapsed_ms();
    match outcome {
        AttemptOutcome::Success(response) => {
            tracing::info!(
                call,
                "attempt {attempt}/{total} succeeded in {elapsed_ms:.1} ms (HTTP {})",
                response.status
            );
            Ok(response)
        }
        AttemptOutcome::RetryableFailure(cause) => {
            tracing::error!(
                call,
                "attempt {attempt}/{total} failed in {elapsed_ms:.1} ms (giving up): {}",
                preview(&cause.reason(), BODY_PREVIEW_CHARS)
            );
            match cause {
                RetryCause::Status(response) => Err(QaError::RetriesExhausted {
                    status: response.status,
                    url: response.url,
                    attempts: attempt,
                    body_preview: preview(&response.body, BODY_PREVIEW_CHARS),
                }),
                RetryCause::Network(err) => Err(err),
            }
        }
        AttemptOutcome::FatalFailure(err) => {
            tracing::error!(
                call,
                "attempt {attempt}/{total} failed in {elapsed_ms:.1} ms (not retryable): {}",
                preview(&err.to_string(), BODY_PREVIEW_CHARS)
            );
            Err(err)
        }
    }
}
