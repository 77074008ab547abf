use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

use crate::{
    report::{self, ReportSink},
    request::join_url,
    HttpResponse, QaError, RequestBody, RequestSpec, Result, ServiceOptions,
};

/// User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("httpbin-qa/", env!("CARGO_PKG_VERSION"));

/// Performs exactly one network call per [`Transport::invoke`]; never retries.
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    report: Option<Arc<dyn ReportSink>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("report", &self.report.is_some())
            .finish()
    }
}

impl Transport {
    /// Builds a transport with its own pooled `reqwest::Client`.
    pub fn new(service: &ServiceOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(QaError::Transport)?;
        Ok(Self::with_http(http, service))
    }

    /// Reuses an existing client and its connection pool.
    pub fn with_http(http: reqwest::Client, service: &ServiceOptions) -> Self {
        Self {
            http,
            base_url: service.base_url.clone(),
            timeout: service.timeout,
            report: None,
        }
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report = Some(sink);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Sends `spec` once, bounded by the per-call timeout.
    ///
    /// Any completed exchange is `Ok`, whatever its status. Requests that
    /// cannot be built fail with [`QaError::InvalidRequest`] before any I/O.
    pub async fn invoke(&self, spec: &RequestSpec) -> Result<HttpResponse> {
        let url = join_url(&self.base_url, &spec.path);
        let parsed = reqwest::Url::parse(&url)
            .map_err(|err| QaError::InvalidRequest(format!("invalid url '{url}': {err}")))?;
        let headers = build_headers(&spec.headers)?;

        tracing::info!("HTTP {} {}", spec.method, url);
        if let Some(sink) = &self.report {
            report::attach_request(sink.as_ref(), spec, &url, &reported_headers(&spec.headers));
        }

        let mut request = self
            .http
            .request(spec.method.clone(), parsed)
            .headers(headers)
            .timeout(self.timeout);
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        request = match &spec.body {
            Some(RequestBody::Json(value)) => request.json(value),
            Some(RequestBody::Form(form)) => request.form(form),
            None => request,
        };

        let response = request.send().await.map_err(|err| {
            if err.is_builder() {
                QaError::InvalidRequest(err.to_string())
            } else {
                QaError::Transport(err)
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = collect_headers(response.headers());
        let body = response.text().await.map_err(QaError::Transport)?;
        let response = HttpResponse {
            status,
            url: final_url,
            headers,
            body,
        };

        if let Some(sink) = &self.report {
            report::attach_response(sink.as_ref(), &response);
        }
        Ok(response)
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| QaError::InvalidRequest(format!("invalid header name '{name}': {err}")))?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            QaError::InvalidRequest(format!("invalid value for header '{name}': {err}"))
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Headers as they go on the wire: default User-Agent first, caller entries
/// override it. Names are lowercased so overrides never show up twice.
fn reported_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut shown = BTreeMap::from([(USER_AGENT.to_string(), DEFAULT_USER_AGENT.to_owned())]);
    shown.extend(
        headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone())),
    );
    shown
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
