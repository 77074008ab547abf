use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use httpbin_qa::{
    Attachment, HttpBinApi, MemoryReport, OutcomeKind, QaClient, QaError, RequestSpec,
    RetryConfig, ServiceOptions, DEFAULT_USER_AGENT,
};
use serde_json::{json, Value as JsonValue};
use tracing_test::traced_test;

const FIXED_UUID: &str = "3f1c2a4e-5b6d-4e7f-8a9b-0c1d2e3f4a5b";

#[derive(Clone, Default)]
struct MockState {
    hits: Arc<Mutex<Vec<Instant>>>,
    flaky: Arc<Mutex<VecDeque<u16>>>,
}

impl MockState {
    fn hit(&self) {
        self.hits
            .lock()
            .expect("hit log mutex must not be poisoned")
            .push(Instant::now());
    }
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn status_handler(
    State(state): State<MockState>,
    Path(code): Path<u16>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.hit();
    let pad = query
        .get("pad")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    (status_code(code), format!("status {code}{}", "x".repeat(pad)))
}

async fn delay_handler(State(state): State<MockState>, Path(secs): Path<u64>) -> impl IntoResponse {
    state.hit();
    tokio::time::sleep(Duration::from_secs(secs)).await;
    Json(json!({ "delayed": secs }))
}

async fn flaky_handler(State(state): State<MockState>) -> impl IntoResponse {
    state.hit();
    let code = state
        .flaky
        .lock()
        .expect("flaky queue mutex must not be poisoned")
        .pop_front()
        .unwrap_or(200);
    (status_code(code), format!("flaky {code}"))
}

fn echo_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_owned()))
        })
        .collect()
}

fn parse_form(body: &str) -> BTreeMap<String, String> {
    reqwest::Url::parse(&format!("http://form.local/?{body}"))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

async fn anything_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(args): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> Json<JsonValue> {
    state.hit();
    let text = String::from_utf8_lossy(&body).into_owned();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let form = if content_type.starts_with("application/x-www-form-urlencoded") {
        parse_form(&text)
    } else {
        BTreeMap::new()
    };
    let json_body = if content_type.starts_with("application/json") {
        serde_json::from_str::<JsonValue>(&text).ok()
    } else {
        None
    };
    let data = if form.is_empty() { text } else { String::new() };

    Json(json!({
        "args": args,
        "data": data,
        "files": {},
        "form": form,
        "headers": echo_headers(&headers),
        "json": json_body,
        "method": method.as_str(),
        "origin": "127.0.0.1",
        "url": format!("http://mock{uri}"),
    }))
}

async fn uuid_handler(State(state): State<MockState>) -> Json<JsonValue> {
    state.hit();
    Json(json!({ "uuid": FIXED_UUID }))
}

async fn headers_handler(State(state): State<MockState>, headers: HeaderMap) -> Json<JsonValue> {
    state.hit();
    Json(json!({ "headers": echo_headers(&headers) }))
}

struct TestServer {
    base_url: String,
    state: MockState,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.state
            .hits
            .lock()
            .expect("hit log mutex must not be poisoned")
            .len()
    }

    fn hit_times(&self) -> Vec<Instant> {
        self.state
            .hits
            .lock()
            .expect("hit log mutex must not be poisoned")
            .clone()
    }

    fn client(&self, retry: RetryConfig) -> QaClient {
        QaClient::new(
            &ServiceOptions::new(&self.base_url, Duration::from_secs(2)),
            retry,
        )
        .expect("client must build")
    }
}

async fn spawn_server(flaky: Vec<u16>) -> TestServer {
    let state = MockState {
        hits: Arc::default(),
        flaky: Arc::new(Mutex::new(flaky.into())),
    };

    let app = Router::new()
        .route("/status/:code", get(status_handler))
        .route("/delay/:secs", get(delay_handler))
        .route("/flaky", get(flaky_handler))
        .route("/anything", any(anything_handler))
        .route("/uuid", get(uuid_handler))
        .route("/headers", get(headers_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        state,
        task,
    }
}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig::default()
        .with_attempts(attempts)
        .with_backoff(Duration::from_millis(1), 1.0)
}

#[tokio::test]
async fn retryable_status_uses_exactly_the_attempt_budget() {
    for attempts in 1..=4 {
        let server = spawn_server(vec![]).await;
        let client = server.client(fast_retry(attempts));

        let err = client
            .get("retry_budget", "/status/503")
            .await
            .expect_err("503 must never succeed");

        match err {
            QaError::RetriesExhausted {
                status,
                attempts: made,
                ref url,
                ..
            } => {
                assert_eq!(status, 503);
                assert_eq!(made, attempts);
                assert!(url.ends_with("/status/503"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert_eq!(server.hits(), attempts as usize);
        assert_eq!(
            client.metrics().retry_count("retry_budget"),
            u64::from(attempts - 1)
        );
    }
}

#[tokio::test]
async fn non_retryable_status_is_returned_after_one_call() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(3));

    let response = client
        .get("no_retry_404", "/status/404")
        .await
        .expect("404 is a completed exchange, not an error");

    assert_eq!(response.status, 404);
    assert_eq!(response.body, "status 404");
    assert_eq!(server.hits(), 1);
    assert_eq!(client.metrics().retry_count("no_retry_404"), 0);
}

#[tokio::test]
async fn retry_on_429_respects_attempts() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(3));

    let err = client
        .get("retry_429", "/status/429")
        .await
        .expect_err("429 must be retried until exhausted");

    assert_eq!(err.status(), Some(429));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn backoff_delays_grow_by_the_multiplier() {
    let server = spawn_server(vec![]).await;
    let client = server.client(
        RetryConfig::default()
            .with_attempts(3)
            .with_backoff(Duration::from_millis(100), 2.0),
    );

    let err = client
        .get("backoff", "/status/503")
        .await
        .expect_err("503 must exhaust retries");
    assert_eq!(err.status(), Some(503));

    let times = server.hit_times();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(100), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(200), "second gap {second_gap:?}");
    assert!(second_gap < Duration::from_secs(2), "second gap {second_gap:?}");
    assert_eq!(client.metrics().retry_count("backoff"), 2);
}

#[tokio::test]
async fn timeouts_are_retried_then_surface_as_transport_errors() {
    let server = spawn_server(vec![]).await;
    let client = QaClient::new(
        &ServiceOptions::new(&server.base_url, Duration::from_millis(100)),
        RetryConfig::default()
            .with_attempts(3)
            .with_backoff(Duration::from_millis(10), 1.0),
    )
    .expect("client must build");

    let err = client
        .get("timeouts", "/delay/2")
        .await
        .expect_err("every attempt must time out");

    match &err {
        QaError::Transport(inner) => assert!(inner.is_timeout()),
        other => panic!("expected transport timeout, got {other:?}"),
    }
    assert!(err.is_network());
    assert_eq!(server.hits(), 3);
    assert_eq!(client.metrics().retry_count("timeouts"), 2);
    assert_eq!(
        client.metrics().attempt_count("timeouts", OutcomeKind::Retryable),
        3
    );
}

#[tokio::test]
async fn refused_connection_is_retried() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind throwaway listener");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);

    let client = QaClient::new(
        &ServiceOptions::new(format!("http://{address}"), Duration::from_secs(1)),
        fast_retry(2),
    )
    .expect("client must build");

    let err = client
        .get("refused", "/anything")
        .await
        .expect_err("nobody is listening");

    assert!(err.is_network(), "unexpected error {err:?}");
    assert_eq!(client.metrics().retry_count("refused"), 1);
    assert_eq!(
        client.metrics().attempt_count("refused", OutcomeKind::Retryable),
        2
    );
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let server = spawn_server(vec![503, 502, 200]).await;
    let client = server.client(fast_retry(3));

    let response = client
        .get("flaky", "/flaky")
        .await
        .expect("third attempt must succeed");

    assert_eq!(response.status, 200);
    assert_eq!(server.hits(), 3);
    assert_eq!(client.metrics().retry_count("flaky"), 2);
    assert_eq!(client.metrics().attempt_count("flaky", OutcomeKind::Success), 1);
    assert_eq!(client.metrics().duration_count("flaky"), 1);
}

#[tokio::test]
async fn first_attempt_success_counts_no_retry() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(3));

    let response = client
        .get("first_try", "/anything")
        .await
        .expect("echo must succeed");

    assert!(response.is_success());
    assert_eq!(server.hits(), 1);
    assert_eq!(client.metrics().retry_count("first_try"), 0);
    assert_eq!(client.metrics().duration_count("first_try"), 1);
}

#[tokio::test]
async fn single_attempt_never_backs_off() {
    let server = spawn_server(vec![]).await;
    let client = server.client(
        RetryConfig::no_retry().with_backoff(Duration::from_secs(30), 2.0),
    );

    let started = Instant::now();
    let err = client
        .get("single", "/status/503")
        .await
        .expect_err("503 with one attempt is exhausted immediately");

    assert!(matches!(err, QaError::RetriesExhausted { attempts: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.hits(), 1);
    assert_eq!(client.metrics().retry_count("single"), 0);
}

#[tokio::test]
async fn exhausted_error_preview_is_bounded() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(2));

    let err = client
        .get("preview", "/status/503?pad=5000")
        .await
        .expect_err("503 must exhaust retries");

    match err {
        QaError::RetriesExhausted { body_preview, .. } => {
            assert!(body_preview.starts_with("status 503"));
            assert!(body_preview.chars().count() <= 200);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_header_is_fatal_and_never_sent() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(3));

    let err = client
        .execute(
            "fatal",
            &RequestSpec::get("/anything").header("bad header", "value"),
        )
        .await
        .expect_err("header name with a space is invalid");

    assert!(matches!(err, QaError::InvalidRequest(_)));
    assert_eq!(server.hits(), 0);
    assert_eq!(client.metrics().retry_count("fatal"), 0);
}

#[tokio::test]
async fn same_request_twice_yields_identical_outcomes() {
    let server = spawn_server(vec![]).await;
    let client = server.client(RetryConfig::no_retry());
    let spec = RequestSpec::get("/anything")
        .query("b", "2")
        .query("a", "1")
        .header("X-Trace", "fixed");

    let first = client.execute("idempotent", &spec).await.expect("first call");
    let second = client.execute("idempotent", &spec).await.expect("second call");

    assert_eq!(first.status, second.status);
    assert_eq!(first.body, second.body);
    let echo: JsonValue = first.json().expect("echo is json");
    assert_eq!(echo["args"], json!({"a": "1", "b": "2"}));
}

#[tokio::test]
async fn concurrent_calls_share_metrics_without_lost_updates() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(3));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("shared", "/status/503").await })
        })
        .collect();
    for task in tasks {
        let result = task.await.expect("task must not panic");
        assert!(result.is_err());
    }

    assert_eq!(server.hits(), 24);
    assert_eq!(client.metrics().retry_count("shared"), 16);
    assert_eq!(client.metrics().duration_count("shared"), 8);
}

#[tokio::test]
async fn api_echoes_json_form_query_and_headers() {
    let server = spawn_server(vec![]).await;
    let api = HttpBinApi::new(server.client(fast_retry(3)), "echo_fidelity");

    let payload = json!({"name": "Kit", "user_id": 42});
    let echoed = api
        .anything_post_json(
            payload.clone(),
            &BTreeMap::from([("X-Case".to_owned(), "json".to_owned())]),
        )
        .await
        .expect("json echo");
    assert_eq!(echoed.method, "POST");
    assert_eq!(echoed.json, Some(payload));
    assert_eq!(echoed.header("x-case"), Some("json"));

    let form = api
        .anything_post_form([("city", "Oslo"), ("note", "a b&c")])
        .await
        .expect("form echo");
    assert_eq!(form.form.get("city"), Some(&json!("Oslo")));
    assert_eq!(form.form.get("note"), Some(&json!("a b&c")));
    assert_eq!(form.json, None);

    let raw = api
        .anything_get(
            &BTreeMap::from([("q".to_owned(), "rust".to_owned())]),
            &BTreeMap::new(),
            Some("application/json"),
        )
        .await
        .expect("get echo");
    let echo: JsonValue = raw.json().expect("echo is json");
    assert_eq!(echo["args"]["q"], "rust");
    assert_eq!(echo["headers"]["accept"], "application/json");

    let headers = api.headers().await.expect("headers echo");
    assert_eq!(headers.headers.get("user-agent"), Some(&json!(DEFAULT_USER_AGENT)));

    let uuid = api.uuid().await.expect("uuid");
    assert_eq!(uuid.uuid.to_string(), FIXED_UUID);
    assert_eq!(api.client().metrics().retry_count("echo_fidelity"), 0);
}

#[tokio::test]
async fn api_status_and_delay_helpers_return_raw_responses() {
    let server = spawn_server(vec![]).await;
    let api = HttpBinApi::new(server.client(fast_retry(2)), "helpers");

    let not_found = api.status(404).await.expect("404 is returned as-is");
    assert_eq!(not_found.status, 404);

    let delayed = api.delay(0).await.expect("zero delay answers at once");
    assert!(delayed.is_success());

    let err = api.status(502).await.expect_err("502 is retryable");
    assert_eq!(err.status(), Some(502));
}

#[tokio::test]
async fn report_sink_receives_request_and_response_attachments() {
    let server = spawn_server(vec![]).await;
    let report = Arc::new(MemoryReport::new());
    let client = server
        .client(fast_retry(1))
        .with_report_sink(report.clone());

    client
        .post_json("reported", "/anything", json!({"k": "v"}))
        .await
        .expect("echo must succeed");

    assert_eq!(
        report.get("request.method"),
        Some(Attachment::Text("POST".to_owned()))
    );
    assert_eq!(
        report.get("request.url"),
        Some(Attachment::Text(format!("{}/anything", server.base_url)))
    );
    assert_eq!(
        report.get("response.status"),
        Some(Attachment::Text("200".to_owned()))
    );
    match report.get("response.body.json") {
        Some(Attachment::Json(body)) => assert_eq!(body["json"], json!({"k": "v"})),
        other => panic!("expected json body attachment, got {other:?}"),
    }
}

#[tokio::test]
#[traced_test]
async fn attempts_are_logged_with_index_and_budget() {
    let server = spawn_server(vec![]).await;
    let client = server.client(fast_retry(2));

    let _ = client.get("logged", "/status/503").await;

    assert!(logs_contain("attempt 1/2 failed"));
    assert!(logs_contain("next retry in"));
    assert!(logs_contain("attempt 2/2 failed"));
    assert!(logs_contain("giving up"));
}
