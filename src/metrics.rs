//! Process-wide retry/attempt counters and call-duration histograms.
//!
//! Series are keyed by an explicit call identity (usually the test name)
//! and exported in the Prometheus text format, either scraped via
//! [`Metrics::render`] or pushed to a Pushgateway with [`Metrics::push`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;

use crate::{AttemptRecord, OutcomeKind, QaError, Result};

/// Upper bounds of the duration histogram buckets, in seconds.
pub const DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

const RETRIES: &str = "test_retries_total";
const ATTEMPTS: &str = "test_attempts_total";
const DURATION: &str = "test_duration_seconds";

/// How a push interacts with metrics already stored under the grouping key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushMode {
    /// Merge into the group (`POST`).
    #[default]
    Add,
    /// Replace the whole group (`PUT`).
    Replace,
}

#[derive(Clone, Debug, Default)]
struct Histogram {
    buckets: [u64; DURATION_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, secs: f64) {
        if let Some(idx) = DURATION_BUCKETS.iter().position(|bound| secs <= *bound) {
            self.buckets[idx] += 1;
        }
        self.sum += secs;
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct Registry {
    retries: BTreeMap<String, u64>,
    attempts: BTreeMap<(String, OutcomeKind), u64>,
    durations: BTreeMap<String, Histogram>,
}

/// Thread-safe metrics registry, shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    registry: Mutex<Registry>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut guard = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Counts `n` retries for `call`. Zero is ignored.
    pub fn inc_retry(&self, call: &str, n: u64) {
        if n == 0 {
            return;
        }
        self.with_registry(|reg| *reg.retries.entry(call.to_owned()).or_default() += n);
    }

    pub fn retry_count(&self, call: &str) -> u64 {
        self.with_registry(|reg| reg.retries.get(call).copied().unwrap_or(0))
    }

    pub fn record_attempt(&self, call: &str, record: &AttemptRecord) {
        self.with_registry(|reg| {
            *reg.attempts
                .entry((call.to_owned(), record.kind))
                .or_default() += 1;
        });
    }

    pub fn attempt_count(&self, call: &str, kind: OutcomeKind) -> u64 {
        self.with_registry(|reg| {
            reg.attempts
                .get(&(call.to_owned(), kind))
                .copied()
                .unwrap_or(0)
        })
    }

    pub fn observe_duration(&self, call: &str, elapsed: Duration) {
        self.with_registry(|reg| {
            reg.durations
                .entry(call.to_owned())
                .or_default()
                .observe(elapsed.as_secs_f64())
        });
    }

    /// Number of durations observed for `call`.
    pub fn duration_count(&self, call: &str) -> u64 {
        self.with_registry(|reg| reg.durations.get(call).map_or(0, |h| h.count))
    }

    /// Observes the time until the returned guard is dropped.
    pub fn track_duration(&self, call: impl Into<String>) -> DurationGuard<'_> {
        DurationGuard {
            metrics: self,
            call: call.into(),
            started: Instant::now(),
        }
    }

    /// Renders all series in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.with_registry(|reg| {
            let mut out = String::new();

            header(
                &mut out,
                RETRIES,
                "Total number of retry attempts executed (excluding the first attempt).",
                "counter",
            );
            for (call, value) in &reg.retries {
                let _ = writeln!(out, "{RETRIES}{{test_name=\"{}\"}} {value}", escape(call));
            }

            header(
                &mut out,
                ATTEMPTS,
                "Total number of attempts by classified outcome.",
                "counter",
            );
            for ((call, kind), value) in &reg.attempts {
                let _ = writeln!(
                    out,
                    "{ATTEMPTS}{{test_name=\"{}\",outcome=\"{kind}\"}} {value}",
                    escape(call)
                );
            }

            header(&mut out, DURATION, "Test duration in seconds.", "histogram");
            for (call, hist) in &reg.durations {
                let call = escape(call);
                let mut cumulative = 0;
                for (bound, count) in DURATION_BUCKETS.iter().zip(hist.buckets) {
                    cumulative += count;
                    let _ = writeln!(
                        out,
                        "{DURATION}_bucket{{test_name=\"{call}\",le=\"{bound:?}\"}} {cumulative}"
                    );
                }
                let _ = writeln!(
                    out,
                    "{DURATION}_bucket{{test_name=\"{call}\",le=\"+Inf\"}} {}",
                    hist.count
                );
                let _ = writeln!(out, "{DURATION}_sum{{test_name=\"{call}\"}} {:?}", hist.sum);
                let _ = writeln!(out, "{DURATION}_count{{test_name=\"{call}\"}} {}", hist.count);
            }

            out
        })
    }

    /// Pushes the current rendering to a Pushgateway.
    ///
    /// Local state is left untouched, so pushing repeatedly is safe.
    pub async fn push(
        &self,
        http: &reqwest::Client,
        gateway_url: &str,
        job: &str,
        grouping_key: &BTreeMap<String, String>,
        mode: PushMode,
    ) -> Result<()> {
        let url = push_url(gateway_url, job, grouping_key)?;
        let request = match mode {
            PushMode::Add => http.post(url),
            PushMode::Replace => http.put(url),
        };

        let response = request
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(self.render())
            .send()
            .await
            .map_err(QaError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QaError::Http {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!("pushed metrics for job {job} ({mode:?})");
        Ok(())
    }
}

/// Records the elapsed time into the duration histogram when dropped.
#[must_use = "the duration is recorded when the guard is dropped"]
pub struct DurationGuard<'a> {
    metrics: &'a Metrics,
    call: String,
    started: Instant,
}

impl Drop for DurationGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_duration(&self.call, self.started.elapsed());
    }
}

/// `{instance: $HOSTNAME, repo: $GITHUB_REPOSITORY}`, each defaulting to `local`.
pub fn default_grouping_key(env: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
    let value = |name: &str| {
        env(name)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "local".to_owned())
    };
    BTreeMap::from([
        ("instance".to_owned(), value("HOSTNAME")),
        ("repo".to_owned(), value("GITHUB_REPOSITORY")),
    ])
}

fn push_url(
    gateway_url: &str,
    job: &str,
    grouping_key: &BTreeMap<String, String>,
) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(gateway_url).map_err(|err| {
        QaError::InvalidRequest(format!("invalid pushgateway url '{gateway_url}': {err}"))
    })?;
    if job.is_empty() {
        return Err(QaError::InvalidRequest("metrics job name is empty".to_owned()));
    }
    {
        let mut segments = url.path_segments_mut().map_err(|()| {
            QaError::InvalidRequest(format!("pushgateway url '{gateway_url}' cannot be a base"))
        })?;
        segments.pop_if_empty().extend(["metrics", "job", job]);
        for (label, value) in grouping_key {
            if value.is_empty() {
                return Err(QaError::InvalidRequest(format!(
                    "grouping key label '{label}' has an empty value"
                )));
            }
            segments.push(label).push(value);
        }
    }
    Ok(url)
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
