//! Request/response attachments for test reports.
//!
//! A [`ReportSink`] is injected into the client as an optional collaborator.
//! Without one, nothing is recorded.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::{HttpResponse, RequestBody, RequestSpec};

/// Response bodies longer than this are cut before being attached.
pub const MAX_ATTACHED_BODY_CHARS: usize = 10_000;

/// A named artifact.
#[derive(Clone, Debug, PartialEq)]
pub enum Attachment {
    Text(String),
    Json(serde_json::Value),
}

impl Attachment {
    fn extension(&self) -> &'static str {
        match self {
            Self::Text(_) => "txt",
            Self::Json(_) => "json",
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// Destination for attachments. Implementations must not fail the call.
pub trait ReportSink: Send + Sync {
    fn attach(&self, name: &str, attachment: Attachment);
}

/// Keeps attachments in memory, in arrival order.
#[derive(Default)]
pub struct MemoryReport {
    entries: Mutex<Vec<(String, Attachment)>>,
}

impl MemoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Attachment)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last attachment recorded under `name`.
    pub fn get(&self, name: &str) -> Option<Attachment> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(entry, _)| entry == name)
            .map(|(_, attachment)| attachment.clone())
    }
}

impl fmt::Debug for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("MemoryReport").field("entries", &len).finish()
    }
}

impl ReportSink for MemoryReport {
    fn attach(&self, name: &str, attachment: Attachment) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_owned(), attachment));
    }
}

/// Writes every attachment to `<dir>/<seq>-<name>.<ext>`.
#[derive(Debug)]
pub struct DirectoryReport {
    dir: PathBuf,
    seq: AtomicUsize,
}

impl DirectoryReport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ReportSink for DirectoryReport {
    fn attach(&self, name: &str, attachment: Attachment) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{seq:06}-{name}.{}", attachment.extension()));
        let written = fs::create_dir_all(&self.dir)
            .and_then(|()| fs::write(&path, attachment.render()));
        if let Err(err) = written {
            tracing::warn!("could not write attachment {}: {err}", path.display());
        }
    }
}

pub(crate) fn attach_request(
    sink: &dyn ReportSink,
    spec: &RequestSpec,
    url: &str,
    headers: &BTreeMap<String, String>,
) {
    sink.attach("request.method", Attachment::Text(spec.method.to_string()));
    sink.attach("request.url", Attachment::Text(url.to_owned()));
    if !headers.is_empty() {
        sink.attach("request.headers", Attachment::Json(to_json(headers)));
    }
    if !spec.query.is_empty() {
        sink.attach("request.params", Attachment::Json(to_json(&spec.query)));
    }
    match &spec.body {
        Some(RequestBody::Json(value)) => {
            sink.attach("request.body", Attachment::Json(value.clone()))
        }
        Some(RequestBody::Form(form)) => sink.attach("request.body", Attachment::Json(to_json(form))),
        None => {}
    }
}

pub(crate) fn attach_response(sink: &dyn ReportSink, response: &HttpResponse) {
    sink.attach(
        "response.status",
        Attachment::Text(response.status.to_string()),
    );
    sink.attach("response.headers", Attachment::Json(to_json(&response.headers)));
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => sink.attach("response.body.json", Attachment::Json(json)),
        Err(_) => sink.attach(
            "response.body",
            Attachment::Text(truncate_body(&response.body)),
        ),
    }
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ATTACHED_BODY_CHARS) {
        Some((idx, _)) => format!("{}\n...<truncated>...", &body[..idx]),
        None => body.to_owned(),
    }
}

fn to_json(map: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}
