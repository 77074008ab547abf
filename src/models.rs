//! Strict response models for the httpbin endpoints.
//!
//! Unknown fields are rejected so that contract drift fails loudly.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Body of `/anything`: the echoed request.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnythingResponse {
    #[serde(default)]
    pub args: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub files: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub form: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub headers: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub json: Option<JsonValue>,
    pub method: String,
    pub origin: String,
    pub url: String,
}

impl AnythingResponse {
    /// Echoed header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_str())
    }
}

/// Body of `/uuid`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UuidResponse {
    pub uuid: Uuid,
}

/// Body of `/headers`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadersResponse {
    pub headers: BTreeMap<String, JsonValue>,
}
