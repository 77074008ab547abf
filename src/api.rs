use std::collections::BTreeMap;

use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::{
    AnythingResponse, HeadersResponse, HttpResponse, QaClient, QaError, RequestSpec, Result,
    UuidResponse,
};

/// Typed access to the httpbin endpoints, attributed to one call identity.
#[derive(Clone, Debug)]
pub struct HttpBinApi {
    client: QaClient,
    call: String,
}

impl HttpBinApi {
    pub fn new(client: QaClient, call: impl Into<String>) -> Self {
        Self {
            client,
            call: call.into(),
        }
    }

    pub fn client(&self) -> &QaClient {
        &self.client
    }

    pub fn call(&self) -> &str {
        &self.call
    }

    /// `GET /uuid`, requiring a version-4 UUID.
    pub async fn uuid(&self) -> Result<UuidResponse> {
        let spec = RequestSpec::get("/uuid").header(ACCEPT.as_str(), "application/json");
        let parsed: UuidResponse = self.fetch(&spec).await?.json()?;
        if parsed.uuid.get_version_num() != 4 {
            return Err(QaError::Decode(format!(
                "expected a version 4 uuid, got {}",
                parsed.uuid
            )));
        }
        Ok(parsed)
    }

    /// `GET /anything`; the raw response is returned for content negotiation checks.
    pub async fn anything_get(
        &self,
        params: &BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        accept: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut spec = RequestSpec::get("/anything")
            .queries(params.clone())
            .headers(headers.clone());
        if let Some(accept) = accept {
            spec = spec.header(ACCEPT.as_str(), accept);
        }
        self.client.execute(&self.call, &spec).await
    }

    /// `POST /anything` with a JSON payload.
    pub async fn anything_post_json(
        &self,
        payload: serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<AnythingResponse> {
        let spec = RequestSpec::post("/anything")
            .header(CONTENT_TYPE.as_str(), "application/json")
            .headers(headers.clone())
            .json(payload);
        self.fetch(&spec).await?.json()
    }

    /// `POST /anything` with a form-encoded payload.
    pub async fn anything_post_form<I, K, V>(&self, pairs: I) -> Result<AnythingResponse>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let spec = RequestSpec::post("/anything").form(pairs);
        self.fetch(&spec).await?.json()
    }

    /// `GET /headers`.
    pub async fn headers(&self) -> Result<HeadersResponse> {
        let spec = RequestSpec::get("/headers").header(ACCEPT.as_str(), "application/json");
        self.fetch(&spec).await?.json()
    }

    /// `GET /status/{code}`; the target answers with the requested status.
    pub async fn status(&self, code: u16) -> Result<HttpResponse> {
        self.client
            .execute(&self.call, &RequestSpec::get(format!("/status/{code}")))
            .await
    }

    /// `GET /delay/{seconds}`; the target waits before answering.
    pub async fn delay(&self, seconds: u32) -> Result<HttpResponse> {
        self.client
            .execute(&self.call, &RequestSpec::get(format!("/delay/{seconds}")))
            .await
    }

    async fn fetch(&self, spec: &RequestSpec) -> Result<HttpResponse> {
        self.client
            .execute(&self.call, spec)
            .await?
            .error_for_status()
    }
}
