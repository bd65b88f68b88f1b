//! Thin HTTP wrapper around the MISP REST API.
//!
//! One [`MispClient`] per configured instance. Every request carries the
//! instance's `Authorization` key and `Accept: application/json`; transient
//! transport failures and 5xx responses are retried with capped backoff.
//! Pipelines depend on the [`MispApi`] trait so tests can substitute a
//! scripted server.

use crate::error::{SyncError, SyncResult};
use crate::registry::InstanceConfig;
use async_trait::async_trait;
use mb_core::TempStore;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Status and parsed body of a MISP response. Non-2xx statuses are carried,
/// not hidden, because the export path assembles error messages from the
/// body.
#[derive(Debug, Clone)]
pub struct MispResponse {
    pub status: u16,
    pub body: Value,
}

impl MispResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A downloaded attachment, streamed to a temp file together with the
/// response headers the attachment layer needs.
#[derive(Debug)]
pub struct RawDownload {
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub path: PathBuf,
}

/// The per-instance MISP operations the pipelines are built on.
#[async_trait]
pub trait MispApi: Send + Sync {
    /// Name of the instance this client talks to.
    fn instance_name(&self) -> &str;

    /// `POST events/index` filtered on publication time.
    async fn event_index_since(&self, published_since: i64) -> SyncResult<Value>;

    /// `POST attributes/restSearch/json` for one event, optionally filtered
    /// on attribute update time.
    async fn attribute_search(&self, event_id: &str, since: Option<i64>) -> SyncResult<Value>;

    /// `POST events`.
    async fn create_event(&self, event: &Value) -> SyncResult<MispResponse>;

    /// `POST attributes/add/{event_id}`.
    async fn add_attribute(&self, event_id: &str, attribute: &Value) -> SyncResult<MispResponse>;

    /// `POST events/upload_sample`.
    async fn upload_sample(&self, body: &Value) -> SyncResult<MispResponse>;

    /// `GET attributes/download/{id}`, streamed to a temp file.
    async fn download_attribute(&self, attribute_id: &str) -> SyncResult<RawDownload>;

    /// `GET servers/getVersion.json`, used as a health probe.
    async fn server_version(&self) -> SyncResult<MispResponse>;
}

/// reqwest-backed [`MispApi`] implementation.
pub struct MispClient {
    name: String,
    base_url: String,
    api_key: crate::secret::ApiKey,
    client: reqwest::Client,
    temp: Arc<TempStore>,
    max_retries: u32,
}

impl MispClient {
    pub fn new(config: &InstanceConfig, temp: Arc<TempStore>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
            temp,
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", self.api_key.expose())
            .header("Accept", "application/json")
    }

    /// POSTs a JSON body, retrying transport failures and 5xx responses.
    async fn post_json(&self, path: &str, body: &Value) -> SyncResult<MispResponse> {
        let url = self.url(path);
        let mut delay = Duration::from_millis(250);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(10));
            }

            let request = self.authorized(self.client.post(&url)).json(body);
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(instance = %self.name, %url, %status, "server error, retrying");
                        last_error = Some(SyncError::Fetch(format!("{url}: status {status}")));
                        continue;
                    }
                    let body = response.json::<Value>().await.unwrap_or(Value::Null);
                    debug!(instance = %self.name, %url, status = status.as_u16(), "misp call");
                    return Ok(MispResponse {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    last_error = Some(SyncError::fetch(&err));
                    if attempt >= self.max_retries {
                        break;
                    }
                    warn!(instance = %self.name, %url, %err, "transport error, retrying");
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Fetch(format!("{url}: no response"))))
    }

    /// Like [`Self::post_json`] but treats any non-2xx as a fetch failure.
    async fn post_json_ok(&self, path: &str, body: &Value) -> SyncResult<Value> {
        let response = self.post_json(path, body).await?;
        if !response.is_success() {
            return Err(SyncError::Fetch(format!(
                "{}: status {}",
                self.url(path),
                response.status
            )));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl MispApi for MispClient {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn event_index_since(&self, published_since: i64) -> SyncResult<Value> {
        self.post_json_ok(
            "events/index",
            &json!({ "searchpublish_timestamp": published_since }),
        )
        .await
    }

    async fn attribute_search(&self, event_id: &str, since: Option<i64>) -> SyncResult<Value> {
        self.post_json_ok(
            "attributes/restSearch/json",
            &json!({ "request": { "timestamp": since.unwrap_or(0), "eventid": event_id } }),
        )
        .await
    }

    async fn create_event(&self, event: &Value) -> SyncResult<MispResponse> {
        self.post_json("events", &json!({ "Event": event })).await
    }

    async fn add_attribute(&self, event_id: &str, attribute: &Value) -> SyncResult<MispResponse> {
        self.post_json(&format!("attributes/add/{event_id}"), attribute)
            .await
    }

    async fn upload_sample(&self, body: &Value) -> SyncResult<MispResponse> {
        self.post_json("events/upload_sample", body).await
    }

    async fn download_attribute(&self, attribute_id: &str) -> SyncResult<RawDownload> {
        let url = self.url(&format!("attributes/download/{attribute_id}"));
        let mut response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SyncError::fetch(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Fetch(format!("{url}: status {status}")));
        }

        let content_disposition = header_string(&response, reqwest::header::CONTENT_DISPOSITION);
        let content_type = header_string(&response, reqwest::header::CONTENT_TYPE);

        let path = self.temp.new_temporary_file("misp-download", attribute_id)?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| SyncError::Persistence(e.into()))?;
        while let Some(chunk) = response.chunk().await.map_err(|e| SyncError::fetch(&e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::Persistence(e.into()))?;
        }
        file.flush()
            .await
            .map_err(|e| SyncError::Persistence(e.into()))?;

        Ok(RawDownload {
            content_disposition,
            content_type,
            path,
        })
    }

    async fn server_version(&self) -> SyncResult<MispResponse> {
        let url = self.url("servers/getVersion.json");
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SyncError::fetch(&e))?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(MispResponse { status, body })
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
