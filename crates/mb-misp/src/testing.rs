//! Scripted MISP server for tests.
//!
//! Implements [`MispApi`] over preloaded responses, records every call for
//! verification, and supports failure injection per event. Used by the
//! pipeline test suites instead of a live server.

use crate::client::{MispApi, MispResponse, RawDownload};
use crate::error::{SyncError, SyncResult};
use crate::registry::{InstanceConfig, MispInstance};
use crate::secret::ApiKey;
use async_trait::async_trait;
use mb_core::TempStore;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A recorded API call, in invocation order.
#[derive(Debug, Clone)]
pub enum ApiCall {
    EventIndex { since: i64 },
    AttributeSearch { event_id: String, since: Option<i64> },
    CreateEvent { payload: Value },
    AddAttribute { event_id: String, payload: Value },
    UploadSample { payload: Value },
    Download { attribute_id: String },
}

/// Scripted attachment download.
#[derive(Debug, Clone)]
pub struct ScriptedDownload {
    pub bytes: Vec<u8>,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
}

/// Scripted [`MispApi`] implementation.
pub struct ScriptedMisp {
    name: String,
    temp: Arc<TempStore>,
    index: RwLock<Value>,
    attributes: RwLock<HashMap<String, Value>>,
    failing_events: RwLock<HashSet<String>>,
    create_event_response: RwLock<MispResponse>,
    add_attribute_response: RwLock<MispResponse>,
    upload_sample_response: RwLock<MispResponse>,
    downloads: RwLock<HashMap<String, ScriptedDownload>>,
    calls: RwLock<Vec<ApiCall>>,
}

impl ScriptedMisp {
    pub fn new(name: &str, temp: Arc<TempStore>) -> Self {
        Self {
            name: name.to_string(),
            temp,
            index: RwLock::new(json!([])),
            attributes: RwLock::new(HashMap::new()),
            failing_events: RwLock::new(HashSet::new()),
            create_event_response: RwLock::new(MispResponse {
                status: 200,
                body: json!({"Event": {"id": "108"}}),
            }),
            add_attribute_response: RwLock::new(MispResponse {
                status: 200,
                body: json!({}),
            }),
            upload_sample_response: RwLock::new(MispResponse {
                status: 200,
                body: json!({}),
            }),
            downloads: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
        }
    }

    /// Builds a [`MispInstance`] around a scripted server.
    pub fn instance(
        api: &Arc<Self>,
        tags: &[&str],
        case_template: Option<&str>,
    ) -> MispInstance {
        MispInstance {
            config: InstanceConfig {
                name: api.name.clone(),
                base_url: format!("https://{}.example.com", api.name),
                api_key: ApiKey::new("scripted-key"),
                case_template: case_template.map(String::from),
                artifact_tags: tags.iter().map(|t| t.to_string()).collect(),
                timeout_secs: 5,
                max_retries: 0,
            },
            api: Arc::clone(api) as Arc<dyn MispApi>,
        }
    }

    pub async fn set_index(&self, body: Value) {
        *self.index.write().await = body;
    }

    pub async fn set_attributes(&self, event_id: &str, body: Value) {
        self.attributes
            .write()
            .await
            .insert(event_id.to_string(), body);
    }

    /// Makes `attribute_search` fail for one event, as a 500 would.
    pub async fn fail_attribute_search(&self, event_id: &str) {
        self.failing_events
            .write()
            .await
            .insert(event_id.to_string());
    }

    pub async fn respond_create_event(&self, response: MispResponse) {
        *self.create_event_response.write().await = response;
    }

    pub async fn respond_add_attribute(&self, response: MispResponse) {
        *self.add_attribute_response.write().await = response;
    }

    pub async fn respond_upload_sample(&self, response: MispResponse) {
        *self.upload_sample_response.write().await = response;
    }

    pub async fn set_download(&self, attribute_id: &str, download: ScriptedDownload) {
        self.downloads
            .write()
            .await
            .insert(attribute_id.to_string(), download);
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.calls.read().await.clone()
    }

    async fn record(&self, call: ApiCall) {
        self.calls.write().await.push(call);
    }
}

#[async_trait]
impl MispApi for ScriptedMisp {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn event_index_since(&self, published_since: i64) -> SyncResult<Value> {
        self.record(ApiCall::EventIndex {
            since: published_since,
        })
        .await;
        Ok(self.index.read().await.clone())
    }

    async fn attribute_search(&self, event_id: &str, since: Option<i64>) -> SyncResult<Value> {
        self.record(ApiCall::AttributeSearch {
            event_id: event_id.to_string(),
            since,
        })
        .await;
        if self.failing_events.read().await.contains(event_id) {
            return Err(SyncError::Fetch(format!(
                "attributes/restSearch/json: status 500 for event {event_id}"
            )));
        }
        Ok(self
            .attributes
            .read()
            .await
            .get(event_id)
            .cloned()
            .unwrap_or_else(|| json!({"response": {"Attribute": []}})))
    }

    async fn create_event(&self, event: &Value) -> SyncResult<MispResponse> {
        self.record(ApiCall::CreateEvent {
            payload: event.clone(),
        })
        .await;
        Ok(self.create_event_response.read().await.clone())
    }

    async fn add_attribute(&self, event_id: &str, attribute: &Value) -> SyncResult<MispResponse> {
        self.record(ApiCall::AddAttribute {
            event_id: event_id.to_string(),
            payload: attribute.clone(),
        })
        .await;
        Ok(self.add_attribute_response.read().await.clone())
    }

    async fn upload_sample(&self, body: &Value) -> SyncResult<MispResponse> {
        self.record(ApiCall::UploadSample {
            payload: body.clone(),
        })
        .await;
        Ok(self.upload_sample_response.read().await.clone())
    }

    async fn download_attribute(&self, attribute_id: &str) -> SyncResult<RawDownload> {
        self.record(ApiCall::Download {
            attribute_id: attribute_id.to_string(),
        })
        .await;
        let download = self
            .downloads
            .read()
            .await
            .get(attribute_id)
            .cloned()
            .ok_or_else(|| {
                SyncError::Fetch(format!("attributes/download/{attribute_id}: status 404"))
            })?;
        let path = self.temp.new_temporary_file("scripted-download", attribute_id)?;
        tokio::fs::write(&path, &download.bytes)
            .await
            .map_err(|e| SyncError::Persistence(e.into()))?;
        Ok(RawDownload {
            content_disposition: download.content_disposition,
            content_type: download.content_type,
            path,
        })
    }

    async fn server_version(&self) -> SyncResult<MispResponse> {
        Ok(MispResponse {
            status: 200,
            body: json!({"version": "2.4-scripted"}),
        })
    }
}
