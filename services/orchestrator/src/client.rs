//! Storage network API client.
//!
//! Talks to the storage network's REST surface:
//! - Node registry, running set and aggregate status
//! - Node start/stop/restart/delete requests
//! - File upload, download, delete and chunk distribution lookups

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::Config;
use crate::distribution::{ChunkAssignment, Distribution, DistributionError};
use crate::registry::NetworkApi;

/// Errors talking to the storage network.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid distribution: {0}")]
    Distribution(#[from] DistributionError),

    #[error("storage network unavailable: {0}")]
    Unavailable(String),
}

/// Answer to a node start/stop/restart/delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected { reason: String },
}

/// Node as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub address: Option<String>,
    /// Derived from running-set membership when read from the cache.
    #[serde(default, skip_deserializing)]
    pub running: bool,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, port: u32) -> Self {
        Self {
            node_id: node_id.into(),
            host: Some("localhost".to_string()),
            port: Some(port),
            address: Some(format!("localhost:{port}")),
            running: false,
        }
    }
}

/// File owned by the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Aggregate network statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub total_nodes: u64,
    #[serde(default)]
    pub total_storage_bytes: u64,
    #[serde(default)]
    pub used_storage_bytes: u64,
    #[serde(default)]
    pub utilization_percent: f64,
    #[serde(default)]
    pub total_chunks: u64,
}

/// Start request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStartRequest {
    pub node_id: String,
    pub port: u32,
    #[serde(rename = "storageGB")]
    pub storage_gb: u32,
    #[serde(rename = "ramGB")]
    pub ram_gb: u32,
}

#[derive(Debug, Serialize)]
struct NodeRestartBody {
    port: u32,
    #[serde(rename = "storageGB")]
    storage_gb: u32,
    #[serde(rename = "ramGB")]
    ram_gb: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningNodesResponse {
    #[serde(default)]
    running_nodes: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributionResponse {
    file_id: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    distribution: Vec<ChunkAssignment>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`NetworkApi`].
pub struct HttpNetworkClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNetworkClient {
    /// Create a new client.
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "GET");

        let response = self.client.get(&url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Map a node action response to a decision. Non-success answers carry
    /// the collaborator's reason.
    async fn decide(response: Response) -> Result<Decision, ApiError> {
        if response.status().is_success() {
            return Ok(Decision::Accepted);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let reason = rejection_reason(status, &body);
        debug!(status = %status, reason = %reason, "Request rejected");
        Ok(Decision::Rejected { reason })
    }
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Storage network request failed");
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Extract a human-readable rejection reason from an error response.
fn rejection_reason(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(reason) = parsed.error.or(parsed.message) {
            return reason;
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("Unknown error ({status})")
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl NetworkApi for HttpNetworkClient {
    async fn request_node_start(&self, request: &NodeStartRequest) -> Result<Decision, ApiError> {
        let url = self.url("/network/nodes/start");
        debug!(node_id = %request.node_id, port = request.port, "Requesting node start");

        let response = self.client.post(&url).json(request).send().await?;
        Self::decide(response).await
    }

    async fn request_node_stop(&self, node_id: &str) -> Result<Decision, ApiError> {
        let url = self.url(&format!("/network/nodes/stop/{node_id}"));
        let response = self.client.post(&url).send().await?;
        Self::decide(response).await
    }

    async fn request_node_restart(&self, request: &NodeStartRequest) -> Result<Decision, ApiError> {
        let url = self.url(&format!("/network/nodes/restart/{}", request.node_id));
        let body = NodeRestartBody {
            port: request.port,
            storage_gb: request.storage_gb,
            ram_gb: request.ram_gb,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::decide(response).await
    }

    async fn request_node_delete(&self, node_id: &str) -> Result<Decision, ApiError> {
        let url = self.url(&format!("/network/nodes/{node_id}"));
        let response = self.client.delete(&url).send().await?;
        Self::decide(response).await
    }

    async fn request_delete_all_nodes(&self) -> Result<Decision, ApiError> {
        let url = self.url("/network/nodes/delete-all");
        let response = self.client.post(&url).send().await?;
        Self::decide(response).await
    }

    async fn query_running_set(&self) -> Result<BTreeSet<String>, ApiError> {
        let body: RunningNodesResponse = self.get_json("/network/nodes/running").await?;
        Ok(body.running_nodes)
    }

    async fn query_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        self.get_json("/network/nodes").await
    }

    async fn query_files(&self) -> Result<Vec<FileRecord>, ApiError> {
        self.get_json("/user/dashboard/files").await
    }

    async fn query_network_status(&self) -> Result<NetworkStatus, ApiError> {
        self.get_json("/network/status").await
    }

    async fn request_file_upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError> {
        let url = self.url("/files/upload");
        debug!(file_name = %file_name, size_bytes = bytes.len(), "Uploading file");

        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = Form::new().part("file", part);

        let response = self.client.post(&url).multipart(form).send().await?;
        let response = ensure_success(response).await?;
        let body: UploadResponse = response.json().await?;
        Ok(body.id)
    }

    async fn query_distribution(&self, file_id: &str) -> Result<Distribution, ApiError> {
        let body: DistributionResponse = self
            .get_json(&format!("/user/dashboard/files/{file_id}/distribution"))
            .await?;
        Ok(Distribution::new(
            body.file_id,
            body.file_name,
            body.distribution,
        )?)
    }

    async fn request_file_delete(&self, file_id: &str) -> Result<Decision, ApiError> {
        let url = self.url(&format!("/files/{file_id}"));
        let response = self.client.delete(&url).send().await?;
        Self::decide(response).await
    }

    async fn request_file_download(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.url(&format!("/files/{file_id}"));
        let response = self.client.get(&url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_serialization() {
        let request = NodeStartRequest {
            node_id: "node1".to_string(),
            port: 50051,
            storage_gb: 5,
            ram_gb: 8,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"nodeId": "node1", "port": 50051, "storageGB": 5, "ramGB": 8})
        );
    }

    #[test]
    fn test_node_record_ignores_running_field() {
        let json = r#"{"nodeId":"node1","host":"localhost","port":50051,"address":"localhost:50051","running":true}"#;
        let record: NodeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.port, Some(50051));
        assert!(!record.running);
    }

    #[test]
    fn test_rejection_reason() {
        assert_eq!(
            rejection_reason(StatusCode::BAD_REQUEST, r#"{"error":"Node node1 is already running"}"#),
            "Node node1 is already running"
        );
        assert_eq!(
            rejection_reason(StatusCode::INTERNAL_SERVER_ERROR, r#"{"message":"disk full"}"#),
            "disk full"
        );
        assert_eq!(
            rejection_reason(StatusCode::BAD_GATEWAY, "upstream down"),
            "upstream down"
        );
        assert_eq!(
            rejection_reason(StatusCode::INTERNAL_SERVER_ERROR, ""),
            "Unknown error (500 Internal Server Error)"
        );
    }
}
