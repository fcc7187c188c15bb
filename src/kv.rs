//! Adapter over the shared consistent KV store.
//!
//! Workers coordinate exclusively through this interface: job documents
//! live under `/jobs` (ordered keys assigned by the store), worker records
//! under `/workers`. The only conditional write is `cas_set`, keyed on a
//! node's modification index; a lost race surfaces as
//! [`KvError::CasConflict`], which callers treat as a normal outcome.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const PATH_JOBS: &str = "/jobs";
pub const PATH_WORKERS: &str = "/workers";

const CODE_KEY_NOT_FOUND: u64 = 100;
const CODE_CAS_CONFLICT: u64 = 101;

pub fn job_key(id: &str) -> String {
    format!("{}/{}", PATH_JOBS, id)
}

pub fn worker_key(id: &str) -> String {
    format!("{}/{}", PATH_WORKERS, id)
}

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("compare-and-swap conflict")]
    CasConflict,

    #[error("kv store error {code}: {message}")]
    Api { code: u64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid kv response: {0}")]
    InvalidResponse(String),
}

/// A stored node as observed by a listing: its key, raw value, and the
/// modification index used as the CAS precondition.
#[derive(Debug, Clone)]
pub struct KvNode {
    pub key: String,
    pub value: String,
    pub mod_index: u64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// List the children of `prefix` in ascending key order. A prefix
    /// that doesn't exist yet yields an empty list, not an error.
    async fn get_ordered_children(&self, prefix: &str) -> Result<Vec<KvNode>, KvError>;

    /// Unconditional write. A `ttl` of zero means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: u64) -> Result<(), KvError>;

    /// Conditional write: succeeds only if the node's modification index
    /// still equals `prev_mod_index`.
    async fn cas_set(&self, key: &str, value: &str, prev_mod_index: u64) -> Result<(), KvError>;

    /// Append a value under `prefix` with a store-assigned ordered key.
    /// Returns the new key.
    async fn create_in_order(&self, prefix: &str, value: &str) -> Result<String, KvError>;
}

/// etcd v2 HTTP client.
pub struct EtcdClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Deserialize)]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Deserialize)]
struct EtcdApiError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

impl EtcdClient {
    /// Connect to the store and verify it is reachable. Failure here is
    /// fatal to worker construction.
    pub async fn connect(endpoint: &str) -> Result<Self, KvError> {
        let client = reqwest::Client::new();
        let endpoint = endpoint.trim_end_matches('/').to_string();
        client
            .get(format!("{}/version", endpoint))
            .send()
            .await?
            .error_for_status()?;
        Ok(Self { client, endpoint })
    }

    fn keys_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, key)
    }

    async fn parse_node(resp: reqwest::Response) -> Result<EtcdNode, KvError> {
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let body: EtcdResponse = resp
            .json()
            .await
            .map_err(|e| KvError::InvalidResponse(e.to_string()))?;
        Ok(body.node)
    }
}

async fn api_error(resp: reqwest::Response) -> KvError {
    let status = resp.status();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => return KvError::Transport(e),
    };
    match serde_json::from_str::<EtcdApiError>(&body) {
        Ok(err) => match err.error_code {
            CODE_KEY_NOT_FOUND => KvError::KeyNotFound(err.cause.unwrap_or(err.message)),
            CODE_CAS_CONFLICT => KvError::CasConflict,
            code => KvError::Api {
                code,
                message: err.message,
            },
        },
        Err(_) => KvError::InvalidResponse(format!("status {}: {}", status, body)),
    }
}

#[async_trait]
impl KvStore for EtcdClient {
    async fn get_ordered_children(&self, prefix: &str) -> Result<Vec<KvNode>, KvError> {
        let resp = self
            .client
            .get(self.keys_url(prefix))
            .query(&[("sorted", "true")])
            .send()
            .await?;
        let node = match Self::parse_node(resp).await {
            Ok(node) => node,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(node
            .nodes
            .into_iter()
            .map(|n| KvNode {
                key: n.key,
                value: n.value.unwrap_or_default(),
                mod_index: n.modified_index,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: u64) -> Result<(), KvError> {
        let mut form = vec![("value", value.to_string())];
        if ttl > 0 {
            form.push(("ttl", ttl.to_string()));
        }
        let resp = self
            .client
            .put(self.keys_url(key))
            .form(&form)
            .send()
            .await?;
        Self::parse_node(resp).await?;
        Ok(())
    }

    async fn cas_set(&self, key: &str, value: &str, prev_mod_index: u64) -> Result<(), KvError> {
        let resp = self
            .client
            .put(self.keys_url(key))
            .query(&[("prevIndex", prev_mod_index.to_string())])
            .form(&[("value", value.to_string())])
            .send()
            .await?;
        Self::parse_node(resp).await?;
        Ok(())
    }

    async fn create_in_order(&self, prefix: &str, value: &str) -> Result<String, KvError> {
        let resp = self
            .client
            .post(self.keys_url(prefix))
            .form(&[("value", value.to_string())])
            .send()
            .await?;
        let node = Self::parse_node(resp).await?;
        Ok(node.key)
    }
}
