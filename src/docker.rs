//! Adapter over the container runtime's remote API.
//!
//! The pipeline only needs a small slice of the API: check which images
//! exist locally, pull missing ones, and create/start/wait/remove
//! containers with host-path volume binds.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("container runtime api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid runtime response: {0}")]
    InvalidResponse(String),
}

/// Container specification as persisted in the job document and submitted
/// to the runtime's create call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_json::Value>,
}

/// Declare container-side mount points, e.g. `{"/workspaces": {}}`.
pub fn volume_set(paths: &[&str]) -> BTreeMap<String, serde_json::Value> {
    paths
        .iter()
        .map(|p| (p.to_string(), serde_json::json!({})))
        .collect()
}

/// A normalized image reference.
///
/// The registry host, when present, stays folded into the repository name
/// (the runtime's pull API takes it that way); two references are the same
/// image iff their `repo:tag` renderings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse an image name: an optional registry host before the first
    /// `/`, then `repo[:tag]` with the tag defaulting to `latest`.
    pub fn parse(image: &str) -> Self {
        let (host, rest) = match image.split_once('/') {
            Some((host, rest)) => (Some(host), rest),
            None => (None, image),
        };
        let (repo, tag) = match rest.split_once(':') {
            Some((repo, tag)) => (repo, tag),
            None => (rest, "latest"),
        };
        let repository = match host {
            Some(host) => format!("{}/{}", host, repo),
            None => repo.to_string(),
        };
        Self {
            repository,
            tag: tag.to_string(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// The `repo:tag` references of every image present locally.
    async fn list_local_images(&self) -> Result<HashSet<String>, DockerError>;

    /// Pull an image; blocks until it is locally available.
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<(), DockerError>;

    /// Create a container from `config`; returns the container id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError>;

    /// Start a created container. `binds` are `host:container:rw` triples.
    async fn start_container(&self, id: &str, binds: &[String]) -> Result<(), DockerError>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, DockerError>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), DockerError>;
}

/// HTTP client for the runtime's remote API.
pub struct DockerClient {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct ApiImage {
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Serialize)]
struct HostConfig<'a> {
    #[serde(rename = "Binds")]
    binds: &'a [String],
}

#[derive(Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

impl DockerClient {
    /// Connect to the runtime and verify it answers a ping. Failure here
    /// is fatal to worker construction.
    pub async fn connect(endpoint: &str) -> Result<Self, DockerError> {
        let client = reqwest::Client::new();
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let resp = client.get(format!("{}/_ping", endpoint)).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}

async fn api_error(resp: reqwest::Response) -> DockerError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    DockerError::Api {
        status,
        message: message.trim().to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_local_images(&self) -> Result<HashSet<String>, DockerError> {
        let resp = self.client.get(self.url("/images/json")).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let images: Vec<ApiImage> = resp
            .json()
            .await
            .map_err(|e| DockerError::InvalidResponse(e.to_string()))?;
        Ok(images
            .into_iter()
            .flat_map(|i| i.repo_tags.unwrap_or_default())
            .collect())
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<(), DockerError> {
        let resp = self
            .client
            .post(self.url("/images/create"))
            .query(&[("fromImage", repository), ("tag", tag)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        // The pull endpoint streams progress messages and reports failures
        // inside the stream rather than via the status code.
        let body = resp.text().await?;
        for line in body.lines() {
            if let Ok(message) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(error) = message.get("error").and_then(|e| e.as_str()) {
                    return Err(DockerError::Pull(error.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .json(config)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let created: CreateContainerResponse = resp
            .json()
            .await
            .map_err(|e| DockerError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str, binds: &[String]) -> Result<(), DockerError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{}/start", id)))
            .json(&HostConfig { binds })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{}/wait", id)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let wait: WaitResponse = resp
            .json()
            .await
            .map_err(|e| DockerError::InvalidResponse(e.to_string()))?;
        Ok(wait.status_code)
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), DockerError> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{}", id)))
            .query(&[("v", if remove_volumes { "1" } else { "0" })])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(())
    }
}
