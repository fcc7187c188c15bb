//! Cloud instance identity, read best-effort from the metadata endpoint.

use std::time::Duration;

const METADATA_ENDPOINT: &str = "http://169.254.169.254/latest";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The identity fields a worker registers under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub instance_id: String,
    pub private_ip: String,
    pub public_ip: String,
}

impl Identity {
    /// Static placeholder identity, used when the metadata endpoint is
    /// unreachable (e.g. outside the cloud).
    pub fn fallback() -> Self {
        Self {
            name: "worker".to_string(),
            instance_id: "instance-id".to_string(),
            private_ip: "local-ipv4".to_string(),
            public_ip: "public-ipv4".to_string(),
        }
    }
}

/// Read the instance identity from the metadata service, falling back to
/// the static placeholders if any field cannot be fetched. No retries.
pub async fn detect() -> Identity {
    detect_from(METADATA_ENDPOINT).await
}

pub async fn detect_from(endpoint: &str) -> Identity {
    match read_identity(endpoint).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::info!(error = %e, "instance metadata unavailable, using static identity");
            Identity::fallback()
        }
    }
}

async fn read_identity(endpoint: &str) -> Result<Identity, reqwest::Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    Ok(Identity {
        name: read_parameter(&client, endpoint, "meta-data/hostname").await?,
        instance_id: read_parameter(&client, endpoint, "meta-data/instance-id").await?,
        private_ip: read_parameter(&client, endpoint, "meta-data/local-ipv4").await?,
        public_ip: read_parameter(&client, endpoint, "meta-data/public-ipv4").await?,
    })
}

async fn read_parameter(
    client: &reqwest::Client,
    endpoint: &str,
    parameter: &str,
) -> Result<String, reqwest::Error> {
    client
        .get(format!("{}/{}", endpoint, parameter))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}
