use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_KV_ENDPOINT: &str = "http://localhost:4001";
pub const DEFAULT_DOCKER_ENDPOINT: &str = "http://localhost:4243";

const DEFAULT_DATA_DIR: &str = "/tmp";
const DEFAULT_POLL_RATE: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_RATE: Duration = Duration::from_secs(60);

/// Worker configuration, read from the environment at startup.
///
/// The AWS credentials, bucket, workspace, and earthkit image are passed
/// through to the helper containers that move filesets in and out of the
/// shared workspace volume.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub aws_access_key: String,
    pub aws_secret_key: String,
    pub aws_region: String,
    pub s3_bucket: String,
    pub workspace: String,
    pub earthkit_img: String,
    pub data_dir: String,
    pub kv_endpoint: String,
    pub docker_endpoint: String,
    pub poll_rate: Duration,
    pub heartbeat_rate: Duration,
}

impl WorkerConfig {
    /// Build the configuration from the environment. Every variable except
    /// `DATA_DIR` is required; a missing one aborts startup.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            aws_access_key: required("AWS_ACCESS_KEY")?,
            aws_secret_key: required("AWS_SECRET_KEY")?,
            aws_region: required("AWS_REGION")?,
            s3_bucket: required("S3_BUCKET")?,
            workspace: required("WORKSPACE")?,
            earthkit_img: required("EARTHKIT_IMG")?,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
            kv_endpoint: DEFAULT_KV_ENDPOINT.to_string(),
            docker_endpoint: DEFAULT_DOCKER_ENDPOINT.to_string(),
            poll_rate: DEFAULT_POLL_RATE,
            heartbeat_rate: DEFAULT_HEARTBEAT_RATE,
        })
    }
}

fn required(name: &'static str) -> Result<String> {
    env::var(name).map_err(|_| Error::MissingEnv(name))
}
