use thiserror::Error;

use crate::docker::DockerError;
use crate::kv::KvError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("kv store error: {0}")]
    Kv(#[from] KvError),

    #[error("container runtime error: {0}")]
    Docker(#[from] DockerError),

    #[error("container exited with code {0}")]
    NonZeroExit(i64),

    #[error("invalid json document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
