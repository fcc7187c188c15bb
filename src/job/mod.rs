//! Job records as persisted in the KV store.
//!
//! A job's history is an append-only `States` sequence; the current state
//! is the last entry. `Owner` is set by the allocating worker, `Result`
//! by the pipeline when the job finishes.

pub mod pipeline;

pub use pipeline::JobRunner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::docker::ContainerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "FINISHED")]
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Started => write!(f, "STARTED"),
            JobState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// One entry in a job's state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateEntry {
    pub state: JobState,
    pub step: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobResult {
    pub status: ResultStatus,
    pub info: String,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            status: ResultStatus::Success,
            info: String::new(),
        }
    }

    pub fn failure(info: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            info: info.into(),
        }
    }
}

/// A named collection of files in object storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Fileset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// The input fileset is cloned into the workspace before the user
/// workload runs; the output fileset, when named, is pushed afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobFileset {
    #[serde(default)]
    pub input: Option<Fileset>,
    #[serde(default)]
    pub output: Option<Fileset>,
}

/// The user workload container: its submitted configuration, and the
/// runtime id once the worker has created it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(default)]
    pub id: String,
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub container: Container,
    #[serde(default)]
    pub fileset: JobFileset,
    #[serde(default)]
    pub owner: String,
    pub states: Vec<StateEntry>,
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Base name of the job's KV key; known only after allocation.
    #[serde(skip)]
    pub id: String,
}

impl Job {
    /// A freshly queued job, as written by the submit utility.
    pub fn queued(config: ContainerConfig, fileset: JobFileset) -> Self {
        let mut job = Self {
            container: Container {
                id: String::new(),
                config,
            },
            fileset,
            owner: String::new(),
            states: Vec::new(),
            result: None,
            id: String::new(),
        };
        job.set_state(JobState::Queued, "");
        job
    }

    /// Append a state entry stamped with the current time.
    pub fn set_state(&mut self, state: JobState, step: impl Into<String>) {
        self.states.push(StateEntry {
            state,
            step: step.into(),
            date: Utc::now(),
        });
    }

    pub fn current_state(&self) -> Option<&StateEntry> {
        self.states.last()
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.current_state(), Some(s) if s.state == JobState::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::queued(
            ContainerConfig {
                image: "ubuntu".to_string(),
                cmd: vec!["/bin/true".to_string()],
                working_dir: "out".to_string(),
                volumes: Default::default(),
            },
            JobFileset {
                input: Some(Fileset {
                    name: "in".to_string(),
                    patterns: vec!["*.csv".to_string()],
                }),
                output: None,
            },
        )
    }

    #[test]
    fn queued_job_starts_with_single_queued_state() {
        let job = sample_job();
        assert_eq!(job.states.len(), 1);
        assert!(job.is_queued());
        assert!(job.owner.is_empty());
        assert!(job.result.is_none());
    }

    #[test]
    fn set_state_appends_without_collapsing() {
        let mut job = sample_job();
        job.set_state(JobState::Started, "Allocated");
        job.set_state(JobState::Started, "RUNNING");
        assert_eq!(job.states.len(), 3);
        assert_eq!(job.states[0].state, JobState::Queued);
        assert_eq!(job.states[1].step, "Allocated");
        assert_eq!(job.states[2].step, "RUNNING");
        assert!(!job.is_queued());
    }

    #[test]
    fn wire_format_uses_stored_field_names() {
        let job = sample_job();
        let value: serde_json::Value = serde_json::to_value(&job).unwrap();
        assert!(value.get("Container").is_some());
        assert_eq!(value["Container"]["Config"]["Image"], "ubuntu");
        assert_eq!(value["Fileset"]["Input"]["Name"], "in");
        assert_eq!(value["States"][0]["State"], "QUEUED");
        assert!(value["States"][0].get("Step").is_some());
        assert!(value["States"][0].get("Date").is_some());
        assert_eq!(value["Owner"], "");
        assert!(value["Result"].is_null());
        // The key base name never round-trips through the store.
        assert!(value.get("id").is_none());
    }

    #[test]
    fn deserializes_minimal_document() {
        let doc = r#"{
            "Container": {"Config": {"Image": "ubuntu", "Cmd": ["/bin/true"]}},
            "Fileset": {"Input": {"Name": ""}},
            "States": [{"State": "QUEUED", "Step": "", "Date": "2014-06-01T00:00:00Z"}]
        }"#;
        let job: Job = serde_json::from_str(doc).unwrap();
        assert!(job.is_queued());
        assert!(job.owner.is_empty());
        assert!(job.fileset.output.is_none());
        assert_eq!(job.container.config.image, "ubuntu");
    }
}
