//! Per-job execution pipeline.
//!
//! An allocated job runs five stages in order: ensure images, clone the
//! input fileset, run the user workload, push the output fileset, finish.
//! The first failing stage short-circuits into a FAILURE result; in every
//! case the runner persists a FINISHED state and delivers exactly one
//! `JobDone` signal back to the worker loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::docker::{volume_set, ContainerConfig, ContainerRuntime, ImageRef};
use crate::error::{Error, Result};
use crate::job::{Job, JobResult, JobState};
use crate::kv::{self, KvStore};
use crate::worker::Signal;

const WORKSPACES_VOLUME: &str = "/workspaces";
const EARTHKIT_BIN: &str = "/bin/earthkit-cli";

/// Drives one allocated job to completion. Holds the worker's KV and
/// runtime handles plus its identity; the job itself is owned by the
/// runner's task once spawned.
pub struct JobRunner {
    worker_id: String,
    kv: Arc<dyn KvStore>,
    docker: Arc<dyn ContainerRuntime>,
    config: Arc<WorkerConfig>,
    signals: mpsc::Sender<Signal>,
}

impl JobRunner {
    pub fn new(
        worker_id: impl Into<String>,
        kv: Arc<dyn KvStore>,
        docker: Arc<dyn ContainerRuntime>,
        config: Arc<WorkerConfig>,
        signals: mpsc::Sender<Signal>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            kv,
            docker,
            config,
            signals,
        }
    }

    /// Run the pipeline to completion, then persist the result and signal
    /// the worker loop.
    pub async fn run(self, mut job: Job) {
        tracing::info!(job_id = %job.id, worker_id = %self.worker_id, "starting job");
        let result = match self.execute(&mut job).await {
            Ok(()) => JobResult::success(),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "job failed");
                JobResult::failure(e.to_string())
            }
        };
        self.finish(&mut job, result).await;
    }

    async fn execute(&self, job: &mut Job) -> Result<()> {
        self.pull_images(job).await?;
        self.pull_data(job).await?;
        self.run_user_container(job).await?;
        self.push_data(job).await?;
        Ok(())
    }

    /// Ensure the earthkit helper image and the job's workload image exist
    /// locally, pulling whichever are missing.
    async fn pull_images(&self, job: &mut Job) -> Result<()> {
        let mut needed: BTreeMap<String, ImageRef> = BTreeMap::new();
        for image in [
            self.config.earthkit_img.as_str(),
            job.container.config.image.as_str(),
        ] {
            let image = ImageRef::parse(image);
            needed.insert(image.reference(), image);
        }

        let existing = self.docker.list_local_images().await?;
        needed.retain(|name, _| {
            if existing.contains(name) {
                tracing::debug!(job_id = %job.id, image = %name, "image already present");
                false
            } else {
                true
            }
        });

        for (name, image) in needed {
            tracing::info!(job_id = %job.id, image = %name, "pulling image");
            job.set_state(JobState::Started, format!("Pulling docker image: {}", name));
            self.save(job).await;
            self.docker.pull_image(&image.repository, &image.tag).await?;
        }
        Ok(())
    }

    /// Clone the input fileset into the shared workspace volume via a
    /// helper container. An unnamed input means "latest".
    async fn pull_data(&self, job: &mut Job) -> Result<()> {
        let fileset = job
            .fileset
            .input
            .as_ref()
            .map(|f| f.name.clone())
            .unwrap_or_default();

        let mut cmd = self.earthkit_command("clone");
        cmd.push(self.config.workspace.clone());
        if !fileset.is_empty() {
            cmd.push(fileset.clone());
        }

        let config = ContainerConfig {
            image: self.config.earthkit_img.clone(),
            cmd,
            working_dir: WORKSPACES_VOLUME.to_string(),
            volumes: volume_set(&[WORKSPACES_VOLUME]),
        };
        let id = self.docker.create_container(&config).await?;
        self.docker
            .start_container(&id, &[self.workspaces_bind()])
            .await?;

        let friendly = if fileset.is_empty() {
            "latest"
        } else {
            fileset.as_str()
        };
        job.set_state(JobState::Started, format!("Pulling fileset: {}", friendly));
        self.save(job).await;

        self.wait_for_exit(&id).await?;
        self.remove_helper(&id).await;
        Ok(())
    }

    /// Run the user workload. The submitted working directory is relative
    /// to the deployment workspace; the volume list is replaced with the
    /// shared workspace mount. The container is left in place afterwards
    /// so its logs and disk artifacts stay retrievable.
    async fn run_user_container(&self, job: &mut Job) -> Result<()> {
        let user_dir = job.container.config.working_dir.clone();
        job.container.config.working_dir =
            join_path(&[WORKSPACES_VOLUME, &self.config.workspace, &user_dir]);
        job.container.config.volumes = volume_set(&[WORKSPACES_VOLUME]);

        let id = self.docker.create_container(&job.container.config).await?;
        job.container.id = id.clone();

        self.docker
            .start_container(&id, &[self.workspaces_bind()])
            .await?;
        job.set_state(JobState::Started, "RUNNING");
        self.save(job).await;

        self.wait_for_exit(&id).await?;
        Ok(())
    }

    /// Push the output fileset, unless the job doesn't name one.
    async fn push_data(&self, job: &mut Job) -> Result<()> {
        let fileset = match &job.fileset.output {
            Some(f) if !f.name.is_empty() => f.name.clone(),
            _ => {
                tracing::debug!(job_id = %job.id, "no output fileset, skipping push");
                return Ok(());
            }
        };

        let mut cmd = self.earthkit_command("push");
        cmd.push(fileset.clone());

        let config = ContainerConfig {
            image: self.config.earthkit_img.clone(),
            cmd,
            working_dir: join_path(&[WORKSPACES_VOLUME, &self.config.workspace]),
            volumes: volume_set(&[WORKSPACES_VOLUME]),
        };
        let id = self.docker.create_container(&config).await?;
        self.docker
            .start_container(&id, &[self.workspaces_bind()])
            .await?;

        job.set_state(JobState::Started, format!("Pushing fileset: {}", fileset));
        self.save(job).await;

        self.wait_for_exit(&id).await?;
        self.remove_helper(&id).await;
        Ok(())
    }

    async fn finish(&self, job: &mut Job, result: JobResult) {
        tracing::info!(job_id = %job.id, status = ?result.status, "job finished");
        job.result = Some(result);
        job.set_state(JobState::Finished, "");
        self.save(job).await;
        if self.signals.send(Signal::JobDone).await.is_err() {
            tracing::warn!(job_id = %job.id, "worker loop gone, dropping completion signal");
        }
    }

    /// Persist the full job document to its key. Post-allocation this
    /// worker is the sole writer, so the write is unconditional; failures
    /// are logged and left for the next save.
    async fn save(&self, job: &Job) {
        let value = match serde_json::to_string(job) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to serialize job record");
                return;
            }
        };
        if let Err(e) = self.kv.set(&kv::job_key(&job.id), &value, 0).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to persist job record");
        }
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<()> {
        let code = self.docker.wait_container(container_id).await?;
        if code != 0 {
            return Err(Error::NonZeroExit(code));
        }
        Ok(())
    }

    /// Helper containers are removed once their transfer succeeds; a
    /// failed removal only costs disk, so it doesn't fail the job.
    async fn remove_helper(&self, container_id: &str) {
        if let Err(e) = self.docker.remove_container(container_id, false).await {
            tracing::warn!(container_id, error = %e, "failed to remove helper container");
        }
    }

    fn earthkit_command(&self, subcommand: &str) -> Vec<String> {
        vec![
            EARTHKIT_BIN.to_string(),
            "-aws_access_key".to_string(),
            self.config.aws_access_key.clone(),
            "-aws_secret_key".to_string(),
            self.config.aws_secret_key.clone(),
            "-aws_region".to_string(),
            self.config.aws_region.clone(),
            "-s3_bucket".to_string(),
            self.config.s3_bucket.clone(),
            subcommand.to_string(),
        ]
    }

    fn workspaces_bind(&self) -> String {
        let host_dir = Path::new(&self.config.data_dir)
            .join(WORKSPACES_VOLUME.trim_start_matches('/'));
        format!("{}:{}:rw", host_dir.display(), WORKSPACES_VOLUME)
    }
}

/// Join container-side path components, skipping empty ones.
fn join_path(parts: &[&str]) -> String {
    let mut path = PathBuf::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if path.as_os_str().is_empty() {
            path.push(part);
        } else {
            path.push(part.trim_start_matches('/'));
        }
    }
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_workspace_paths() {
        assert_eq!(
            join_path(&["/workspaces", "proj", "out"]),
            "/workspaces/proj/out"
        );
        assert_eq!(join_path(&["/workspaces", "proj", ""]), "/workspaces/proj");
        assert_eq!(join_path(&["/workspaces", "proj"]), "/workspaces/proj");
    }
}
