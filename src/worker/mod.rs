//! The worker control plane.
//!
//! A worker registers itself in the KV store, then runs a single
//! cooperative event loop that multiplexes:
//! - **Signals**: `SAVE`, `JOB_DONE`, and `STOP` on an mpsc channel
//! - **Heartbeat ticks**: periodic re-save of the worker record
//! - **Poll ticks**: queue scans while no job is running
//!
//! At most one job pipeline runs per worker; it executes on its own task
//! and reports completion back through the signal channel, so heartbeats
//! and stop requests stay responsive during long jobs.

pub mod allocator;

pub use allocator::JobAllocator;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::config::WorkerConfig;
use crate::docker::ContainerRuntime;
use crate::error::Result;
use crate::job::JobRunner;
use crate::kv::{self, KvStore};
use crate::metadata::Identity;

const SIGNAL_BUFFER: usize = 8;

/// Control messages delivered to the worker event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Save,
    JobDone,
    Stop,
    Ok,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Save => write!(f, "SAVE"),
            Signal::JobDone => write!(f, "JOB_DONE"),
            Signal::Stop => write!(f, "STOP"),
            Signal::Ok => write!(f, "OK"),
        }
    }
}

/// CPU/memory usage placeholders carried in the worker record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerStats {
    pub cpu: f32,
    pub mem: f32,
    pub mem_x: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    #[serde(rename = "ALIVE")]
    Alive,
    /// Written by an external liveness detector, never by the worker.
    #[serde(rename = "DEAD")]
    Dead,
}

/// The worker document persisted at `/workers/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerRecord {
    pub name: String,
    pub instance_id: String,
    pub private_ip: String,
    pub public_ip: String,
    /// Legacy slot, kept at 0 for schema compatibility.
    pub job: i64,
    pub heartbeat: DateTime<Utc>,
    pub stats: WorkerStats,
    pub status: WorkerStatus,
    pub id: String,
}

pub struct Worker {
    record: WorkerRecord,
    config: Arc<WorkerConfig>,
    kv: Arc<dyn KvStore>,
    docker: Arc<dyn ContainerRuntime>,
    allocator: JobAllocator,
    signals_tx: mpsc::Sender<Signal>,
    signals_rx: Option<mpsc::Receiver<Signal>>,
    current_job: Option<JoinHandle<()>>,
}

impl Worker {
    /// Build the worker record from its cloud identity and register it in
    /// the KV store. A registration failure is fatal.
    pub async fn new(
        config: WorkerConfig,
        identity: Identity,
        kv: Arc<dyn KvStore>,
        docker: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let record = WorkerRecord {
            name: identity.name,
            instance_id: identity.instance_id.clone(),
            private_ip: identity.private_ip,
            public_ip: identity.public_ip,
            job: 0,
            heartbeat: Utc::now(),
            stats: WorkerStats::default(),
            status: WorkerStatus::Alive,
            // Same as InstanceId for now; separate field so the two can
            // diverge without a schema change.
            id: identity.instance_id,
        };
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let allocator = JobAllocator::new(record.id.clone(), kv.clone());

        let worker = Self {
            record,
            config: Arc::new(config),
            kv,
            docker,
            allocator,
            signals_tx,
            signals_rx: Some(signals_rx),
            current_job: None,
        };

        tracing::info!(worker_id = %worker.record.id, "registering worker");
        worker.register().await?;
        Ok(worker)
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }

    /// A handle for delivering signals into the event loop, e.g. from the
    /// shutdown handler or a finished pipeline.
    pub fn signal_sender(&self) -> mpsc::Sender<Signal> {
        self.signals_tx.clone()
    }

    async fn register(&self) -> Result<()> {
        let value = serde_json::to_string(&self.record)?;
        self.kv
            .set(&kv::worker_key(&self.record.id), &value, 0)
            .await?;
        Ok(())
    }

    /// Best-effort save of the worker record; a failure is logged and the
    /// next tick retries.
    async fn save(&self) {
        let value = match serde_json::to_string(&self.record) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(worker_id = %self.record.id, error = %e, "failed to serialize worker record");
                return;
            }
        };
        if let Err(e) = self.kv.set(&kv::worker_key(&self.record.id), &value, 0).await {
            tracing::warn!(worker_id = %self.record.id, error = %e, "failed to save worker record");
        }
    }

    /// Run the event loop until a stop signal arrives or the signal
    /// channel closes. A running pipeline is not aborted by stop; it
    /// finishes on its own task.
    pub async fn run(mut self) {
        let mut signals = match self.signals_rx.take() {
            Some(signals) => signals,
            None => return,
        };

        let mut heartbeat_tick = interval_at(
            Instant::now() + self.config.heartbeat_rate,
            self.config.heartbeat_rate,
        );
        let mut poll_tick = interval_at(
            Instant::now() + self.config.poll_rate,
            self.config.poll_rate,
        );

        tracing::info!(worker_id = %self.record.id, "worker started");
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(Signal::Save) => self.save().await,
                    Some(Signal::JobDone) => {
                        tracing::info!(worker_id = %self.record.id, "job done");
                        self.record.job = 0;
                        self.current_job = None;
                        self.save().await;
                    }
                    Some(signal) => {
                        tracing::info!(worker_id = %self.record.id, %signal, "stopping worker loop");
                        break;
                    }
                    None => break,
                },
                _ = heartbeat_tick.tick() => {
                    tracing::debug!(worker_id = %self.record.id, "heartbeat");
                    self.record.heartbeat = Utc::now();
                    self.save().await;
                }
                _ = poll_tick.tick() => {
                    if self.current_job.is_none() {
                        self.poll().await;
                    }
                }
            }
        }
    }

    /// One poll tick: try to claim a job and, on success, spawn its
    /// pipeline and install it as the current job.
    async fn poll(&mut self) {
        if let Some(job) = self.allocator.poll().await {
            let runner = JobRunner::new(
                self.record.id.clone(),
                self.kv.clone(),
                self.docker.clone(),
                self.config.clone(),
                self.signals_tx.clone(),
            );
            self.current_job = Some(tokio::spawn(runner.run(job)));
        }
    }
}
