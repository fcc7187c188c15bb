//! Tests for worker registration, heartbeat, and the event loop.


use std::sync::Arc;
use std::time::Duration;

use fleetq::docker::ContainerRuntime;
use fleetq::job::ResultStatus;
use fleetq::kv::{self, KvStore};
use fleetq::metadata::{self, Identity};
use fleetq::worker::{Signal, Worker, WorkerRecord, WorkerStatus};
use test_harness::{
    assert_eventually, enqueue, queued_job, stored_job, test_config, FakeDocker, MemoryKv,
};

fn identity(id: &str) -> Identity {
    Identity {
        name: format!("{}-host", id),
        instance_id: id.to_string(),
        private_ip: "10.0.0.1".to_string(),
        public_ip: "54.0.0.1".to_string(),
    }
}

fn worker_record(kv: &MemoryKv, id: &str) -> WorkerRecord {
    let raw = kv.get(&kv::worker_key(id)).expect("worker record missing");
    serde_json::from_str(&raw).expect("invalid worker record")
}

async fn new_worker(kv: &Arc<MemoryKv>, docker: &Arc<FakeDocker>, id: &str) -> Worker {
    let store: Arc<dyn KvStore> = kv.clone();
    let runtime: Arc<dyn ContainerRuntime> = docker.clone();
    Worker::new(test_config(), identity(id), store, runtime)
        .await
        .expect("worker construction failed")
}

#[tokio::test]
async fn test_registration_persists_record() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::new();
    let worker = new_worker(&kv, &docker, "i-001").await;
    assert_eq!(worker.id(), "i-001");

    let record = worker_record(&kv, "i-001");
    assert_eq!(record.status, WorkerStatus::Alive);
    assert_eq!(record.instance_id, "i-001");
    assert_eq!(record.id, record.instance_id);
    assert_eq!(record.job, 0);
    assert_eq!(record.name, "i-001-host");
}

#[tokio::test]
async fn test_metadata_fallback_identity() {
    // Nothing listens on this port, so the bootstrap must fall back.
    let detected = metadata::detect_from("http://127.0.0.1:9").await;
    assert_eq!(detected, Identity::fallback());

    let kv = MemoryKv::new();
    let docker = FakeDocker::new();
    let store: Arc<dyn KvStore> = kv.clone();
    let runtime: Arc<dyn ContainerRuntime> = docker.clone();
    let worker = Worker::new(test_config(), detected, store, runtime)
        .await
        .unwrap();

    let record = worker_record(&kv, worker.id());
    assert_eq!(record.name, "worker");
    assert_eq!(record.instance_id, "instance-id");
    assert_eq!(record.status, WorkerStatus::Alive);
}

#[tokio::test]
async fn test_heartbeat_advances_while_idle() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::new();
    let worker = new_worker(&kv, &docker, "i-002").await;
    let signals = worker.signal_sender();
    let initial = worker_record(&kv, "i-002").heartbeat;

    let handle = tokio::spawn(worker.run());

    assert_eventually(
        Duration::from_secs(2),
        || worker_record(&kv, "i-002").heartbeat > initial,
        "first heartbeat",
    )
    .await;
    let first = worker_record(&kv, "i-002").heartbeat;
    assert_eventually(
        Duration::from_secs(2),
        || worker_record(&kv, "i-002").heartbeat > first,
        "second heartbeat",
    )
    .await;

    signals.send(Signal::Stop).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_stop_signal_exits_loop() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::new();
    let worker = new_worker(&kv, &docker, "i-003").await;
    let signals = worker.signal_sender();

    let handle = tokio::spawn(worker.run());
    signals.send(Signal::Stop).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_save_signal_rewrites_record() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::new();
    let worker = new_worker(&kv, &docker, "i-004").await;
    let signals = worker.signal_sender();
    let handle = tokio::spawn(worker.run());

    // Clobber the stored record, then ask the worker to re-save it.
    kv.set(&kv::worker_key("i-004"), "clobbered", 0).await.unwrap();
    signals.send(Signal::Save).await.unwrap();

    assert_eventually(
        Duration::from_secs(2),
        || {
            kv.get(&kv::worker_key("i-004"))
                .map(|raw| serde_json::from_str::<WorkerRecord>(&raw).is_ok())
                .unwrap_or(false)
        },
        "record was not re-saved",
    )
    .await;

    signals.send(Signal::Stop).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_worker_claims_and_finishes_job() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::with_local_images(&["earthkit/cli:latest", "ubuntu:latest"]);
    let key = enqueue(&kv, &queued_job("ubuntu", "hello", None)).await;

    let worker = new_worker(&kv, &docker, "i-005").await;
    let signals = worker.signal_sender();
    let handle = tokio::spawn(worker.run());

    assert_eventually(
        Duration::from_secs(5),
        || stored_job(&kv, &key).result.is_some(),
        "job did not finish",
    )
    .await;

    let job = stored_job(&kv, &key);
    assert_eq!(job.owner, "i-005");
    assert_eq!(job.result.unwrap().status, ResultStatus::Success);

    signals.send(Signal::Stop).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_two_workers_race_for_single_job() {
    let kv = MemoryKv::new();
    let docker = FakeDocker::with_local_images(&["earthkit/cli:latest", "ubuntu:latest"]);
    let key = enqueue(&kv, &queued_job("ubuntu", "hello", None)).await;

    let worker_a = new_worker(&kv, &docker, "i-00a").await;
    let worker_b = new_worker(&kv, &docker, "i-00b").await;
    let signals_a = worker_a.signal_sender();
    let signals_b = worker_b.signal_sender();
    let handle_a = tokio::spawn(worker_a.run());
    let handle_b = tokio::spawn(worker_b.run());

    assert_eventually(
        Duration::from_secs(5),
        || stored_job(&kv, &key).result.is_some(),
        "job did not finish",
    )
    .await;

    let job = stored_job(&kv, &key);
    assert!(
        job.owner == "i-00a" || job.owner == "i-00b",
        "owner must be one of the racing workers, got {:?}",
        job.owner
    );
    // The workload ran exactly once despite two claimants.
    assert_eq!(docker.containers_for_image("ubuntu").len(), 1);

    signals_a.send(Signal::Stop).await.unwrap();
    signals_b.send(Signal::Stop).await.unwrap();
    handle_a.await.unwrap();
    handle_b.await.unwrap();
}
