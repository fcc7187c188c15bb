use std::sync::Arc;

use crate::error::Result;
use crate::job::{Job, JobState};
use crate::kv::{self, KvError, KvNode, KvStore};

/// Claims queued jobs from the shared store.
///
/// All workers scan `/jobs` in the same ascending key order; the
/// compare-and-swap on a node's modification index is the sole
/// allocation point, so a job is claimed by at most one worker.
pub struct JobAllocator {
    worker_id: String,
    kv: Arc<dyn KvStore>,
}

impl JobAllocator {
    pub fn new(worker_id: impl Into<String>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            worker_id: worker_id.into(),
            kv,
        }
    }

    /// Scan the queue and try to claim the first QUEUED job. Returns
    /// `None` when nothing is claimable; listing or claim errors are
    /// logged and retried by the next poll tick.
    pub async fn poll(&self) -> Option<Job> {
        let nodes = match self.kv.get_ordered_children(kv::PATH_JOBS).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "failed to list job queue");
                return None;
            }
        };

        for node in &nodes {
            match self.try_allocate(node).await {
                Ok(Some(job)) => {
                    tracing::info!(worker_id = %self.worker_id, job_id = %job.id, "allocated job");
                    return Some(job);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "aborting allocation scan");
                    return None;
                }
            }
        }
        None
    }

    /// Attempt to claim one node. `Ok(None)` means "not claimable by us"
    /// (already allocated, unparseable, or lost the CAS race) and the scan
    /// moves on; a real error aborts the scan.
    async fn try_allocate(&self, node: &KvNode) -> Result<Option<Job>> {
        let mut job: Job = match serde_json::from_str(&node.value) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(key = %node.key, error = %e, "skipping unparseable job record");
                return Ok(None);
            }
        };
        if !job.is_queued() {
            return Ok(None);
        }

        job.set_state(JobState::Started, "Allocated");
        job.owner = self.worker_id.clone();
        job.id = key_base(&node.key);

        let value = serde_json::to_string(&job)?;
        match self.kv.cas_set(&node.key, &value, node.mod_index).await {
            Ok(()) => Ok(Some(job)),
            Err(KvError::CasConflict) => {
                tracing::debug!(key = %node.key, "lost allocation race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn key_base(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_base_strips_directory() {
        assert_eq!(key_base("/jobs/00000000000000000042"), "00000000000000000042");
        assert_eq!(key_base("bare"), "bare");
    }
}
