//! Asynchronous job bookkeeping.
//!
//! A job is created `Pending` by [`JobTracker::submit`] and moved to finished
//! exactly once by [`JobTracker::complete`]. Polls always see either the
//! pending record or the complete result, never something in between. Jobs
//! live in memory only and are lost on restart.

use luagate_common::error::{GateError, Result};
use luagate_common::protocol::ExecutionResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::runtime::ExecutionOutput;

/// In-memory map from job id to its current [`ExecutionResult`].
///
/// Cloning yields a handle to the same map.
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, ExecutionResult>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh job id and records it as pending.
    pub async fn submit(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.jobs.write().await.insert(id.clone(), ExecutionResult::pending());
        tracing::debug!(job = %id, "job submitted");
        id
    }

    /// Records the outcome of job `id`.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if `id` was never submitted
    /// - `JobAlreadyCompleted` if a result is already recorded; the first
    ///   result is kept
    pub async fn complete(&self, id: &str, outcome: Result<ExecutionOutput>) -> Result<()> {
        let result = match outcome {
            Ok(output) => ExecutionResult::success(output.return_value, output.headers),
            Err(e) => ExecutionResult::failed(&e),
        };

        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(id).ok_or_else(|| GateError::JobNotFound(id.to_string()))?;
        if entry.finished {
            return Err(GateError::JobAlreadyCompleted(id.to_string()));
        }
        *entry = result;
        tracing::debug!(job = id, failed = entry.failure.is_some(), "job completed");
        Ok(())
    }

    /// Snapshot of job `id`.
    pub async fn poll(&self, id: &str) -> Result<ExecutionResult> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GateError::JobNotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use luagate_common::error::FailureKind;
    use luagate_common::protocol::HeaderSet;

    fn output(value: &str) -> ExecutionOutput {
        let mut headers = HeaderSet::new();
        headers.insert("X-Job".into(), "yes".into());
        ExecutionOutput {
            return_value: value.into(),
            headers,
        }
    }

    #[tokio::test]
    async fn test_submit_is_pending() {
        let jobs = JobTracker::new();
        let id = jobs.submit().await;

        let snapshot = jobs.poll(&id).await.unwrap();
        assert!(!snapshot.finished);
        assert_eq!(jobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let jobs = JobTracker::new();
        let a = jobs.submit().await;
        let b = jobs.submit().await;
        assert_ne!(a, b);
        assert_eq!(jobs.len().await, 2);
    }

    #[tokio::test]
    async fn test_complete_success() {
        let jobs = JobTracker::new();
        let id = jobs.submit().await;
        jobs.complete(&id, Ok(output("done"))).await.unwrap();

        let snapshot = jobs.poll(&id).await.unwrap();
        assert!(snapshot.finished);
        assert_eq!(snapshot.return_value, "done");
        assert!(snapshot.failure.is_none());
        assert_eq!(snapshot.headers.get("X-Job").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_complete_failure() {
        let jobs = JobTracker::new();
        let id = jobs.submit().await;
        jobs.complete(&id, Err(GateError::Timeout(250))).await.unwrap();

        let snapshot = jobs.poll(&id).await.unwrap();
        assert!(snapshot.finished);
        assert_eq!(snapshot.return_value, "");
        let failure = snapshot.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("250ms"));
    }

    #[tokio::test]
    async fn test_second_complete_is_rejected_and_first_kept() {
        let jobs = JobTracker::new();
        let id = jobs.submit().await;
        jobs.complete(&id, Ok(output("first"))).await.unwrap();

        let err = jobs.complete(&id, Ok(output("second"))).await.unwrap_err();
        assert!(matches!(err, GateError::JobAlreadyCompleted(_)));
        assert_eq!(jobs.poll(&id).await.unwrap().return_value, "first");
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let jobs = JobTracker::new();
        assert!(matches!(jobs.poll("nope").await, Err(GateError::JobNotFound(_))));
        assert!(matches!(
            jobs.complete("nope", Ok(output("x"))).await,
            Err(GateError::JobNotFound(_))
        ));
        assert!(jobs.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_polls_see_whole_results() {
        let jobs = JobTracker::new();
        let id = jobs.submit().await;

        let mut pollers = Vec::new();
        for _ in 0..8 {
            let jobs = jobs.clone();
            let id = id.clone();
            pollers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = jobs.poll(&id).await.unwrap();
                    if snapshot.finished {
                        assert_eq!(snapshot.return_value, "payload-result");
                        assert_eq!(snapshot.headers.len(), 1);
                    } else {
                        assert!(snapshot.return_value.is_empty());
                        assert!(snapshot.headers.is_empty());
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        jobs.complete(&id, Ok(output("payload-result"))).await.unwrap();
        for poller in pollers {
            poller.await.unwrap();
        }
    }
}
