// Redis-list job queue for background work.
//
// Job state lives in `titan:job:<id>` keys with a TTL; queue membership is
// three lists. Claiming uses BRPOPLPUSH so a job moves from pending to
// processing atomically: a crashed worker leaves it in processing for
// recovery, never lost and never double-claimed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, TitanError};

const JOB_PREFIX: &str = "titan:job:";
pub const QUEUE_PENDING: &str = "titan:jobs:pending";
pub const QUEUE_PROCESSING: &str = "titan:jobs:processing";
pub const QUEUE_DLQ: &str = "titan:jobs:dlq";

pub const DEFAULT_JOB_TTL_SECONDS: u64 = 86_400 * 7;
pub const DEFAULT_RESULT_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Exhausted its retries and moved to the DLQ.
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub task: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub dlq: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    redis: ConnectionManager,
    job_ttl_seconds: u64,
    result_ttl_seconds: u64,
    max_retries: u32,
}

impl JobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            job_ttl_seconds: DEFAULT_JOB_TTL_SECONDS,
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_ttls(mut self, job_ttl_seconds: u64, result_ttl_seconds: u64) -> Self {
        self.job_ttl_seconds = job_ttl_seconds;
        self.result_ttl_seconds = result_ttl_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn job_key(job_id: &str) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    async fn store_job(&self, job: &Job, ttl_seconds: u64) -> Result<()> {
        let mut redis = self.redis.clone();
        let encoded = serde_json::to_string(job)
            .map_err(|e| TitanError::Internal(anyhow::Error::new(e)))?;
        redis
            .set_ex::<_, _, ()>(Self::job_key(&job.id), encoded, ttl_seconds)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// Submit a job; returns its id.
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        task: &str,
        payload: Value,
        priority: i32,
        max_retries: Option<u32>,
    ) -> Result<String> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            task: task.to_string(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: max_retries.unwrap_or(self.max_retries),
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        self.store_job(&job, self.job_ttl_seconds).await?;

        let mut redis = self.redis.clone();
        redis
            .lpush::<_, _, ()>(QUEUE_PENDING, &job.id)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        info!(job_id = %job.id, task, "job submitted");
        Ok(job.id)
    }

    #[instrument(skip(self))]
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut redis = self.redis.clone();
        let encoded: Option<String> = redis
            .get(Self::job_key(job_id))
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        encoded
            .map(|encoded| serde_json::from_str(&encoded).map_err(TitanError::from))
            .transpose()
    }

    /// Claim up to `batch_size` jobs, blocking up to `timeout_seconds` for
    /// the first one. Each claim is one atomic right-pop-left-push.
    #[instrument(skip(self))]
    pub async fn claim_jobs(&self, batch_size: usize, timeout_seconds: f64) -> Result<Vec<Job>> {
        let mut claimed = Vec::new();
        let mut redis = self.redis.clone();

        for attempt in 0..batch_size {
            // Only the first claim blocks; the rest drain what is ready.
            let timeout = if attempt == 0 { timeout_seconds } else { 0.001 };
            let job_id: Option<String> = redis
                .brpoplpush(QUEUE_PENDING, QUEUE_PROCESSING, timeout)
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            let Some(job_id) = job_id else { break };

            let Some(mut job) = self.get_job(&job_id).await? else {
                // State key expired while queued; drop the orphan.
                warn!(job_id, "claimed job without state, discarding");
                redis
                    .lrem::<_, _, usize>(QUEUE_PROCESSING, 1, &job_id)
                    .await
                    .map_err(|e| TitanError::Unavailable(e.to_string()))?;
                continue;
            };

            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            self.store_job(&job, self.job_ttl_seconds).await?;
            info!(job_id = %job.id, attempt = job.attempts, "job claimed");
            claimed.push(job);
        }
        Ok(claimed)
    }

    #[instrument(skip(self, result))]
    pub async fn complete_job(&self, job_id: &str, result: Option<Value>) -> Result<()> {
        let Some(mut job) = self.get_job(job_id).await? else {
            warn!(job_id, "job not found for completion");
            return Ok(());
        };
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = result;
        self.store_job(&job, self.result_ttl_seconds).await?;

        let mut redis = self.redis.clone();
        redis
            .lrem::<_, _, usize>(QUEUE_PROCESSING, 1, job_id)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        info!(job_id, "job completed");
        Ok(())
    }

    /// Record a failure: retry while attempts remain, else dead-letter.
    #[instrument(skip(self))]
    pub async fn fail_job(&self, job_id: &str, error: &str, retry: bool) -> Result<()> {
        let Some(mut job) = self.get_job(job_id).await? else {
            warn!(job_id, "job not found for failure");
            return Ok(());
        };
        job.error = Some(error.to_string());

        let mut redis = self.redis.clone();
        redis
            .lrem::<_, _, usize>(QUEUE_PROCESSING, 1, job_id)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;

        if retry && job.attempts < job.max_retries {
            job.status = JobStatus::Pending;
            self.store_job(&job, self.job_ttl_seconds).await?;
            redis
                .lpush::<_, _, ()>(QUEUE_PENDING, job_id)
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            info!(
                job_id,
                attempts = job.attempts,
                max_retries = job.max_retries,
                "job requeued for retry"
            );
        } else {
            job.status = JobStatus::Dead;
            job.completed_at = Some(Utc::now());
            self.store_job(&job, self.job_ttl_seconds).await?;
            redis
                .lpush::<_, _, ()>(QUEUE_DLQ, job_id)
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            warn!(job_id, "job moved to dlq");
        }
        Ok(())
    }

    /// Cancel a job that has not finished. Returns false when the job is
    /// unknown or already terminal.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let Some(mut job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            return Ok(false);
        }

        let mut redis = self.redis.clone();
        redis
            .lrem::<_, _, usize>(QUEUE_PENDING, 1, job_id)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        redis
            .lrem::<_, _, usize>(QUEUE_PROCESSING, 1, job_id)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.store_job(&job, self.result_ttl_seconds).await?;
        info!(job_id, "job cancelled");
        Ok(true)
    }

    /// List jobs by queue membership, optionally filtered by status.
    #[instrument(skip(self))]
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut redis = self.redis.clone();
        let queues: &[&str] = match status {
            Some(JobStatus::Pending) => &[QUEUE_PENDING],
            Some(JobStatus::Running) => &[QUEUE_PROCESSING],
            Some(JobStatus::Dead) => &[QUEUE_DLQ],
            _ => &[QUEUE_PENDING, QUEUE_PROCESSING, QUEUE_DLQ],
        };

        let mut seen: HashMap<String, ()> = HashMap::new();
        let mut jobs = Vec::new();
        for queue in queues {
            let ids: Vec<String> = redis
                .lrange(*queue, 0, limit as isize - 1)
                .await
                .map_err(|e| TitanError::Unavailable(e.to_string()))?;
            for job_id in ids {
                if jobs.len() >= limit {
                    return Ok(jobs);
                }
                if seen.insert(job_id.clone(), ()).is_some() {
                    continue;
                }
                if let Some(job) = self.get_job(&job_id).await? {
                    if status.map_or(true, |status| job.status == status) {
                        jobs.push(job);
                    }
                }
            }
        }
        Ok(jobs)
    }

    #[instrument(skip(self))]
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let mut redis = self.redis.clone();
        let pending: usize = redis
            .llen(QUEUE_PENDING)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        let processing: usize = redis
            .llen(QUEUE_PROCESSING)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        let dlq: usize = redis
            .llen(QUEUE_DLQ)
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        Ok(QueueStats {
            pending,
            processing,
            dlq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_shape() {
        let job = Job {
            id: "j1".into(),
            task: "export_aasx".into(),
            payload: serde_json::json!({"aasId": "urn:x:aas:1"}),
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: 3,
            priority: 5,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["maxRetries"], 3);
        assert!(json.get("startedAt").is_none());

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.task, "export_aasx");
    }

    #[test]
    fn test_dead_status_string() {
        assert_eq!(
            serde_json::to_value(JobStatus::Dead).unwrap(),
            serde_json::json!("dead")
        );
    }

    #[test]
    fn test_job_key() {
        assert_eq!(JobQueue::job_key("abc"), "titan:job:abc");
    }
}
