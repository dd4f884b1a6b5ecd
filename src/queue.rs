use chrono::Utc;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{JOB_BACKOFF_INITIAL, JOB_KEEP_COMPLETED, JOB_KEEP_FAILED};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("queue poisoned")]
    Poisoned,
}

/// One claimed unit of work: a (signature, tracked account) pair plus the
/// cached notification payload when the feed delivered one.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub signature: String,
    pub tracked_account: String,
    pub payload: Option<Value>,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Retry delay for the given attempt number (1-based): exponential from the
/// configured initial delay.
pub fn retry_backoff(attempt: u32) -> Duration {
    JOB_BACKOFF_INITIAL * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Durable priority job queue over the shared SQLite handle.
///
/// Jobs survive restarts; stale `active` rows left by a previous process are
/// recovered to `pending` at startup. The attached rate limiter bounds how
/// fast consumers may claim work, which in turn caps upstream-API fan-out.
#[derive(Clone)]
pub struct JobQueue {
    name: String,
    conn: Arc<Mutex<Connection>>,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl JobQueue {
    pub fn new(
        name: &str,
        conn: Arc<Mutex<Connection>>,
        rate_limit_max: u32,
        rate_window: Duration,
    ) -> Self {
        let burst = NonZeroU32::new(rate_limit_max).unwrap_or(nonzero!(1u32));
        let per_job = rate_window
            .checked_div(rate_limit_max.max(1))
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(1));
        let quota = Quota::with_period(per_job)
            .unwrap_or_else(|| Quota::per_second(nonzero!(30u32)))
            .allow_burst(burst);

        info!(
            "Queue '{}' ready: {} jobs per {:?} window",
            name, rate_limit_max, rate_window
        );

        Self {
            name: name.to_string(),
            conn,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Reset `active` rows abandoned by a previous process
    pub fn recover_stale(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let recovered = conn.execute(
            "UPDATE jobs SET status = 'pending', updated_at = CURRENT_TIMESTAMP
             WHERE queue = ?1 AND status = 'active'",
            params![self.name],
        )?;
        if recovered > 0 {
            warn!("Queue '{}': recovered {} stale active jobs", self.name, recovered);
        }
        Ok(recovered)
    }

    /// Insert a new job. Callers are expected to have passed the dedup layer
    /// first; the queue itself does not deduplicate.
    pub fn enqueue(
        &self,
        signature: &str,
        tracked_account: &str,
        payload: Option<&Value>,
        priority: i64,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, queue, signature, tracked_account, payload, priority, run_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                self.name,
                signature,
                tracked_account,
                payload.map(|p| p.to_string()),
                priority,
                Utc::now().timestamp_millis(),
            ],
        )?;
        debug!("Queue '{}': enqueued {} for {}", self.name, signature, tracked_account);
        Ok(id)
    }

    /// Claim the next runnable job, waiting on the rate limiter first.
    /// Returns None when nothing is runnable right now.
    pub async fn claim_ready(&self) -> Result<Option<Job>, QueueError> {
        self.limiter.until_ready().await;
        self.claim()
    }

    /// Claim without waiting on the limiter (used by tests and shutdown
    /// drains)
    pub fn claim(&self) -> Result<Option<Job>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.lock()?;
        let job: Option<Job> = conn
            .query_row(
                "SELECT id, signature, tracked_account, payload, priority, attempts, max_attempts
                 FROM jobs
                 WHERE queue = ?1 AND status = 'pending' AND run_at_ms <= ?2
                 ORDER BY priority DESC, run_at_ms ASC
                 LIMIT 1",
                params![self.name, now_ms],
                |row| {
                    Ok(Job {
                        id: row.get(0)?,
                        queue: self.name.clone(),
                        signature: row.get(1)?,
                        tracked_account: row.get(2)?,
                        payload: row
                            .get::<_, Option<String>>(3)?
                            .and_then(|raw| serde_json::from_str(&raw).ok()),
                        priority: row.get(4)?,
                        attempts: row.get(5)?,
                        max_attempts: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(job) = job else {
            return Ok(None);
        };

        let claimed = conn.execute(
            "UPDATE jobs SET status = 'active', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'pending'",
            params![job.id],
        )?;
        if claimed == 0 {
            // Another consumer took it between the select and the update
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Mark a job done and prune completed rows beyond the retention cap
    pub fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET status = 'completed', updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![job_id],
        )?;
        conn.execute(
            "DELETE FROM jobs WHERE queue = ?1 AND status = 'completed' AND id NOT IN (
                 SELECT id FROM jobs WHERE queue = ?1 AND status = 'completed'
                 ORDER BY updated_at DESC LIMIT ?2)",
            params![self.name, JOB_KEEP_COMPLETED as i64],
        )?;
        Ok(())
    }

    /// Record a failed attempt. The job is rescheduled with exponential
    /// backoff until its attempts are exhausted, then parked as failed.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let conn = self.lock()?;
        let (attempts, max_attempts): (u32, u32) = conn.query_row(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let attempts = attempts + 1;
        if attempts >= max_attempts {
            conn.execute(
                "UPDATE jobs SET status = 'failed', attempts = ?2, last_error = ?3,
                        updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                params![job_id, attempts, error],
            )?;
            conn.execute(
                "DELETE FROM jobs WHERE queue = ?1 AND status = 'failed' AND id NOT IN (
                     SELECT id FROM jobs WHERE queue = ?1 AND status = 'failed'
                     ORDER BY updated_at DESC LIMIT ?2)",
                params![self.name, JOB_KEEP_FAILED as i64],
            )?;
            warn!("Queue '{}': job {} exhausted retries: {}", self.name, job_id, error);
        } else {
            let run_at = Utc::now().timestamp_millis() + retry_backoff(attempts).as_millis() as i64;
            conn.execute(
                "UPDATE jobs SET status = 'pending', attempts = ?2, last_error = ?3,
                        run_at_ms = ?4, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                params![job_id, attempts, error, run_at],
            )?;
            debug!(
                "Queue '{}': job {} retry {}/{} in {:?}",
                self.name,
                job_id,
                attempts,
                max_attempts,
                retry_backoff(attempts)
            );
        }
        Ok(())
    }

    /// Pending + active job count
    pub fn depth(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status IN ('pending', 'active')",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(depth as usize)
    }

    /// Drop every job in this queue, regardless of state
    pub fn obliterate(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM jobs WHERE queue = ?1", params![self.name])?;
        info!("Queue '{}': obliterated {} jobs", self.name, removed);
        Ok(removed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_queue() -> JobQueue {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(include_str!("../schema.sql")).expect("schema");
        JobQueue::new(
            "signature-processing",
            Arc::new(Mutex::new(conn)),
            30,
            Duration::from_millis(5000),
        )
    }

    #[test]
    fn test_enqueue_claim_complete() {
        let queue = test_queue();
        queue
            .enqueue("sig1", "wallet1", Some(&json!({"k": "v"})), 0)
            .expect("enqueue");
        assert_eq!(queue.depth().unwrap(), 1);

        let job = queue.claim().expect("claim").expect("job present");
        assert_eq!(job.signature, "sig1");
        assert_eq!(job.tracked_account, "wallet1");
        assert_eq!(job.payload, Some(json!({"k": "v"})));

        // Active jobs are not claimable again
        assert!(queue.claim().expect("claim").is_none());

        queue.complete(&job.id).expect("complete");
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[test]
    fn test_priority_ordering() {
        let queue = test_queue();
        queue.enqueue("sig-low", "w", None, 0).unwrap();
        queue.enqueue("sig-high", "w", None, 10).unwrap();
        let job = queue.claim().unwrap().unwrap();
        assert_eq!(job.signature, "sig-high");
    }

    #[test]
    fn test_fail_reschedules_with_backoff() {
        let queue = test_queue();
        queue.enqueue("sig1", "w", None, 0).unwrap();
        let job = queue.claim().unwrap().unwrap();

        queue.fail(&job.id, "rpc timeout").expect("fail");
        // Backed off into the future: not immediately claimable
        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.depth().unwrap(), 1);
    }

    #[test]
    fn test_exhausted_attempts_park_job() {
        let queue = test_queue();
        queue.enqueue("sig1", "w", None, 0).unwrap();
        let job = queue.claim().unwrap().unwrap();
        // max_attempts defaults to 3
        queue.fail(&job.id, "boom 1").unwrap();
        queue.fail(&job.id, "boom 2").unwrap();
        queue.fail(&job.id, "boom 3").unwrap();
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[test]
    fn test_backoff_schedule_is_exponential() {
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(2), Duration::from_secs(4));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_recover_stale_active_jobs() {
        let queue = test_queue();
        queue.enqueue("sig1", "w", None, 0).unwrap();
        let _job = queue.claim().unwrap().unwrap();
        assert!(queue.claim().unwrap().is_none());

        let recovered = queue.recover_stale().unwrap();
        assert_eq!(recovered, 1);
        assert!(queue.claim().unwrap().is_some());
    }

    #[test]
    fn test_obliterate() {
        let queue = test_queue();
        queue.enqueue("sig1", "w", None, 0).unwrap();
        queue.enqueue("sig2", "w", None, 0).unwrap();
        assert_eq!(queue.obliterate().unwrap(), 2);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[test]
    fn test_rate_limiter_bounds_burst() {
        let queue = test_queue();
        // 30-job burst allowance: the 31st immediate check is denied
        let mut admitted = 0;
        for _ in 0..40 {
            if queue.limiter.check().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 30);
    }
}
