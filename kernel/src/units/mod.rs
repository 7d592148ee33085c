//! Unit supervisors: per-capability executors behind bounded job queues.
//!
//! A unit is a routing key (the job type), a kind tag, and an executor. The
//! queued flavor owns one worker task draining an MPSC channel with admission
//! control (`QueueFull`) and deadline expiry; the direct flavor executes each
//! job on a freshly spawned task. Both deliver exactly one result per job.

pub mod proxy;
pub mod storage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use substrate::{Capability, Error, ModuleInfo, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobMetrics, JobResult};

pub use proxy::ProxyExecutor;
pub use storage::StorageUnit;

/// The closed set of unit variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Compute,
    Storage,
    Ml,
    Physics,
    Driver,
    Crypto,
    Data,
    Audio,
    Image,
    Science,
    Mining,
    Gpu,
    Generic,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Compute => "compute",
            UnitKind::Storage => "storage",
            UnitKind::Ml => "ml",
            UnitKind::Physics => "physics",
            UnitKind::Driver => "driver",
            UnitKind::Crypto => "crypto",
            UnitKind::Data => "data",
            UnitKind::Audio => "audio",
            UnitKind::Image => "image",
            UnitKind::Science => "science",
            UnitKind::Mining => "mining",
            UnitKind::Gpu => "gpu",
            UnitKind::Generic => "generic",
        }
    }

    /// Kind inferred from a module id; unknown ids execute as generic units.
    pub fn from_module_id(id: &str) -> Self {
        match id {
            "compute" => UnitKind::Compute,
            "storage" | "vault" => UnitKind::Storage,
            "ml" => UnitKind::Ml,
            "physics" => UnitKind::Physics,
            "drivers" | "driver" => UnitKind::Driver,
            "crypto" => UnitKind::Crypto,
            "data" => UnitKind::Data,
            "audio" => UnitKind::Audio,
            "image" => UnitKind::Image,
            "science" => UnitKind::Science,
            "mining" => UnitKind::Mining,
            "gpu" => UnitKind::Gpu,
            _ => UnitKind::Generic,
        }
    }
}

/// An executor turns a job into output bytes. Must be deterministic for the
/// same operation, parameters, data and substrate epoch.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    fn kind(&self) -> UnitKind;
    async fn execute(&self, job: &Job) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct UnitStats {
    pub executed: AtomicU64,
    pub failed: AtomicU64,
    pub expired: AtomicU64,
    pub rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UnitStatsSnapshot {
    pub executed: u64,
    pub failed: u64,
    pub expired: u64,
    pub rejected: u64,
}

struct QueuedJob {
    job: Job,
    reply: oneshot::Sender<JobResult>,
}

pub struct UnitSupervisor {
    name: String,
    kind: UnitKind,
    executor: Arc<dyn UnitExecutor>,
    queue: Option<mpsc::Sender<QueuedJob>>,
    stats: UnitStats,
}

impl UnitSupervisor {
    /// Queue-backed unit: one worker task drains the bounded channel until
    /// the token fires.
    pub fn queued(
        name: &str,
        executor: Arc<dyn UnitExecutor>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let unit = Arc::new(Self {
            name: name.to_string(),
            kind: executor.kind(),
            executor,
            queue: Some(tx),
            stats: UnitStats::default(),
        });
        tokio::spawn(Self::worker(Arc::clone(&unit), rx, cancel));
        unit
    }

    /// Direct unit: no queue; each submission runs on its own task.
    pub fn direct(name: &str, executor: Arc<dyn UnitExecutor>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind: executor.kind(),
            executor,
            queue: None,
            stats: UnitStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    pub fn stats(&self) -> UnitStatsSnapshot {
        UnitStatsSnapshot {
            executed: self.stats.executed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Admit a job. The reply channel receives exactly one result unless
    /// admission itself fails, in which case the caller keeps the channel.
    pub fn submit(self: &Arc<Self>, job: Job, reply: oneshot::Sender<JobResult>) -> Result<()> {
        match &self.queue {
            Some(tx) => match tx.try_send(QueuedJob { job, reply }) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(Error::QueueFull(self.name.clone()))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(Error::Internal(format!("unit {} worker is gone", self.name)))
                }
            },
            None => {
                let unit = Arc::clone(self);
                tokio::spawn(async move {
                    let result = unit.execute_job(&job).await;
                    let _ = reply.send(result);
                });
                Ok(())
            }
        }
    }

    /// Execute synchronously in the caller's task, measuring duration and
    /// charging a simple time-based cost.
    pub async fn execute_job(&self, job: &Job) -> JobResult {
        let started = Instant::now();
        match self.executor.execute(job).await {
            Ok(data) => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                let duration_us = started.elapsed().as_micros() as u64;
                JobResult::ok(
                    &job.id,
                    data,
                    JobMetrics {
                        duration_us,
                        cost: 1 + duration_us / 1_000,
                    },
                )
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("unit {} job {} failed: {}", self.name, job.id, e);
                JobResult::failure(&job.id, &e)
            }
        }
    }

    async fn worker(
        unit: Arc<Self>,
        mut rx: mpsc::Receiver<QueuedJob>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Anything still queued is answered, never orphaned.
                    while let Ok(q) = rx.try_recv() {
                        let _ = q.reply.send(JobResult::failure(&q.job.id, &Error::Cancelled));
                    }
                    return;
                }
                next = rx.recv() => {
                    let Some(q) = next else { return };
                    if q.job.deadline_expired() {
                        unit.stats.expired.fetch_add(1, Ordering::Relaxed);
                        let _ = q.reply.send(JobResult::failure(&q.job.id, &Error::DeadlineExceeded));
                        continue;
                    }
                    let result = unit.execute_job(&q.job).await;
                    let _ = q.reply.send(result);
                }
            }
        }
    }
}

/// Instantiates executors for modules surfaced by discovery.
pub trait UnitLoader: Send + Sync {
    fn load(&self, info: &ModuleInfo, caps: &[Capability]) -> Option<Arc<dyn UnitExecutor>>;
}

/// Default loader: a library proxy whose operation set is the module's
/// advertised capability list.
pub struct ProxyUnitLoader;

impl UnitLoader for ProxyUnitLoader {
    fn load(&self, info: &ModuleInfo, caps: &[Capability]) -> Option<Arc<dyn UnitExecutor>> {
        let kind = UnitKind::from_module_id(&info.id);
        Some(Arc::new(ProxyExecutor::for_capabilities(kind, caps)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SlowEcho {
        delay: Duration,
    }

    #[async_trait]
    impl UnitExecutor for SlowEcho {
        fn kind(&self) -> UnitKind {
            UnitKind::Generic
        }

        async fn execute(&self, job: &Job) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            Ok(job.data.clone())
        }
    }

    fn job(id: &str) -> Job {
        let mut j = Job::new("generic", "echo").with_data(b"ping".to_vec());
        j.id = id.to_string();
        j
    }

    #[tokio::test]
    async fn test_queued_unit_executes_in_order() {
        let cancel = CancellationToken::new();
        let unit = UnitSupervisor::queued(
            "generic",
            Arc::new(SlowEcho {
                delay: Duration::from_millis(1),
            }),
            8,
            cancel.clone(),
        );

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (tx, rx) = oneshot::channel();
            unit.submit(job(&format!("j{}", i)), tx).unwrap();
            receivers.push(rx);
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            let res = rx.await.unwrap();
            assert!(res.success);
            assert_eq!(res.job_id, format!("j{}", i));
            assert_eq!(res.data, b"ping");
            assert!(res.metrics.duration_us > 0);
        }
        assert_eq!(unit.stats().executed, 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let cancel = CancellationToken::new();
        // Worker is busy for a long time; capacity 1 fills immediately.
        let unit = UnitSupervisor::queued(
            "busy",
            Arc::new(SlowEcho {
                delay: Duration::from_secs(10),
            }),
            1,
            cancel.clone(),
        );

        let (tx1, _rx1) = oneshot::channel();
        unit.submit(job("a"), tx1).unwrap();
        // Give the worker a moment to pick up the first job.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (tx2, _rx2) = oneshot::channel();
        unit.submit(job("b"), tx2).unwrap();

        let (tx3, _rx3) = oneshot::channel();
        let err = unit.submit(job("c"), tx3).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        assert_eq!(unit.stats().rejected, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_expired_job_rejected_by_worker() {
        let cancel = CancellationToken::new();
        let unit = UnitSupervisor::queued(
            "generic",
            Arc::new(SlowEcho {
                delay: Duration::from_millis(1),
            }),
            8,
            cancel.clone(),
        );
        let mut j = job("expired");
        j.deadline_ms = Some(1); // far in the past
        let (tx, rx) = oneshot::channel();
        unit.submit(j, tx).unwrap();
        let res = rx.await.unwrap();
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("DeadlineExceeded"));
        assert_eq!(unit.stats().expired, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancellation_answers_queued_jobs() {
        let cancel = CancellationToken::new();
        let unit = UnitSupervisor::queued(
            "slow",
            Arc::new(SlowEcho {
                delay: Duration::from_secs(10),
            }),
            8,
            cancel.clone(),
        );
        let (tx1, _rx1) = oneshot::channel();
        unit.submit(job("running"), tx1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (tx2, rx2) = oneshot::channel();
        unit.submit(job("queued"), tx2).unwrap();

        cancel.cancel();
        let res = rx2.await.unwrap();
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn test_direct_unit_spawns() {
        let unit = UnitSupervisor::direct(
            "direct",
            Arc::new(SlowEcho {
                delay: Duration::from_millis(1),
            }),
        );
        assert!(!unit.has_queue());
        let (tx, rx) = oneshot::channel();
        unit.submit(job("d"), tx).unwrap();
        assert!(rx.await.unwrap().success);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(UnitKind::from_module_id("compute"), UnitKind::Compute);
        assert_eq!(UnitKind::from_module_id("vault"), UnitKind::Storage);
        assert_eq!(UnitKind::from_module_id("weird"), UnitKind::Generic);
        assert_eq!(UnitKind::Ml.as_str(), "ml");
    }
}
