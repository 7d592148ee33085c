//! Root supervisor: lifecycle, child supervision, discovery, the signal
//! listener hot path, job routing and settlement triggers.
//!
//! The state machine is linear — Init, Starting, Running, Draining, Stopped —
//! with the single Running <-> Draining exception during graceful shutdown.
//! Children are restarted with a `retries x 1s` backoff (capped); a child
//! that exhausts its budget is marked failed and surfaced in stats, and the
//! root itself never restarts on exhaustion. Fatal errors (substrate
//! corruption, codec allocation failure) condemn the substrate: the root
//! cancels everything and drops to Stopped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use substrate::layout::{
    IDX_ECONOMY_EPOCH, IDX_KERNEL_READY, IDX_METRICS_EPOCH, IDX_OUTBOX_DIRTY, IDX_REGISTRY_EPOCH,
    IDX_SYSTEM_EPOCH, METRICS_RECORD_SIZE, OFFSET_JOB_HISTORY, SIZE_JOB_HISTORY,
};
use substrate::{
    crc32c_hash, decode_envelope, decode_job_result, encode_response, Envelope, Error,
    MetricsSnapshot, ModuleRegistry, Response, Result, SabBridge, ENVELOPE_MAGIC,
    FRAME_KIND_JOB_RESULT, FRAME_KIND_SYSCALL_REQUEST, FRAME_KIND_SYSCALL_RESPONSE,
};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::delegate::{HostCallHandler, MeshDelegator, StorageProvider};
use crate::dispatch::Dispatcher;
use crate::economy::CreditSupervisor;
use crate::identity::IdentitySupervisor;
use crate::job::{Job, JobResult};
use crate::social::SocialGraphSupervisor;
use crate::units::{
    ProxyExecutor, ProxyUnitLoader, StorageUnit, UnitKind, UnitLoader, UnitStatsSnapshot,
    UnitSupervisor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Init,
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Pending,
    Done,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChildStatus {
    pub restarts: u32,
    pub failed: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub state: SupervisorState,
    pub jobs_submitted: u64,
    pub jobs_resolved: u64,
    pub syscalls_dispatched: u64,
    pub frames_dropped: u64,
    pub children: Vec<(String, ChildStatus)>,
    pub units: Vec<(String, UnitStatsSnapshot)>,
    pub bridge: MetricsSnapshot,
}

enum MatchRequest {
    PickUnit {
        job_type: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

enum WatchRequest {
    JobPhase {
        job_id: String,
        reply: oneshot::Sender<Option<JobPhase>>,
    },
}

enum AdjustRequest {
    SetSoftCap {
        job_type: String,
        capacity: usize,
        reply: oneshot::Sender<()>,
    },
}

struct ServiceChannels {
    matchmaker: mpsc::Sender<MatchRequest>,
    watcher: mpsc::Sender<WatchRequest>,
    adjuster: mpsc::Sender<AdjustRequest>,
}

struct RootInner {
    bridge: SabBridge,
    registry: Mutex<ModuleRegistry>,
    dispatcher: Dispatcher,
    loader: Arc<dyn UnitLoader>,
    storage: Arc<dyn StorageProvider>,
    economy: Arc<CreditSupervisor>,
    identity: Arc<IdentitySupervisor>,
    social: Arc<SocialGraphSupervisor>,

    units: DashMap<String, Arc<UnitSupervisor>>,
    /// module id -> unit routing key, for deregistration on module exit
    module_units: DashMap<String, String>,
    pending_jobs: DashMap<String, oneshot::Sender<JobResult>>,
    phases: DashMap<String, JobPhase>,
    soft_caps: DashMap<String, usize>,

    state: watch::Sender<SupervisorState>,
    cancel: CancellationToken,
    children: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    child_stats: DashMap<&'static str, ChildStatus>,
    services: Mutex<Option<ServiceChannels>>,

    inflight: AtomicUsize,
    drained: Notify,
    jobs_submitted: AtomicU64,
    jobs_resolved: AtomicU64,
    syscalls_dispatched: AtomicU64,
    frames_dropped: AtomicU64,

    config: KernelConfig,
}

/// Handle the host holds. Conceptually: `InitializeCompute` builds it,
/// `Submit`/`Stop`/`Stats` are methods.
#[derive(Clone)]
pub struct RootSupervisor {
    inner: Arc<RootInner>,
}

impl RootSupervisor {
    pub fn new(
        bridge: SabBridge,
        mesh: Arc<dyn MeshDelegator>,
        storage: Arc<dyn StorageProvider>,
        config: KernelConfig,
    ) -> Self {
        Self::with_parts(bridge, mesh, storage, None, Arc::new(ProxyUnitLoader), config)
    }

    pub fn with_parts(
        bridge: SabBridge,
        mesh: Arc<dyn MeshDelegator>,
        storage: Arc<dyn StorageProvider>,
        host: Option<Arc<dyn HostCallHandler>>,
        loader: Arc<dyn UnitLoader>,
        config: KernelConfig,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Init);
        let dispatcher = Dispatcher::new(bridge.clone(), mesh, host, config.clone());
        Self {
            inner: Arc::new(RootInner {
                registry: Mutex::new(ModuleRegistry::new(bridge.clone())),
                dispatcher,
                loader,
                storage,
                economy: Arc::new(CreditSupervisor::new(bridge.clone())),
                identity: Arc::new(IdentitySupervisor::new(bridge.clone())),
                social: Arc::new(SocialGraphSupervisor::new(bridge.clone())),
                bridge,
                units: DashMap::new(),
                module_units: DashMap::new(),
                pending_jobs: DashMap::new(),
                phases: DashMap::new(),
                soft_caps: DashMap::new(),
                state,
                cancel: CancellationToken::new(),
                children: Mutex::new(Vec::new()),
                child_stats: DashMap::new(),
                services: Mutex::new(None),
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
                jobs_submitted: AtomicU64::new(0),
                jobs_resolved: AtomicU64::new(0),
                syscalls_dispatched: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Status channel for the host; fatal errors surface here as `Stopped`.
    pub fn status(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn bridge(&self) -> &SabBridge {
        &self.inner.bridge
    }

    pub fn economy(&self) -> Arc<CreditSupervisor> {
        Arc::clone(&self.inner.economy)
    }

    pub fn identity(&self) -> Arc<IdentitySupervisor> {
        Arc::clone(&self.inner.identity)
    }

    pub fn social(&self) -> Arc<SocialGraphSupervisor> {
        Arc::clone(&self.inner.social)
    }

    /// Bring the kernel up: built-in units, supervised children, ready flag.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.borrow() != SupervisorState::Init {
            return Err(Error::Internal("supervisor already started".into()));
        }
        inner.set_state(SupervisorState::Starting);
        inner.bridge.check_magic()?;

        // Built-in units: the data proxy (also the compute fallback) and the
        // storage unit over the configured provider.
        inner.register_unit(
            "data",
            UnitSupervisor::queued(
                "data",
                Arc::new(ProxyExecutor::with_builtin_ops(UnitKind::Data)),
                inner.config.queue_capacity,
                inner.cancel.child_token(),
            ),
        );
        inner.register_unit(
            "storage",
            UnitSupervisor::queued(
                "storage",
                Arc::new(StorageUnit::new(Arc::clone(&inner.storage))),
                inner.config.queue_capacity,
                inner.cancel.child_token(),
            ),
        );

        let (match_tx, match_rx) = mpsc::channel(32);
        let (watch_tx, watch_rx) = mpsc::channel(32);
        let (adjust_tx, adjust_rx) = mpsc::channel(32);
        *inner.services.lock() = Some(ServiceChannels {
            matchmaker: match_tx,
            watcher: watch_tx,
            adjuster: adjust_tx,
        });

        self.spawn_child("discovery", 1, |inner| async move {
            discovery_loop(inner).await
        });
        self.spawn_child("signal_listener", 100, |inner| async move {
            signal_listener(inner).await
        });
        self.spawn_child("economy", 10, |inner| async move {
            economy_loop(inner).await
        });
        self.spawn_child("metrics", 10, |inner| async move {
            metrics_loop(inner).await
        });

        let match_rx = Arc::new(tokio::sync::Mutex::new(match_rx));
        self.spawn_child("matchmaker", 10, move |inner| {
            let rx = Arc::clone(&match_rx);
            async move { matchmaker_loop(inner, rx).await }
        });
        let watch_rx = Arc::new(tokio::sync::Mutex::new(watch_rx));
        self.spawn_child("watcher", 10, move |inner| {
            let rx = Arc::clone(&watch_rx);
            async move { watcher_loop(inner, rx).await }
        });
        let adjust_rx = Arc::new(tokio::sync::Mutex::new(adjust_rx));
        self.spawn_child("adjuster", 10, move |inner| {
            let rx = Arc::clone(&adjust_rx);
            async move { adjuster_loop(inner, rx).await }
        });

        inner.set_state(SupervisorState::Running);
        inner.bridge.bump_epoch(IDX_KERNEL_READY);
        inner.bridge.bump_epoch(IDX_SYSTEM_EPOCH);
        log::info!("root supervisor running");
        Ok(())
    }

    /// Submit a job for execution. The receiver yields exactly one result:
    /// success, a typed error, or `Cancelled` on shutdown.
    pub fn submit(&self, job: Job) -> Result<oneshot::Receiver<JobResult>> {
        self.inner.submit(job)
    }

    /// Route a job type to a host-provided executor behind a bounded queue.
    pub fn register_executor(&self, key: &str, executor: Arc<dyn crate::units::UnitExecutor>) {
        let unit = UnitSupervisor::queued(
            key,
            executor,
            self.inner.config.queue_capacity,
            self.inner.cancel.child_token(),
        );
        self.inner.register_unit(key, unit);
    }

    /// Ask the matchmaker which unit a job type resolves to.
    pub async fn pick_unit(&self, job_type: &str) -> Result<Option<String>> {
        let tx = self.inner.service(|s| s.matchmaker.clone())?;
        let (reply, rx) = oneshot::channel();
        tx.send(MatchRequest::PickUnit {
            job_type: job_type.to_string(),
            reply,
        })
        .await
        .map_err(|_| Error::Internal("matchmaker is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("matchmaker dropped the request".into()))
    }

    /// Ask the watcher for a job's phase.
    pub async fn job_phase(&self, job_id: &str) -> Result<Option<JobPhase>> {
        let tx = self.inner.service(|s| s.watcher.clone())?;
        let (reply, rx) = oneshot::channel();
        tx.send(WatchRequest::JobPhase {
            job_id: job_id.to_string(),
            reply,
        })
        .await
        .map_err(|_| Error::Internal("watcher is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("watcher dropped the request".into()))
    }

    /// Adjust a job type's admission valve. Capacity 0 drains: submissions
    /// are rejected with `QueueFull` until raised again.
    pub async fn set_soft_cap(&self, job_type: &str, capacity: usize) -> Result<()> {
        let tx = self.inner.service(|s| s.adjuster.clone())?;
        let (reply, rx) = oneshot::channel();
        tx.send(AdjustRequest::SetSoftCap {
            job_type: job_type.to_string(),
            capacity,
            reply,
        })
        .await
        .map_err(|_| Error::Internal("adjuster is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("adjuster dropped the request".into()))
    }

    pub fn stats(&self) -> SupervisorStats {
        let inner = &self.inner;
        SupervisorStats {
            state: *inner.state.borrow(),
            jobs_submitted: inner.jobs_submitted.load(Ordering::Relaxed),
            jobs_resolved: inner.jobs_resolved.load(Ordering::Relaxed),
            syscalls_dispatched: inner.syscalls_dispatched.load(Ordering::Relaxed),
            frames_dropped: inner.frames_dropped.load(Ordering::Relaxed),
            children: inner
                .child_stats
                .iter()
                .map(|e| (e.key().to_string(), e.value().clone()))
                .collect(),
            units: inner
                .units
                .iter()
                .map(|e| (e.key().clone(), e.value().stats()))
                .collect(),
            bridge: inner.bridge.metrics().snapshot(),
        }
    }

    /// Graceful shutdown: drain in-flight dispatches (each writes a typed
    /// response, `Cancelled` at worst), answer pending jobs, join children.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        match *inner.state.borrow() {
            SupervisorState::Stopped => return Ok(()),
            SupervisorState::Running | SupervisorState::Starting => {}
            SupervisorState::Draining => {}
            SupervisorState::Init => {
                inner.set_state(SupervisorState::Stopped);
                return Ok(());
            }
        }
        inner.set_state(SupervisorState::Draining);
        inner.cancel.cancel();

        // In-flight dispatches complete-or-cancel and always write their
        // response before dropping out of the inflight count.
        let budget = inner.config.dispatch_timeout() + Duration::from_millis(100);
        let deadline = Instant::now() + budget;
        while inner.inflight.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "{} dispatches still in flight at shutdown deadline",
                    inner.inflight.load(Ordering::Acquire)
                );
                break;
            }
            let _ = tokio::time::timeout(remaining, inner.drained.notified()).await;
        }

        // Nothing submitted is ever orphaned.
        let pending: Vec<String> = inner.pending_jobs.iter().map(|e| e.key().clone()).collect();
        for job_id in pending {
            inner.resolve_job(&job_id, JobResult::failure(&job_id, &Error::Cancelled));
        }

        let children: Vec<_> = inner.children.lock().drain(..).collect();
        for handle in children {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(50));
            if tokio::time::timeout(remaining, handle).await.is_err() {
                log::warn!("child loop did not return by the shutdown deadline");
            }
        }

        inner.set_state(SupervisorState::Stopped);
        inner.bridge.bump_epoch(IDX_SYSTEM_EPOCH);
        log::info!("root supervisor stopped");
        Ok(())
    }

    /// Supervised child spawner: restart on error with `retries x 1s` backoff
    /// capped by config, up to `max_restarts`.
    fn spawn_child<F, Fut>(&self, name: &'static str, max_restarts: u32, factory: F)
    where
        F: Fn(Arc<RootInner>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.child_stats.insert(name, ChildStatus::default());
        let handle = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let mut restarts = 0u32;
                loop {
                    match factory(Arc::clone(&inner)).await {
                        Ok(()) => return,
                        Err(e) => {
                            if e.is_fatal() {
                                inner.fatal(name, e);
                                return;
                            }
                            log::warn!("child {} errored: {}", name, e);
                            {
                                let mut stat = inner
                                    .child_stats
                                    .entry(name)
                                    .or_default();
                                stat.last_error = Some(e.to_string());
                                if restarts >= max_restarts {
                                    stat.failed = true;
                                    log::error!(
                                        "child {} exhausted its restart budget ({})",
                                        name,
                                        max_restarts
                                    );
                                    return;
                                }
                                restarts += 1;
                                stat.restarts = restarts;
                            }
                            let backoff = inner.config.restart_backoff(restarts);
                            tokio::select! {
                                _ = inner.cancel.cancelled() => return,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        });
        inner.children.lock().push(handle);
    }
}

impl RootInner {
    fn set_state(&self, state: SupervisorState) {
        let _ = self.state.send_replace(state);
    }

    fn service<T>(&self, f: impl FnOnce(&ServiceChannels) -> T) -> Result<T> {
        self.services
            .lock()
            .as_ref()
            .map(f)
            .ok_or_else(|| Error::Internal("supervisor not started".into()))
    }

    /// Fatal path: condemn the substrate, notify the host, stop everything.
    fn fatal(&self, source: &'static str, err: Error) {
        log::error!("fatal error in {}: {}; condemning substrate", source, err);
        if let Some(mut stat) = self.child_stats.get_mut(source) {
            stat.failed = true;
            stat.last_error = Some(err.to_string());
        }
        self.cancel.cancel();
        self.set_state(SupervisorState::Stopped);
    }

    fn register_unit(&self, key: &str, unit: Arc<UnitSupervisor>) {
        log::info!("unit {} registered ({})", key, unit.kind().as_str());
        self.units.insert(key.to_string(), unit);
    }

    fn resolve_unit_key(&self, job_type: &str) -> Option<String> {
        if self.units.contains_key(job_type) {
            return Some(job_type.to_string());
        }
        // Compute work degrades onto the data proxy.
        if job_type == "compute" && self.units.contains_key("data") {
            return Some("data".to_string());
        }
        None
    }

    fn submit(self: &Arc<Self>, mut job: Job) -> Result<oneshot::Receiver<JobResult>> {
        if *self.state.borrow() != SupervisorState::Running {
            return Err(Error::Internal("supervisor is not running".into()));
        }
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();

        // An already-dead deadline short-circuits before admission.
        if job.deadline_expired() {
            self.phases.insert(job.id.clone(), JobPhase::Done);
            let _ = tx.send(JobResult::failure(&job.id, &Error::DeadlineExceeded));
            return Ok(rx);
        }

        if let Some(cap) = self.soft_caps.get(&job.job_type) {
            if *cap == 0 {
                return Err(Error::QueueFull(job.job_type.clone()));
            }
        }

        let key = self
            .resolve_unit_key(&job.job_type)
            .ok_or_else(|| Error::UnitNotFound(job.job_type.clone()))?;
        let unit = Arc::clone(
            self.units
                .get(&key)
                .ok_or_else(|| Error::UnitNotFound(key.clone()))?
                .value(),
        );

        let (utx, urx) = oneshot::channel();
        unit.submit(job.clone(), utx)?;

        self.pending_jobs.insert(job.id.clone(), tx);
        self.phases.insert(job.id.clone(), JobPhase::Pending);

        // Relay with a deadline race: a late unit result is discarded, the
        // caller hears DeadlineExceeded on time.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match job.time_remaining() {
                Some(remaining) => {
                    tokio::select! {
                        biased;
                        res = urx => res.ok(),
                        _ = tokio::time::sleep(remaining) => {
                            Some(JobResult::failure(&job.id, &Error::DeadlineExceeded))
                        }
                    }
                }
                None => urx.await.ok(),
            };
            let result = outcome.unwrap_or_else(|| JobResult::failure(&job.id, &Error::Cancelled));
            if result.success {
                if let Some(did) = &job.submitter_did {
                    if let Err(e) = inner.economy.accrue(did, result.metrics.cost as i64) {
                        log::warn!("cost accrual for job {} failed: {}", job.id, e);
                    } else {
                        inner.bridge.bump_epoch(IDX_ECONOMY_EPOCH);
                    }
                }
            }
            inner.resolve_job(&job.id, result);
        });
        Ok(rx)
    }

    /// Deliver a result to its one-shot channel, exactly once. Late or
    /// duplicate results are discarded.
    fn resolve_job(&self, job_id: &str, result: JobResult) {
        match self.pending_jobs.remove(job_id) {
            Some((_, tx)) => {
                self.jobs_resolved.fetch_add(1, Ordering::Relaxed);
                self.phases.insert(job_id.to_string(), JobPhase::Done);
                let _ = tx.send(result);
            }
            None => {
                log::debug!("late result for job {} discarded", job_id);
            }
        }
    }

    /// Spawn one task per in-flight syscall; the listener returns to its
    /// wait immediately.
    fn spawn_dispatch(self: &Arc<Self>, slot: u16, env: Envelope) {
        self.syscalls_dispatched.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let response = inner.dispatcher.dispatch_bounded(&env, &inner.cancel).await;
            inner.write_response(slot, &response);
            if inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.drained.notify_waiters();
            }
        });
    }

    /// The response is written before the inbox dirty flag is bumped (the
    /// bump lives inside `inbox_push`), so the caller's wake implies a
    /// readable response.
    fn write_response(&self, slot: u16, response: &Response) {
        let bytes = match encode_response(response) {
            Ok(b) => b,
            Err(e) => {
                log::error!("response for call {} not encodable: {}", response.call_id, e);
                return;
            }
        };
        if let Err(e) = self
            .bridge
            .inbox_push(slot, FRAME_KIND_SYSCALL_RESPONSE, 0, &bytes)
        {
            log::error!(
                "response for call {} not deliverable to slot {}: {}",
                response.call_id,
                slot,
                e
            );
        }
    }

    fn write_metrics_record(&self, epoch: i32) -> Result<()> {
        let record = self.bridge.metrics().snapshot().encode_record(epoch);
        let capacity = SIZE_JOB_HISTORY / METRICS_RECORD_SIZE;
        let interval = self.config.metrics_interval_epochs.max(1);
        let index = (epoch / interval) as usize % capacity;
        self.bridge
            .write_raw(OFFSET_JOB_HISTORY + index * METRICS_RECORD_SIZE, &record)?;
        self.bridge.bump_epoch(IDX_METRICS_EPOCH);
        Ok(())
    }

    /// One discovery pass: fold active modules into the mirror, instantiate
    /// units for newcomers, deregister units whose modules went away.
    fn run_discovery_scan(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        let scanned = registry.scan()?;
        let mut seen = Vec::with_capacity(scanned.len());

        for info in &scanned {
            seen.push(info.id.clone());
            if !registry.observe(info) {
                continue;
            }
            let caps = match registry.read_capabilities(info) {
                Ok(caps) => caps,
                Err(e) => {
                    log::warn!("module {} has a malformed capability table: {}", info.id, e);
                    continue;
                }
            };
            let Some(executor) = self.loader.load(info, &caps) else {
                log::debug!("loader declined module {}", info.id);
                continue;
            };
            let key = UnitKind::from_module_id(&info.id).as_str().to_string();
            if self.units.contains_key(&key) && !self.module_units.contains_key(&info.id) {
                log::debug!(
                    "unit key {} already taken; module {} not routed",
                    key,
                    info.id
                );
                continue;
            }
            let unit = UnitSupervisor::queued(
                &key,
                executor,
                self.config.queue_capacity,
                self.cancel.child_token(),
            );
            self.register_unit(&key, unit);
            self.module_units.insert(info.id.clone(), key);
        }

        // Modules that vanished from the registry take their units with them.
        let known: Vec<String> = self.registry_mirror_keys(&registry);
        for id in known {
            if !seen.contains(&id) {
                registry.forget(&id);
                if let Some((_, key)) = self.module_units.remove(&id) {
                    self.units.remove(&key);
                    log::info!("module {} deregistered; unit {} removed", id, key);
                }
            }
        }
        Ok(())
    }

    fn registry_mirror_keys(&self, registry: &ModuleRegistry) -> Vec<String> {
        registry.mirror().keys().cloned().collect()
    }
}

// ========== CHILD LOOPS ==========

async fn discovery_loop(inner: Arc<RootInner>) -> Result<()> {
    let mut last = inner.bridge.read_atomic_i32(IDX_REGISTRY_EPOCH);
    loop {
        if inner.cancel.is_cancelled() {
            return Ok(());
        }
        inner.run_discovery_scan()?;
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            current = inner.bridge.wait_for_epoch_async(IDX_REGISTRY_EPOCH, last) => {
                last = current;
            }
        }
    }
}

/// The hot path. Parks on the outbox dirty counter, drains frames, spawns a
/// dispatch task per request, resolves job results. Never panics: undecodable
/// frames are logged with a checksum and dropped.
async fn signal_listener(inner: Arc<RootInner>) -> Result<()> {
    let mut last_seq = inner.bridge.read_outbox_sequence();
    loop {
        if inner.cancel.is_cancelled() {
            return Ok(());
        }
        if inner.bridge.read_outbox_sequence() == last_seq {
            tokio::select! {
                _ = inner.cancel.cancelled() => return Ok(()),
                _ = tokio::time::timeout(
                    Duration::from_millis(inner.config.listener_park_ms),
                    inner.bridge.wait_for_epoch_async(IDX_OUTBOX_DIRTY, last_seq),
                ) => {}
            }
            if inner.bridge.read_outbox_sequence() == last_seq {
                continue;
            }
        }
        last_seq = inner.bridge.read_outbox_sequence();

        while let Some((slot, frame)) = inner.bridge.outbox_read_one()? {
            match frame.kind {
                FRAME_KIND_SYSCALL_REQUEST => match decode_envelope(&frame.payload) {
                    Ok(env) if env.header.magic == ENVELOPE_MAGIC => {
                        inner.spawn_dispatch(slot, env);
                    }
                    Ok(env) => {
                        inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "frame from slot {} carries foreign magic {:#010x}; dropped",
                            slot,
                            env.header.magic
                        );
                    }
                    Err(e) => {
                        inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "undecodable frame from slot {} (crc32c {:#010x}): {}",
                            slot,
                            crc32c_hash(&frame.payload),
                            e
                        );
                    }
                },
                FRAME_KIND_JOB_RESULT => match decode_job_result(&frame.payload) {
                    Ok(wire) => {
                        let job_id = wire.job_id.clone();
                        inner.resolve_job(&job_id, wire.into());
                    }
                    Err(e) => {
                        inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "undecodable job result from slot {} (crc32c {:#010x}): {}",
                            slot,
                            crc32c_hash(&frame.payload),
                            e
                        );
                    }
                },
                other => {
                    inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("unexpected frame kind {} from slot {}; dropped", other, slot);
                }
            }
            if inner.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }
}

async fn economy_loop(inner: Arc<RootInner>) -> Result<()> {
    let mut last = inner.bridge.read_atomic_i32(IDX_ECONOMY_EPOCH);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            current = inner.bridge.wait_for_epoch_async(IDX_ECONOMY_EPOCH, last) => {
                last = current;
                inner.economy.on_epoch(current as i64)?;
            }
        }
    }
}

/// Writes bridge counters into the job-history region every
/// `metrics_interval_epochs` system epochs and polices the substrate magic.
async fn metrics_loop(inner: Arc<RootInner>) -> Result<()> {
    let mut last = inner.bridge.read_atomic_i32(IDX_SYSTEM_EPOCH);
    let mut last_written = last;
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            current = inner.bridge.wait_for_epoch_async(IDX_SYSTEM_EPOCH, last) => {
                last = current;
                inner.bridge.check_magic()?;
                if current - last_written >= inner.config.metrics_interval_epochs {
                    inner.write_metrics_record(current)?;
                    last_written = current;
                }
            }
        }
    }
}

async fn matchmaker_loop(
    inner: Arc<RootInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MatchRequest>>>,
) -> Result<()> {
    let mut rx = rx.lock().await;
    let mut tick = tokio::time::interval(inner.config.keepalive());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            _ = tick.tick() => {}
            req = rx.recv() => {
                let Some(MatchRequest::PickUnit { job_type, reply }) = req else { return Ok(()) };
                let _ = reply.send(inner.resolve_unit_key(&job_type));
            }
        }
    }
}

async fn watcher_loop(
    inner: Arc<RootInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WatchRequest>>>,
) -> Result<()> {
    let mut rx = rx.lock().await;
    let mut tick = tokio::time::interval(inner.config.keepalive());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            _ = tick.tick() => {}
            req = rx.recv() => {
                let Some(WatchRequest::JobPhase { job_id, reply }) = req else { return Ok(()) };
                let _ = reply.send(inner.phases.get(&job_id).map(|p| *p));
            }
        }
    }
}

async fn adjuster_loop(
    inner: Arc<RootInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AdjustRequest>>>,
) -> Result<()> {
    let mut rx = rx.lock().await;
    let mut tick = tokio::time::interval(inner.config.keepalive());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            _ = tick.tick() => {}
            req = rx.recv() => {
                let Some(AdjustRequest::SetSoftCap { job_type, capacity, reply }) = req else {
                    return Ok(());
                };
                inner.soft_caps.insert(job_type, capacity);
                let _ = reply.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{MemoryMesh, MemoryStore};
    use substrate::layout::SUBSTRATE_SIZE_MIN;

    fn supervisor() -> RootSupervisor {
        let bridge = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        RootSupervisor::new(
            bridge,
            Arc::new(MemoryMesh::new()),
            Arc::new(MemoryStore::new(4 * 1024 * 1024)),
            KernelConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let root = supervisor();
        assert_eq!(root.state(), SupervisorState::Init);
        root.start().unwrap();
        assert_eq!(root.state(), SupervisorState::Running);
        assert!(root.start().is_err());
        root.stop().await.unwrap();
        assert_eq!(root.state(), SupervisorState::Stopped);
        // Stop is idempotent.
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_echo_job() {
        let root = supervisor();
        root.start().unwrap();

        let rx = root
            .submit(Job::new("data", "echo").with_data(b"round trip".to_vec()))
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, b"round trip");

        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_compute_falls_back_to_data() {
        let root = supervisor();
        root.start().unwrap();
        assert_eq!(
            root.pick_unit("compute").await.unwrap(),
            Some("data".to_string())
        );
        let rx = root
            .submit(Job::new("compute", "echo").with_data(vec![1]))
            .unwrap();
        assert!(rx.await.unwrap().success);
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_is_unit_not_found() {
        let root = supervisor();
        root.start().unwrap();
        assert!(matches!(
            root.submit(Job::new("quantum", "solve")),
            Err(Error::UnitNotFound(_))
        ));
        assert_eq!(root.pick_unit("quantum").await.unwrap(), None);
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_deadline_is_immediate() {
        let root = supervisor();
        root.start().unwrap();
        let mut job = Job::new("data", "echo").with_data(vec![1]);
        job.deadline_ms = Some(1);
        let started = Instant::now();
        let result = root.submit(job).unwrap().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(result.error.as_deref(), Some("DeadlineExceeded"));
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_tracks_phases() {
        let root = supervisor();
        root.start().unwrap();
        let mut job = Job::new("data", "echo").with_data(vec![7]);
        job.id = "tracked".into();
        let rx = root.submit(job).unwrap();
        rx.await.unwrap();
        assert_eq!(
            root.job_phase("tracked").await.unwrap(),
            Some(JobPhase::Done)
        );
        assert_eq!(root.job_phase("unknown").await.unwrap(), None);
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_adjuster_soft_cap_drains() {
        let root = supervisor();
        root.start().unwrap();
        root.set_soft_cap("data", 0).await.unwrap();
        assert!(matches!(
            root.submit(Job::new("data", "echo").with_data(vec![1])),
            Err(Error::QueueFull(_))
        ));
        root.set_soft_cap("data", 8).await.unwrap();
        assert!(root.submit(Job::new("data", "echo").with_data(vec![1])).is_ok());
        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let root = supervisor();
        root.start().unwrap();
        let rx = root
            .submit(Job::new("data", "echo").with_data(vec![1]))
            .unwrap();
        rx.await.unwrap();

        let stats = root.stats();
        assert_eq!(stats.state, SupervisorState::Running);
        assert_eq!(stats.jobs_submitted, 1);
        assert_eq!(stats.jobs_resolved, 1);
        assert!(stats.children.iter().any(|(n, _)| n == "signal_listener"));
        assert!(stats.units.iter().any(|(n, _)| n == "data"));
        serde_json::to_string(&stats).unwrap();

        root.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_stop_rejected() {
        let root = supervisor();
        root.start().unwrap();
        root.stop().await.unwrap();
        assert!(root.submit(Job::new("data", "echo").with_data(vec![1])).is_err());
    }
}
