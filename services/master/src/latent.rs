//! Latent machine lifecycle.
//!
//! A latent machine is the shared physical or virtual host under one or more
//! latent workers. It is started on demand when a worker needs substantiating
//! and stopped again when idle. Two timers drive the idle path:
//!
//! - the **missing timer**, armed when the machine comes up, stops it if no
//!   build ever claims it;
//! - the **build-wait timer**, armed when the last build finishes, keeps the
//!   machine warm for a while in case another build arrives soon.
//!
//! All state transitions for one machine are serialized; concurrent
//! `substantiate()` calls attach to the in-flight start instead of starting
//! the machine twice.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default missing timeout: give a started machine twenty minutes to be
/// claimed by a build before shutting it down.
pub const DEFAULT_MISSING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Lifecycle state of a latent machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A worker hosted on a latent machine.
///
/// Implementations belong to the build-scheduling layer; the machine only
/// needs this narrow view of them.
#[async_trait]
pub trait LatentWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the worker is currently mid-build.
    fn building(&self) -> bool;

    /// Whether the worker starts as soon as its machine does, without
    /// waiting for an explicit substantiation request.
    fn starts_without_substantiate(&self) -> bool;

    async fn substantiate(&self) -> anyhow::Result<()>;

    async fn insubstantiate(&self) -> anyhow::Result<()>;
}

/// Pluggable start/stop strategy for the underlying machine.
#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// Start the machine. `Ok(false)` means the machine declined to start;
    /// it is treated the same as an error, minus the log noise.
    async fn start_machine(&self) -> anyhow::Result<bool>;

    /// Stop the machine. Errors are logged; the machine is assumed gone
    /// rather than retried.
    async fn stop_machine(&self) -> anyhow::Result<()>;
}

struct MachineInner {
    state: MachineState,
    missing_timer: Option<JoinHandle<()>>,
    build_wait_timer: Option<JoinHandle<()>>,
    start_waiters: Vec<oneshot::Sender<bool>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

/// On-demand started/stopped host shared by one or more latent workers.
pub struct LatentMachine {
    name: String,
    backend: Arc<dyn MachineBackend>,
    build_wait_timeout: Duration,
    missing_timeout: Duration,
    workers: std::sync::RwLock<Vec<Arc<dyn LatentWorker>>>,
    inner: Mutex<MachineInner>,
}

impl LatentMachine {
    pub fn new(
        name: &str,
        backend: Arc<dyn MachineBackend>,
        build_wait_timeout: Duration,
        missing_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            backend,
            build_wait_timeout,
            missing_timeout,
            workers: std::sync::RwLock::new(Vec::new()),
            inner: Mutex::new(MachineInner {
                state: MachineState::Stopped,
                missing_timer: None,
                build_wait_timer: None,
                start_waiters: Vec::new(),
                stop_waiters: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a hosted worker. Done at configuration time, before the
    /// machine sees any traffic.
    pub fn add_worker(&self, worker: Arc<dyn LatentWorker>) {
        self.workers.write().unwrap().push(worker);
    }

    pub async fn state(&self) -> MachineState {
        self.inner.lock().await.state
    }

    /// Ensure the machine is started. Returns whether it is up.
    ///
    /// Concurrent callers coalesce onto a single `start_machine()` call and
    /// all receive its outcome.
    pub async fn substantiate(self: &Arc<Self>) -> bool {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                MachineState::Started => return true,
                MachineState::Starting => {
                    let (tx, rx) = oneshot::channel();
                    inner.start_waiters.push(tx);
                    drop(inner);
                    return rx.await.unwrap_or(false);
                }
                MachineState::Stopping => {
                    // Wait out the in-flight stop, then re-check: another
                    // path may have restarted the machine meanwhile.
                    let (tx, rx) = oneshot::channel();
                    inner.stop_waiters.push(tx);
                    drop(inner);
                    let _ = rx.await;
                    continue;
                }
                MachineState::Stopped => {
                    inner.state = MachineState::Starting;
                    clear_timer(&mut inner.build_wait_timer);
                    let (tx, rx) = oneshot::channel();
                    inner.start_waiters.push(tx);
                    drop(inner);
                    // The start runs detached and this caller waits on the
                    // notifier like everyone else; dropping the caller
                    // mid-start cannot strand the machine in Starting.
                    let machine = Arc::clone(self);
                    tokio::spawn(async move { machine.start_from_stopped().await });
                    return rx.await.unwrap_or(false);
                }
            }
        }
    }

    async fn start_from_stopped(self: &Arc<Self>) {
        // Workers that start with the machine should already be waiting for
        // it; kick them off without blocking the machine start.
        let eager: Vec<_> = {
            let workers = self.workers.read().unwrap();
            workers
                .iter()
                .filter(|w| w.starts_without_substantiate())
                .cloned()
                .collect()
        };
        for worker in eager {
            let machine = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.substantiate().await {
                    warn!(machine = %machine, worker = %worker.name(), error = %e, "worker substantiation failed");
                }
            });
        }

        let started = match self.backend.start_machine().await {
            Ok(started) => started,
            Err(e) => {
                error!(machine = %self.name, error = %e, "failed to start machine");
                false
            }
        };

        if !started {
            self.insubstantiate_workers().await;
        }

        let waiters = {
            let mut inner = self.inner.lock().await;
            if started {
                inner.state = MachineState::Started;
                self.arm_missing_timer(&mut inner);
                info!(machine = %self.name, "machine started");
            } else {
                inner.state = MachineState::Stopped;
                info!(machine = %self.name, "machine failed to start");
            }
            mem::take(&mut inner.start_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(started);
        }
    }

    /// Stop the machine if nothing needs it.
    ///
    /// Refuses while any hosted worker is building or while the machine is
    /// still coming up; joins an in-flight stop instead of starting a second
    /// one.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            let any_building = self.workers.read().unwrap().iter().any(|w| w.building());
            if any_building {
                debug!(machine = %self.name, "not stopping, a worker is still building");
                return;
            }
            match inner.state {
                MachineState::Starting => {
                    debug!(machine = %self.name, "not stopping, machine is starting");
                    return;
                }
                MachineState::Stopped => return,
                MachineState::Stopping => {
                    let (tx, rx) = oneshot::channel();
                    inner.stop_waiters.push(tx);
                    drop(inner);
                    let _ = rx.await;
                    return;
                }
                MachineState::Started => {
                    inner.state = MachineState::Stopping;
                    clear_timer(&mut inner.missing_timer);
                    clear_timer(&mut inner.build_wait_timer);
                }
            }
        }

        self.insubstantiate_workers().await;

        if let Err(e) = self.backend.stop_machine().await {
            // The machine is assumed gone rather than retried.
            error!(machine = %self.name, error = %e, "failed to stop machine");
        }

        let waiters = {
            let mut inner = self.inner.lock().await;
            inner.state = MachineState::Stopped;
            mem::take(&mut inner.stop_waiters)
        };
        info!(machine = %self.name, "machine stopped");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// A build claimed this machine: the "nobody ever used it" timeout no
    /// longer applies.
    pub async fn notify_build_started(&self) {
        let mut inner = self.inner.lock().await;
        clear_timer(&mut inner.missing_timer);
    }

    /// A build finished; start the idle countdown unless another build is
    /// still running on one of the hosted workers.
    pub async fn notify_build_finished(self: &Arc<Self>) {
        let any_building = self.workers.read().unwrap().iter().any(|w| w.building());
        let mut inner = self.inner.lock().await;
        if any_building {
            clear_timer(&mut inner.build_wait_timer);
        } else {
            self.arm_build_wait_timer(&mut inner);
        }
    }

    /// Release all hosted workers, best effort. Failures are collected in
    /// logs, never propagated.
    async fn insubstantiate_workers(&self) {
        let workers: Vec<_> = {
            let workers = self.workers.read().unwrap();
            workers.clone()
        };
        for worker in workers {
            if let Err(e) = worker.insubstantiate().await {
                warn!(
                    machine = %self.name,
                    worker = %worker.name(),
                    error = %e,
                    "worker insubstantiation failed"
                );
            }
        }
    }

    fn arm_missing_timer(self: &Arc<Self>, inner: &mut MachineInner) {
        clear_timer(&mut inner.missing_timer);
        let machine = Arc::clone(self);
        inner.missing_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(machine.missing_timeout).await;
            debug!(machine = %machine.name, "missing timeout expired");
            // stop() aborts this timer task; run it detached so the abort
            // can never cancel an in-flight stop.
            tokio::spawn(async move { machine.stop().await });
        }));
    }

    fn arm_build_wait_timer(self: &Arc<Self>, inner: &mut MachineInner) {
        clear_timer(&mut inner.build_wait_timer);
        let machine = Arc::clone(self);
        inner.build_wait_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(machine.build_wait_timeout).await;
            debug!(machine = %machine.name, "build wait timeout expired");
            tokio::spawn(async move { machine.stop().await });
        }));
    }
}

/// Cancel before replacing; a superseded timer must never fire.
fn clear_timer(slot: &mut Option<JoinHandle<()>>) {
    if let Some(timer) = slot.take() {
        timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures_util::future::join_all;

    use super::*;

    struct FakeBackend {
        starts: AtomicUsize,
        stops: AtomicUsize,
        start_result: std::sync::Mutex<anyhow::Result<bool>>,
        start_delay: Duration,
        stop_fails: AtomicBool,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                start_result: std::sync::Mutex::new(Ok(true)),
                start_delay: Duration::from_millis(50),
                stop_fails: AtomicBool::new(false),
            })
        }

        fn failing_start() -> Arc<Self> {
            let backend = Self::new();
            *backend.start_result.lock().unwrap() = Err(anyhow::anyhow!("no capacity"));
            backend
        }

        fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MachineBackend for FakeBackend {
        async fn start_machine(&self) -> anyhow::Result<bool> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            let mut result = self.start_result.lock().unwrap();
            mem::replace(&mut *result, Ok(true))
        }

        async fn stop_machine(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.stop_fails.load(Ordering::SeqCst) {
                anyhow::bail!("unreachable host");
            }
            Ok(())
        }
    }

    struct FakeWorker {
        name: String,
        building: AtomicBool,
        eager: bool,
        substantiations: AtomicUsize,
        insubstantiations: AtomicUsize,
    }

    impl FakeWorker {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                building: AtomicBool::new(false),
                eager: false,
                substantiations: AtomicUsize::new(0),
                insubstantiations: AtomicUsize::new(0),
            })
        }

        fn eager(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                building: AtomicBool::new(false),
                eager: true,
                substantiations: AtomicUsize::new(0),
                insubstantiations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LatentWorker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn building(&self) -> bool {
            self.building.load(Ordering::SeqCst)
        }

        fn starts_without_substantiate(&self) -> bool {
            self.eager
        }

        async fn substantiate(&self) -> anyhow::Result<()> {
            self.substantiations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn insubstantiate(&self) -> anyhow::Result<()> {
            self.insubstantiations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn machine(backend: Arc<FakeBackend>) -> Arc<LatentMachine> {
        LatentMachine::new(
            "m1",
            backend,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_substantiations_start_once() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        let calls = (0..5).map(|_| {
            let machine = Arc::clone(&machine);
            async move { machine.substantiate().await }
        });
        let outcomes = join_all(calls).await;

        assert!(outcomes.into_iter().all(|up| up));
        assert_eq!(backend.start_count(), 1);
        assert_eq!(machine.state().await, MachineState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_substantiate_caller_does_not_wedge_the_machine() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        // The initiating caller gives up while start_machine is still slow.
        let first = tokio::time::timeout(Duration::from_millis(10), machine.substantiate());
        assert!(first.await.is_err());

        // The start keeps running detached; the next caller attaches to it
        // and the machine comes up without a second start.
        assert!(machine.substantiate().await);
        assert_eq!(backend.start_count(), 1);
        assert_eq!(machine.state().await, MachineState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn substantiate_while_started_is_immediate() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        assert!(machine.substantiate().await);
        assert!(machine.substantiate().await);
        assert_eq!(backend.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_reverts_to_stopped_and_releases_workers() {
        let backend = FakeBackend::failing_start();
        let machine = machine(Arc::clone(&backend));
        let worker = FakeWorker::new("lw1");
        machine.add_worker(worker.clone());

        assert!(!machine.substantiate().await);
        assert_eq!(machine.state().await, MachineState::Stopped);
        assert_eq!(worker.insubstantiations.load(Ordering::SeqCst), 1);

        // The machine can be started again after the failure.
        assert!(machine.substantiate().await);
        assert_eq!(backend.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn eager_workers_are_kicked_on_machine_start() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));
        let eager = FakeWorker::eager("lw1");
        let lazy = FakeWorker::new("lw2");
        machine.add_worker(eager.clone());
        machine.add_worker(lazy.clone());

        assert!(machine.substantiate().await);
        tokio::task::yield_now().await;

        assert_eq!(eager.substantiations.load(Ordering::SeqCst), 1);
        assert_eq!(lazy.substantiations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_refuses_while_building() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));
        let worker = FakeWorker::new("lw1");
        machine.add_worker(worker.clone());

        assert!(machine.substantiate().await);
        worker.building.store(true, Ordering::SeqCst);

        machine.stop().await;
        assert_eq!(machine.state().await, MachineState::Started);
        assert_eq!(backend.stop_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_insubstantiates_and_survives_backend_failure() {
        let backend = FakeBackend::new();
        backend.stop_fails.store(true, Ordering::SeqCst);
        let machine = machine(Arc::clone(&backend));
        let worker = FakeWorker::new("lw1");
        machine.add_worker(worker.clone());

        assert!(machine.substantiate().await);
        machine.stop().await;

        // A failed stop still completes the transition.
        assert_eq!(machine.state().await, MachineState::Stopped);
        assert_eq!(worker.insubstantiations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn substantiate_during_stop_waits_and_restarts() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        assert!(machine.substantiate().await);

        let stopper = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.stop().await })
        };
        // Give the stop a chance to reach STOPPING.
        tokio::task::yield_now().await;

        assert!(machine.substantiate().await);
        stopper.await.unwrap();

        assert_eq!(machine.state().await, MachineState::Started);
        assert_eq!(backend.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_timer_stops_an_unclaimed_machine() {
        let backend = FakeBackend::new();
        let machine = LatentMachine::new(
            "m1",
            Arc::clone(&backend) as Arc<dyn MachineBackend>,
            Duration::from_secs(60),
            Duration::from_secs(600),
        );

        assert!(machine.substantiate().await);
        tokio::time::sleep(Duration::from_secs(601)).await;

        assert_eq!(machine.state().await, MachineState::Stopped);
        assert_eq!(backend.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn build_start_clears_the_missing_timer() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        assert!(machine.substantiate().await);
        machine.notify_build_started().await;
        tokio::time::sleep(Duration::from_secs(601)).await;

        assert_eq!(machine.state().await, MachineState::Started);
        assert_eq!(backend.stop_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn build_wait_timer_stops_an_idle_machine() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));

        assert!(machine.substantiate().await);
        machine.notify_build_started().await;
        machine.notify_build_finished().await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(machine.state().await, MachineState::Stopped);
        assert_eq!(backend.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn build_wait_timer_held_while_another_build_runs() {
        let backend = FakeBackend::new();
        let machine = machine(Arc::clone(&backend));
        let busy = FakeWorker::new("lw1");
        machine.add_worker(busy.clone());

        assert!(machine.substantiate().await);
        machine.notify_build_started().await;
        busy.building.store(true, Ordering::SeqCst);
        machine.notify_build_finished().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(machine.state().await, MachineState::Started);
    }
}
