//! Debounced execution of coalesced trigger bursts.
//!
//! A [`Debouncer`] turns a burst of `trigger()` calls into a single deferred
//! invocation of an async action. It guarantees:
//!
//! - The action is never running concurrently with itself.
//! - A trigger that arrives while the action is running queues exactly one
//!   follow-up run after the current one completes.
//! - `stop()` flushes pending work instead of dropping it.
//!
//! Two scheduling modes exist: `until_idle = true` restarts the delay on
//! every trigger (wait for a quiet period); `until_idle = false` leaves an
//! armed timer alone, so the action runs a fixed delay after the *first*
//! trigger of a burst.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The debounced action. Failures are logged, never propagated to triggerers.
pub type Action = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Scheduling phase of a debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing scheduled or running.
    Idle,
    /// A timer is armed; the action will run when it fires.
    Waiting,
    /// The action is executing.
    Running,
    /// The action is executing and another trigger arrived meanwhile.
    RunningQueued,
}

struct State {
    phase: Phase,
    stopped: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is armed or cancelled; a fire carrying a
    /// stale generation is ignored, so an aborted timer that already woke
    /// up cannot sneak in a run.
    timer_gen: u64,
    /// Resolved whenever the debouncer returns to idle with nothing queued.
    complete_waiters: Vec<oneshot::Sender<()>>,
}

struct Shared {
    wait: Duration,
    until_idle: bool,
    action: Action,
    state: Mutex<State>,
}

/// Coalescing executor for an async action.
#[derive(Clone)]
pub struct Debouncer {
    shared: Arc<Shared>,
}

impl Debouncer {
    /// Create a debouncer that runs `action` at most once per `wait` window.
    pub fn new(wait: Duration, until_idle: bool, action: Action) -> Self {
        Self {
            shared: Arc::new(Shared {
                wait,
                until_idle,
                action,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    stopped: false,
                    timer: None,
                    timer_gen: 0,
                    complete_waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Record a trigger. Triggers received while stopped are dropped.
    pub fn trigger(&self) {
        Shared::trigger(&self.shared);
    }

    /// Wait until the debouncer is idle with nothing queued.
    pub async fn until_complete(&self) {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if state.phase == Phase::Idle {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.complete_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Stop the debouncer, flushing pending work.
    ///
    /// A waiting timer is cancelled and its run happens immediately. An
    /// in-flight run, plus the one queued rerun it may have accumulated,
    /// completes before this returns. Subsequent triggers are no-ops until
    /// [`start`](Self::start).
    pub async fn stop(&self) {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            if state.phase == Phase::Waiting {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.timer_gen += 1;
                let gen = state.timer_gen;
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.fire(gen).await });
            }
            match state.phase {
                Phase::Idle => None,
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.complete_waiters.push(tx);
                    Some(rx)
                }
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// Clear the stopped flag set by [`stop`](Self::stop).
    pub fn start(&self) {
        self.shared.state.lock().unwrap().stopped = false;
    }
}

impl Shared {
    fn trigger(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            debug!("trigger while stopped, dropping");
            return;
        }
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Waiting;
                state.timer_gen += 1;
                let gen = state.timer_gen;
                state.timer = Some(self.spawn_timer(gen));
            }
            Phase::Waiting => {
                if self.until_idle {
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    state.timer_gen += 1;
                    let gen = state.timer_gen;
                    state.timer = Some(self.spawn_timer(gen));
                }
            }
            Phase::Running => {
                state.phase = Phase::RunningQueued;
            }
            Phase::RunningQueued => {}
        }
    }

    fn spawn_timer(self: &Arc<Self>, gen: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.wait).await;
            shared.fire(gen).await;
        })
    }

    /// Run the action, then either rerun (queued), reschedule, or go idle.
    async fn fire(self: &Arc<Self>, gen: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if state.timer_gen != gen {
                // This fire was superseded between waking and getting here.
                return;
            }
            state.phase = Phase::Running;
            state.timer = None;
        }

        loop {
            if let Err(e) = (self.action)().await {
                error!(error = %e, "debounced action failed");
            }

            let mut state = self.state.lock().unwrap();
            let queued = state.phase == Phase::RunningQueued;

            if queued && state.stopped {
                // stop() is waiting on us; honor the queued rerun before
                // resolving its waiter.
                state.phase = Phase::Running;
                drop(state);
                continue;
            }

            state.phase = Phase::Idle;
            let waiters = mem::take(&mut state.complete_waiters);
            drop(state);

            if queued {
                Self::trigger(self);
            }
            for waiter in waiters {
                let _ = waiter.send(());
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_action(runs: Arc<AtomicUsize>) -> Action {
        Arc::new(move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn slow_action(runs: Arc<AtomicUsize>, duration: Duration) -> Action {
        Arc::new(move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                tokio::time::sleep(duration).await;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_single_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_secs(1),
            false,
            counting_action(Arc::clone(&runs)),
        );

        for _ in 0..5 {
            debouncer.trigger();
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_wait_runs_relative_to_first_trigger() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_secs(1),
            false,
            counting_action(Arc::clone(&runs)),
        );

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(800)).await;
        // A later trigger must not push the scheduled run out.
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn until_idle_resets_the_timer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_secs(1),
            true,
            counting_action(Arc::clone(&runs)),
        );

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(800)).await;
        debouncer.trigger();
        // One second after the first trigger nothing has run yet.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // It runs once the quiet period elapses.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_during_run_queues_exactly_one_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_millis(100),
            false,
            slow_action(Arc::clone(&runs), Duration::from_millis(500)),
        );

        debouncer.trigger();
        // Let the timer fire and the run start.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Several triggers during the run collapse to one queued rerun.
        debouncer.trigger();
        debouncer.trigger();
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // The rerun goes back through the scheduling path.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_a_waiting_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_secs(3600),
            false,
            counting_action(Arc::clone(&runs)),
        );

        debouncer.trigger();
        debouncer.stop().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_queued_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_millis(100),
            false,
            slow_action(Arc::clone(&runs), Duration::from_millis(500)),
        );

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.trigger();

        debouncer.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_after_stop_is_a_no_op() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_millis(100),
            false,
            counting_action(Arc::clone(&runs)),
        );

        debouncer.stop().await;
        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // start() re-enables triggering.
        debouncer.start();
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn action_failure_does_not_stop_the_cycle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_inner = Arc::clone(&runs);
        let action: Action = Arc::new(move || {
            let runs = Arc::clone(&runs_inner);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("deliberate failure")
            })
        });
        let debouncer = Debouncer::new(Duration::from_millis(100), false, action);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn until_complete_resolves_after_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(
            Duration::from_millis(100),
            false,
            counting_action(Arc::clone(&runs)),
        );

        debouncer.trigger();
        debouncer.until_complete().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Idle debouncer completes immediately.
        debouncer.until_complete().await;
    }
}
