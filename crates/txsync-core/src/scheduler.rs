//! Single-flight cooperative run loop
//!
//! A [`Scheduler`] invokes a caller-supplied step function on one spawned task
//! at a time. Control calls never run the step themselves; they only flip
//! flags under a short lock and hand out completion handles.
//!
//! ```text
//!          trigger                 step → false
//!   Idle ───────────► Running ─────────────────► Idle
//!                        │
//!                        │ stop
//!                        ▼          pass ends
//!                    Stopping ─────────────────► Stopped (terminal)
//! ```
//!
//! - `trigger()` while Running requests one more pass after the current one.
//! - Every `wait()` issued before the loop reaches idle shares one handle.
//! - `stop()` is idempotent: repeated calls share one handle.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// One pass of work. Resolves to `true` while more work remains.
pub type StepFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Cloneable handle that resolves when the scheduler reaches a milestone
#[derive(Clone)]
pub struct Completion {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Completion {
    /// An unresolved handle and the sender that resolves it.
    ///
    /// Dropping the sender also resolves the handle, so a handle can never
    /// outlive its scheduler unresolved.
    fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel::<()>();
        let fut: BoxFuture<'static, ()> = async move {
            let _ = rx.await;
        }
        .boxed();
        (tx, Self { inner: fut.shared() })
    }

    /// A handle that is already resolved
    pub fn ready() -> Self {
        Self {
            inner: futures::future::ready(()).boxed().shared(),
        }
    }

    /// Check without blocking whether the handle has resolved
    pub fn is_complete(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }
}

impl Future for Completion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Observable phase of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Control {
    state: SchedulerState,
    /// A trigger arrived during the current pass
    rerun: bool,
    idle_tx: Option<oneshot::Sender<()>>,
    idle: Option<Completion>,
    stop_tx: Option<oneshot::Sender<()>>,
    stop: Option<Completion>,
}

impl Control {
    fn resolve_idle(&mut self) -> Option<oneshot::Sender<()>> {
        self.idle = None;
        self.idle_tx.take()
    }
}

struct Inner {
    name: String,
    runtime: Handle,
    step: StepFn,
    control: Mutex<Control>,
}

/// Cooperative run loop with trigger/wait/stop semantics
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create an idle scheduler that spawns its passes on `runtime`
    pub fn new(name: impl Into<String>, runtime: Handle, step: StepFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                runtime,
                step,
                control: Mutex::new(Control {
                    state: SchedulerState::Idle,
                    rerun: false,
                    idle_tx: None,
                    idle: None,
                    stop_tx: None,
                    stop: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.control.lock().state
    }

    /// True once `stop()` has been called
    pub fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Stopping | SchedulerState::Stopped
        )
    }

    /// Request a pass.
    ///
    /// Starts the loop when idle, or schedules one more pass when running.
    /// Returns `false` only after the scheduler has been stopped.
    pub fn trigger(&self) -> bool {
        let mut control = self.inner.control.lock();
        match control.state {
            SchedulerState::Stopping | SchedulerState::Stopped => false,
            SchedulerState::Running => {
                control.rerun = true;
                true
            }
            SchedulerState::Idle => {
                control.state = SchedulerState::Running;
                control.rerun = false;
                drop(control);
                trace!(scheduler = %self.inner.name, "Starting run loop");
                let inner = self.inner.clone();
                self.inner.runtime.spawn(run_loop(inner));
                true
            }
        }
    }

    /// Handle that resolves the next time the loop reaches idle.
    ///
    /// Resolves immediately when nothing is running.
    pub fn wait(&self) -> Completion {
        let mut control = self.inner.control.lock();
        match control.state {
            SchedulerState::Idle | SchedulerState::Stopped => Completion::ready(),
            SchedulerState::Running | SchedulerState::Stopping => {
                if let Some(idle) = &control.idle {
                    return idle.clone();
                }
                let (tx, idle) = Completion::pending();
                control.idle_tx = Some(tx);
                control.idle = Some(idle.clone());
                idle
            }
        }
    }

    /// Request permanent shutdown.
    ///
    /// The handle resolves after the current pass exits. Every call returns
    /// the same handle.
    pub fn stop(&self) -> Completion {
        let mut control = self.inner.control.lock();
        if let Some(stop) = &control.stop {
            return stop.clone();
        }

        let (tx, stop) = Completion::pending();
        control.stop = Some(stop.clone());
        match control.state {
            SchedulerState::Running => {
                control.state = SchedulerState::Stopping;
                control.stop_tx = Some(tx);
            }
            SchedulerState::Idle | SchedulerState::Stopping | SchedulerState::Stopped => {
                control.state = SchedulerState::Stopped;
                let _ = tx.send(());
                debug!(scheduler = %self.inner.name, "Scheduler stopped while idle");
            }
        }
        stop
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        let pass = (inner.step)();
        let more = match AssertUnwindSafe(pass).catch_unwind().await {
            Ok(more) => more,
            Err(_) => {
                error!(scheduler = %inner.name, "Step function panicked");
                false
            }
        };

        if !finish_pass(&inner, more) {
            return;
        }
    }
}

/// Settle the control flags after one pass. Returns `true` to run again.
fn finish_pass(inner: &Inner, more: bool) -> bool {
    let mut control = inner.control.lock();

    if control.state == SchedulerState::Stopping {
        control.state = SchedulerState::Stopped;
        control.rerun = false;
        let idle = control.resolve_idle();
        let stop = control.stop_tx.take();
        drop(control);
        if let Some(tx) = idle {
            let _ = tx.send(());
        }
        if let Some(tx) = stop {
            let _ = tx.send(());
        }
        debug!(scheduler = %inner.name, "Scheduler stopped");
        return false;
    }

    if more || std::mem::take(&mut control.rerun) {
        return true;
    }

    control.state = SchedulerState::Idle;
    let idle = control.resolve_idle();
    drop(control);
    if let Some(tx) = idle {
        let _ = tx.send(());
    }
    trace!(scheduler = %inner.name, "Run loop idle");
    false
}
