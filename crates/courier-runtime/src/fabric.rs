//! Execution fabric
//!
//! Pluggable pool that runs delivery workers and inbound sessions. Every
//! implementation honours the same contract:
//!
//! - `submit` hands over a unit of work or fails with `ExecutionRejected`
//!   once shutdown has begun
//! - `submit_long_lived` does the same for units that live as long as a
//!   connection; they never count against a worker budget
//! - `shutdown` is two-phase: stop accepting, wait up to the grace period
//!   for in-flight units, then cancel and abort whatever is left
//!
//! Units receive a [`CancelToken`] and must observe it at every sleep and loop
//! boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, FabricConfig, FabricKind, Result};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Future produced by a unit of work
pub type UnitFuture = BoxFuture<'static, ()>;

/// Work submitted to a fabric
pub type UnitOfWork = Box<dyn FnOnce(CancelToken) -> UnitFuture + Send + 'static>;

/// Wrap an async closure as a [`UnitOfWork`]
pub fn unit_of_work<F, Fut>(work: F) -> UnitOfWork
where
    F: FnOnce(CancelToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |cancel: CancelToken| -> UnitFuture { Box::pin(work(cancel)) })
}

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

/// Fires the cancellation observed by every [`CancelToken`] cloned from it
#[derive(Debug)]
pub struct CancelTrigger {
    sender: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn pair() -> (Self, CancelToken) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, CancelToken { receiver })
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Cancellation signal handed to every unit of work.
///
/// A dropped trigger counts as cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolve once cancellation fires
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns false when the
    /// sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Fabric Contract
// ----------------------------------------------------------------------------

/// Result of a two-phase shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Units still running when the grace period ended
    pub cancelled: usize,
    pub graceful: bool,
}

#[async_trait]
pub trait ExecutionFabric: Send + Sync {
    /// Hand a unit over for execution
    fn submit(&self, name: &str, unit: UnitOfWork) -> Result<()>;

    /// Hand over a unit that runs until its connection ends. It is cancelled
    /// on shutdown like any other unit but holds no worker slot.
    fn submit_long_lived(&self, name: &str, unit: UnitOfWork) -> Result<()>;

    /// Stop accepting, wait for the grace period, then cancel what is left
    async fn shutdown(&self) -> ShutdownReport;

    fn is_accepting(&self) -> bool;

    /// Units submitted and not yet finished
    fn in_flight(&self) -> usize;
}

/// Build the fabric selected by configuration. `host` is the runtime used by
/// [`FabricKind::Host`]; the current runtime is used when none is given.
pub fn build_fabric(config: &FabricConfig, host: Option<Handle>) -> Result<Arc<dyn ExecutionFabric>> {
    let handle = match host {
        Some(handle) => handle,
        None => Handle::try_current()
            .map_err(|e| CourierError::config_error(format!("no tokio runtime available: {}", e)))?,
    };

    let fabric: Arc<dyn ExecutionFabric> = match config.kind {
        FabricKind::FixedPool { workers } => {
            Arc::new(FixedPool::new(workers, config.shutdown_grace(), handle)?)
        }
        FabricKind::Host => Arc::new(HostPool::new(config.shutdown_grace(), handle)),
    };
    Ok(fabric)
}

// ----------------------------------------------------------------------------
// Unit Tracker
// ----------------------------------------------------------------------------

/// Bookkeeping shared by both fabric implementations
struct UnitTracker {
    label: &'static str,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    tasks: Mutex<JoinSet<()>>,
    trigger: CancelTrigger,
    handle: Handle,
    grace: Duration,
}

/// Decrements the in-flight count when a unit ends, however it ends
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UnitTracker {
    fn new(label: &'static str, grace: Duration, handle: Handle) -> Self {
        let (trigger, _) = CancelTrigger::pair();
        Self {
            label,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(JoinSet::new()),
            trigger,
            handle,
            grace,
        }
    }

    fn spawn<F>(&self, name: &str, make: F) -> Result<()>
    where
        F: FnOnce(CancelToken, InFlightGuard) -> UnitFuture,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CourierError::execution_rejected(format!(
                "{} is shutting down, {} not accepted",
                self.label, name
            )));
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());
        let future = make(self.trigger.token(), guard);
        let span = tracing::debug_span!("unit", fabric = self.label, name = %name);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(future.instrument(span), &self.handle);
        Ok(())
    }

    fn spawn_unbounded(&self, name: &str, unit: UnitOfWork) -> Result<()> {
        self.spawn(name, move |cancel: CancelToken, guard: InFlightGuard| -> UnitFuture {
            Box::pin(async move {
                let _guard = guard;
                unit(cancel).await;
            })
        })
    }

    async fn shutdown(&self) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        info!("{} shutdown requested ({} units in flight)", self.label, self.in_flight());

        let deadline = Instant::now().checked_add(self.grace);
        while self.in_flight() > 0 && deadline.map_or(true, |deadline| Instant::now() < deadline) {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let cancelled = self.in_flight();
        if cancelled > 0 {
            warn!("{} cancelling {} units after grace period", self.label, cancelled);
        }
        self.trigger.cancel();

        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        debug!("{} shutdown complete", self.label);
        ShutdownReport {
            cancelled,
            graceful: cancelled == 0,
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Fixed Pool
// ----------------------------------------------------------------------------

/// Pool running at most `workers` units at a time
pub struct FixedPool {
    tracker: UnitTracker,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl FixedPool {
    pub fn new(workers: usize, grace: Duration, handle: Handle) -> Result<Self> {
        if workers == 0 {
            return Err(CourierError::config_error("fixed pool needs at least one worker"));
        }

        Ok(Self {
            tracker: UnitTracker::new("fixed-pool", grace, handle),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[async_trait]
impl ExecutionFabric for FixedPool {
    fn submit(&self, name: &str, unit: UnitOfWork) -> Result<()> {
        let permits = self.permits.clone();
        self.tracker.spawn(name, move |cancel: CancelToken, guard: InFlightGuard| -> UnitFuture {
            Box::pin(async move {
                let _guard = guard;
                let permit = tokio::select! {
                    permit = permits.acquire_owned() => permit,
                    _ = cancel.cancelled() => return,
                };
                let Ok(_permit) = permit else { return };
                unit(cancel).await;
            })
        })
    }

    fn submit_long_lived(&self, name: &str, unit: UnitOfWork) -> Result<()> {
        self.tracker.spawn_unbounded(name, unit)
    }

    async fn shutdown(&self) -> ShutdownReport {
        let report = self.tracker.shutdown().await;
        self.permits.close();
        report
    }

    fn is_accepting(&self) -> bool {
        self.tracker.accepting.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }
}

// ----------------------------------------------------------------------------
// Host Pool
// ----------------------------------------------------------------------------

/// Delegates scheduling to a runtime owned by the host application
pub struct HostPool {
    tracker: UnitTracker,
}

impl HostPool {
    pub fn new(grace: Duration, handle: Handle) -> Self {
        Self {
            tracker: UnitTracker::new("host-pool", grace, handle),
        }
    }
}

#[async_trait]
impl ExecutionFabric for HostPool {
    fn submit(&self, name: &str, unit: UnitOfWork) -> Result<()> {
        self.tracker.spawn_unbounded(name, unit)
    }

    fn submit_long_lived(&self, name: &str, unit: UnitOfWork) -> Result<()> {
        self.tracker.spawn_unbounded(name, unit)
    }

    async fn shutdown(&self) -> ShutdownReport {
        self.tracker.shutdown().await
    }

    fn is_accepting(&self) -> bool {
        self.tracker.accepting.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }
}
