//! The single writer of the twin.
//!
//! One dedicated thread owns the `DigitalTwin` and runs command bodies in
//! submission order. Callers get a `CommandHandle` back immediately. After a
//! body returns, the worker resolves the caller's handle and only then
//! flushes the command's notifications, before dequeuing anything else.
//! Bodies that return a pending future release the worker; the settled
//! result comes back through the same queue so flushing stays on the worker.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context as TaskContext, Poll};
use std::thread;
use std::time::Instant;

use anyhow::Context;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::bus::NotificationBus;
use crate::command::{CommandFuture, CommandResult, Completion, DependentCommand, FnCommand, Parent, TwinCommand};
use crate::config::GatewayConfig;
use crate::digital_twin::DigitalTwin;
use crate::error::TwinError;
use crate::middleware::observability::Metrics;
use crate::notification::NotificationAccumulator;

const WORKER_NAME: &str = "twin-gateway";

/// What happens to queued commands when the gateway stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Run everything already queued.
    #[default]
    Drain,
    /// Reject everything still queued with `Closed`.
    Abandon,
}

/// Future of a submitted command.
///
/// Dropping it does not cancel the command. Once the result has been taken,
/// through `try_result` or by polling, the handle yields `Closed`.
#[must_use = "the command runs regardless; the handle carries its result"]
pub struct CommandHandle<T> {
    rx: Option<oneshot::Receiver<Result<T, TwinError>>>,
}

impl<T> CommandHandle<T> {
    fn channel() -> (oneshot::Sender<Result<T, TwinError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx: Some(rx) })
    }

    /// Takes the result if the command has settled.
    pub fn try_result(&mut self) -> Option<Result<T, TwinError>> {
        let rx = self.rx.as_mut()?;
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(TwinError::Closed),
        };
        self.rx = None;
        Some(result)
    }
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T, TwinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(TwinError::Closed));
        };
        let result = ready!(Pin::new(rx).poll(cx)).unwrap_or(Err(TwinError::Closed));
        self.rx = None;
        Poll::Ready(result)
    }
}

type Responder<T> = oneshot::Sender<Result<T, TwinError>>;

enum WorkItem {
    Command(Box<dyn Job>),
    Completion(Box<dyn Job>),
    Shutdown {
        mode: ShutdownMode,
        done: oneshot::Sender<()>,
    },
}

trait Job: Send {
    fn run(self: Box<Self>, worker: &mut Worker);

    fn reject(self: Box<Self>, error: TwinError);
}

struct CommandJob<C: TwinCommand> {
    command: C,
    responder: Responder<C::Output>,
    submitted: Instant,
}

impl<C: TwinCommand> Job for CommandJob<C> {
    fn run(self: Box<Self>, worker: &mut Worker) {
        let CommandJob { command, responder, submitted } = *self;
        worker.twin.begin_command();
        let outcome = catch_unwind(AssertUnwindSafe(|| command.call(&mut worker.twin)))
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "command panicked");
                Err(TwinError::Panicked(message))
            });
        let notifications = worker.twin.take_notifications();
        match outcome {
            Ok(Completion::Done(value)) => worker.settle(responder, Ok(value), notifications, submitted),
            Ok(Completion::Deferred(future)) => worker.defer(future, responder, notifications, submitted),
            Err(e) => worker.settle(responder, Err(e), notifications, submitted),
        }
    }

    fn reject(self: Box<Self>, error: TwinError) {
        let _ = self.responder.send(Err(error));
    }
}

/// Settled result of a deferred command, queued back to the worker.
struct CompletionJob<T> {
    result: Result<T, TwinError>,
    responder: Responder<T>,
    notifications: NotificationAccumulator,
    submitted: Instant,
}

impl<T: Send + 'static> Job for CompletionJob<T> {
    fn run(self: Box<Self>, worker: &mut Worker) {
        let CompletionJob { result, responder, notifications, submitted } = *self;
        worker.in_flight = worker.in_flight.saturating_sub(1);
        worker.settle(responder, result, notifications, submitted);
    }

    fn reject(self: Box<Self>, error: TwinError) {
        let _ = self.responder.send(Err(error));
    }
}

struct Shared {
    pending: AtomicUsize,
    accepting: AtomicBool,
    abandon: AtomicBool,
}

struct Worker {
    twin: DigitalTwin,
    bus: NotificationBus,
    metrics: Metrics,
    runtime: Handle,
    completions: mpsc::WeakUnboundedSender<WorkItem>,
    shared: Arc<Shared>,
    /// Deferred commands whose completion has not come back yet.
    in_flight: usize,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
        info!(worker = WORKER_NAME, "gateway worker started");
        let mut acks = Vec::new();
        let mut stopping = false;
        loop {
            // Once stopping, only block while deferred work is still out.
            // Abandon does not wait for it.
            let idle = stopping && (self.in_flight == 0 || self.shared.abandon.load(Ordering::Acquire));
            let item = if idle {
                match rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => break,
                }
            } else {
                match rx.blocking_recv() {
                    Some(item) => item,
                    None => break,
                }
            };
            match item {
                WorkItem::Shutdown { mode, done } => {
                    acks.push(done);
                    stopping = true;
                    if mode == ShutdownMode::Abandon {
                        self.shared.abandon.store(true, Ordering::Release);
                    }
                    debug!(?mode, in_flight = self.in_flight, "worker stopping");
                }
                item => self.process(item),
            }
        }
        rx.close();
        if self.in_flight > 0 {
            debug!(in_flight = self.in_flight, "deferred commands left unsettled");
        }
        for done in acks {
            let _ = done.send(());
        }
        info!(worker = WORKER_NAME, "gateway worker stopped");
    }

    fn process(&mut self, item: WorkItem) {
        match item {
            WorkItem::Command(job) => {
                let pending = self.shared.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                self.metrics.set_pending(pending);
                if self.shared.abandon.load(Ordering::Acquire) {
                    self.metrics.inc_commands("abandoned");
                    job.reject(TwinError::Closed);
                } else {
                    job.run(self);
                }
            }
            WorkItem::Completion(job) => job.run(self),
            WorkItem::Shutdown { .. } => {}
        }
    }

    /// Resolves the caller, then flushes or discards the notifications.
    fn settle<T>(
        &mut self,
        responder: Responder<T>,
        result: Result<T, TwinError>,
        notifications: NotificationAccumulator,
        submitted: Instant,
    ) {
        let ok = result.is_ok();
        if let Err(e) = &result {
            debug!(error = %e, "command rejected");
        }
        self.metrics.inc_commands(if ok { "ok" } else { "failed" });
        self.metrics.observe_command(submitted.elapsed().as_secs_f64());
        // The caller may have dropped its handle; the command still counts.
        let _ = responder.send(result);

        if ok {
            let flushed = notifications.flush(&self.bus);
            self.metrics.add_notifications("flushed", flushed);
            trace!(flushed, "notifications flushed");
        } else if !notifications.is_empty() {
            self.metrics.add_notifications("discarded", notifications.len());
        }
    }

    /// Drives `future` on the runtime and queues its result back.
    fn defer<T: Send + 'static>(
        &mut self,
        future: CommandFuture<T>,
        responder: Responder<T>,
        notifications: NotificationAccumulator,
        submitted: Instant,
    ) {
        self.in_flight += 1;
        let completions = self.completions.clone();
        self.runtime.spawn(async move {
            let result = AssertUnwindSafe(future).catch_unwind().await.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "deferred command panicked");
                Err(TwinError::Panicked(message))
            });
            let job: Box<dyn Job> = Box::new(CompletionJob { result, responder, notifications, submitted });
            match completions.upgrade() {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(WorkItem::Completion(job))) = tx.send(WorkItem::Completion(job)) {
                        job.reject(TwinError::Closed);
                    }
                }
                None => job.reject(TwinError::Closed),
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to the gateway worker. Cheap to clone.
#[derive(Clone)]
pub struct GatewayThread {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<WorkItem>,
    shared: Arc<Shared>,
    max_pending: usize,
    bus: NotificationBus,
    metrics: Metrics,
    runtime: Handle,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl GatewayThread {
    /// Starts the worker thread. Must be called from inside a tokio runtime,
    /// which then drives deferred command futures.
    pub fn start(config: &GatewayConfig, twin: DigitalTwin, bus: NotificationBus) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("the gateway must be started inside a tokio runtime")?;
        let metrics = Metrics::new().context("registering gateway metrics")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            abandon: AtomicBool::new(false),
        });

        let worker = Worker {
            twin,
            bus: bus.clone(),
            metrics: metrics.clone(),
            runtime: runtime.clone(),
            completions: tx.downgrade(),
            shared: Arc::clone(&shared),
            in_flight: 0,
        };
        let join = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || worker.run(rx))
            .context("spawning gateway worker")?;
        info!(max_pending = config.max_pending, "gateway started");

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                shared,
                max_pending: config.max_pending,
                bus,
                metrics,
                runtime,
                worker: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::start(&GatewayConfig::default(), DigitalTwin::new(), NotificationBus::new())
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.shared.accepting.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inner.shared.pending.load(Ordering::Acquire)
    }

    /// Queues `command` and returns without waiting for it.
    pub fn execute<C: TwinCommand>(&self, command: C) -> CommandHandle<C::Output> {
        let (responder, handle) = CommandHandle::channel();
        let shared = &self.inner.shared;
        if !shared.accepting.load(Ordering::Acquire) {
            let _ = responder.send(Err(TwinError::Closed));
            return handle;
        }

        let pending = shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = self.inner.max_pending;
        if limit > 0 && pending > limit {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(limit, "gateway queue full");
            self.inner.metrics.inc_commands("rejected");
            let _ = responder.send(Err(TwinError::QueueFull { limit }));
            return handle;
        }
        self.inner.metrics.set_pending(pending);

        let job = CommandJob { command, responder, submitted: Instant::now() };
        if let Err(mpsc::error::SendError(item)) = self.inner.tx.send(WorkItem::Command(Box::new(job))) {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            if let WorkItem::Command(job) = item {
                job.reject(TwinError::Closed);
            }
        }
        handle
    }

    /// Runs a closure as a command.
    pub fn run<F, T>(&self, body: F) -> CommandHandle<T>
    where
        F: FnOnce(&mut DigitalTwin) -> CommandResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute(FnCommand::new(body))
    }

    /// Submits the parent now and the continuation once the parent resolved.
    ///
    /// The wait happens on the runtime, not on the worker, so commands
    /// submitted in between run first. A failed parent fails the whole chain
    /// without running the continuation.
    pub fn execute_dependent<P, T>(&self, command: DependentCommand<P, T>) -> CommandHandle<T>
    where
        P: Send + 'static,
        T: Send + 'static,
    {
        let DependentCommand { parent, continuation } = command;
        let parent = match parent {
            Parent::Command(body) => self.run(body),
            Parent::Handle(handle) => handle,
        };
        let (responder, handle) = CommandHandle::channel();
        let gateway = self.clone();
        self.inner.runtime.spawn(async move {
            let result = match parent.await {
                Ok(value) => gateway.run(move |twin| continuation(value, twin)).await,
                Err(e) => Err(e),
            };
            let _ = responder.send(result);
        });
        handle
    }

    /// Stops accepting commands, drains or abandons the queue and waits for
    /// the worker to exit.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let shared = &self.inner.shared;
        if shared.accepting.swap(false, Ordering::AcqRel) {
            if mode == ShutdownMode::Abandon {
                shared.abandon.store(true, Ordering::Release);
            }
            info!(?mode, pending = self.pending(), "gateway shutting down");
            let (done, stopped) = oneshot::channel();
            if self.inner.tx.send(WorkItem::Shutdown { mode, done }).is_ok() {
                let _ = stopped.await;
            }
        }

        let worker = self.inner.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => info!("gateway stopped"),
                Ok(Err(_)) => error!("gateway worker panicked"),
                Err(e) => error!(error = %e, "joining gateway worker failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::bus::NotificationListener;
    use crate::command::ResourceCommand;
    use crate::digital_twin::{DataType, ResourceDecl, ResourcePath, Value};
    use crate::notification::DataNotification;
    use crate::registry::{Model, ModelRegistry};

    fn val() -> ResourcePath {
        ResourcePath::new("P1", "svc", "val")
    }

    async fn gateway_with_p1() -> GatewayThread {
        let gateway = GatewayThread::with_defaults().unwrap();
        gateway
            .run(|twin| {
                twin.create_provider("P1", "P1", Utc::now(), None)?;
                twin.get_or_create_resource(&val(), ResourceDecl::sensor(DataType::Long))?;
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();
        gateway
    }

    /// Blocks the worker until the returned sender fires. Returns once the
    /// worker is actually inside the blocking command.
    fn hold_worker(gateway: &GatewayThread) -> (std_mpsc::Sender<()>, CommandHandle<()>) {
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let (entered_tx, entered_rx) = std_mpsc::channel::<()>();
        let handle = gateway.run(move |_twin| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok(Completion::Done(()))
        });
        entered_rx.recv().unwrap();
        (release_tx, handle)
    }

    fn read(gateway: &GatewayThread, path: ResourcePath) -> CommandHandle<Value> {
        gateway.execute(ResourceCommand::new(path, |scope: &mut crate::command::ResourceScope<'_>| {
            Ok(Completion::Done(scope.value()?.value.clone()))
        }))
    }

    #[tokio::test]
    async fn commands_run_in_submission_order() {
        let gateway = gateway_with_p1().await;
        let t0 = Utc::now();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                gateway.run(move |twin| {
                    twin.set_resource_value(&val(), json!(i), t0)?;
                    Ok(Completion::Done(i))
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(read(&gateway, val()).await.unwrap(), json!(9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn read_then_write_commands_do_not_lose_updates() {
        let gateway = gateway_with_p1().await;
        gateway
            .run(|twin| {
                twin.set_resource_value(&val(), json!(0), Utc::now())?;
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        gateway
                            .run(|twin| {
                                let stored = twin.resource_value(&val()).cloned().unwrap_or_default();
                                let current = stored.value.as_i64().unwrap_or(0);
                                let ts = stored.timestamp.unwrap_or_else(Utc::now) + chrono::Duration::milliseconds(1);
                                twin.set_resource_value(&val(), json!(current + 1), ts)?;
                                Ok(Completion::Done(()))
                            })
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(read(&gateway, val()).await.unwrap(), json!(200));
    }

    #[tokio::test]
    async fn failed_command_emits_nothing() {
        let gateway = gateway_with_p1().await;
        let (listener, mut rx) = crate::bus::ChannelListener::channel();
        gateway.bus().add_listener(["*"], listener);

        let err = gateway
            .run(|twin| -> CommandResult<()> {
                twin.set_resource_value(&val(), json!(1), Utc::now())?;
                Err(anyhow::anyhow!("changed my mind").into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TwinError::Command(_)));

        gateway
            .run(|twin| {
                twin.create_provider("P2", "P2", Utc::now(), None)?;
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();
        // Barrier: the flush above happened before this command ran.
        gateway.run(|_| Ok(Completion::Done(()))).await.unwrap();

        let mut topics = Vec::new();
        while let Ok(n) = rx.try_recv() {
            topics.push(n.topic());
        }
        assert_eq!(topics[0], "LIFECYCLE/P2");
        assert!(topics.iter().all(|t| !t.contains("P1")));
    }

    #[tokio::test]
    async fn panicking_command_does_not_stop_the_worker() {
        let gateway = gateway_with_p1().await;
        let err = gateway.run(|_| -> CommandResult<()> { panic!("boom") }).await.unwrap_err();
        assert!(matches!(err, TwinError::Panicked(msg) if msg == "boom"));
        assert!(read(&gateway, val()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_resource_rejects_before_body() {
        let gateway = gateway_with_p1().await;
        let err = read(&gateway, ResourcePath::new("P1", "svc", "nope")).await.unwrap_err();
        assert!(matches!(err, TwinError::ResourceNotFound { .. }));
    }

    struct ResolvedBeforeFlush {
        handle: Mutex<Option<CommandHandle<bool>>>,
        data_seen: AtomicUsize,
        resolved_first: mpsc::UnboundedSender<bool>,
    }

    impl NotificationListener for ResolvedBeforeFlush {
        fn on_data(&self, _n: &DataNotification) {
            self.data_seen.fetch_add(1, Ordering::SeqCst);
            let mut slot = self.handle.lock().unwrap();
            let resolved = slot.as_mut().and_then(CommandHandle::try_result).is_some();
            let _ = self.resolved_first.send(resolved);
        }
    }

    #[tokio::test]
    async fn notifications_flush_after_the_caller_is_resolved() {
        let gateway = gateway_with_p1().await;
        let t0 = Utc::now();
        gateway
            .run(move |twin| {
                twin.set_resource_value(&val(), json!(1), t0)?;
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();

        let (resolved_tx, mut resolved_rx) = mpsc::unbounded_channel();
        let listener = Arc::new(ResolvedBeforeFlush {
            handle: Mutex::new(None),
            data_seen: AtomicUsize::new(0),
            resolved_first: resolved_tx,
        });
        gateway.bus().add_listener(["P1/*"], listener.clone());

        let (release, held) = hold_worker(&gateway);
        let set = gateway.run(move |twin| {
            let accepted = twin.set_resource_value(&val(), json!(2), t0 + chrono::Duration::seconds(1))?;
            Ok(Completion::Done(accepted))
        });
        *listener.handle.lock().unwrap() = Some(set);
        release.send(()).unwrap();
        held.await.unwrap();

        assert!(resolved_rx.recv().await.unwrap());
        gateway.run(|_| Ok(Completion::Done(()))).await.unwrap();
        assert_eq!(listener.data_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_parent_does_not_hold_the_worker() {
        let gateway = gateway_with_p1().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let parent_order = Arc::clone(&order);
        let parent = FnCommand::new(move |_twin: &mut DigitalTwin| {
            Ok(Completion::deferred(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                parent_order.lock().unwrap().push("parent");
                Ok::<_, TwinError>(7)
            }))
        });
        let cont_order = Arc::clone(&order);
        let chained = gateway.execute_dependent(DependentCommand::new(parent, move |n: i32, _twin: &mut DigitalTwin| {
            cont_order.lock().unwrap().push("continuation");
            Ok(Completion::Done(n * 2))
        }));

        let other_order = Arc::clone(&order);
        gateway
            .run(move |_| {
                other_order.lock().unwrap().push("unrelated");
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();

        assert_eq!(chained.await.unwrap(), 14);
        assert_eq!(*order.lock().unwrap(), ["unrelated", "parent", "continuation"]);
    }

    #[tokio::test]
    async fn failed_parent_skips_the_continuation() {
        let gateway = gateway_with_p1().await;
        let parent = read(&gateway, ResourcePath::new("P1", "svc", "nope"));
        let chained = gateway.execute_dependent(DependentCommand::<Value, ()>::after(
            parent,
            |_v: Value, _twin: &mut DigitalTwin| panic!("continuation must not run"),
        ));
        let err = chained.await.unwrap_err();
        assert!(matches!(err, TwinError::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn queue_bound_rejects_with_queue_full() {
        let config = GatewayConfig { max_pending: 1, ..GatewayConfig::default() };
        let gateway = GatewayThread::start(&config, DigitalTwin::new(), NotificationBus::new()).unwrap();
        let (release, held) = hold_worker(&gateway);

        let first = gateway.run(|_| Ok(Completion::Done(1)));
        let second = gateway.run(|_| Ok(Completion::Done(2)));
        release.send(()).unwrap();

        held.await.unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert!(matches!(second.await, Err(TwinError::QueueFull { limit: 1 })));
    }

    #[tokio::test]
    async fn abandon_rejects_queued_commands() {
        let gateway = gateway_with_p1().await;
        let (release, held) = hold_worker(&gateway);
        let queued = gateway.run(|_| Ok(Completion::Done(())));

        let stopping = gateway.clone();
        let shutdown = tokio::spawn(async move { stopping.shutdown(ShutdownMode::Abandon).await });
        while gateway.is_accepting() {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        held.await.unwrap();
        assert!(matches!(queued.await, Err(TwinError::Closed)));
        shutdown.await.unwrap();
        assert!(matches!(gateway.run(|_| Ok(Completion::Done(()))).await, Err(TwinError::Closed)));
    }

    #[tokio::test]
    async fn drain_runs_queued_commands() {
        let gateway = gateway_with_p1().await;
        let (release, held) = hold_worker(&gateway);
        let queued = gateway.run(|_| Ok(Completion::Done(5)));

        let stopping = gateway.clone();
        let shutdown = tokio::spawn(async move { stopping.shutdown(ShutdownMode::Drain).await });
        while gateway.is_accepting() {
            tokio::task::yield_now().await;
        }
        release.send(()).unwrap();

        held.await.unwrap();
        assert_eq!(queued.await.unwrap(), 5);
        shutdown.await.unwrap();
    }

    #[tokio::test]
    async fn drain_waits_for_deferred_commands() {
        let gateway = gateway_with_p1().await;
        let (listener, mut rx) = crate::bus::ChannelListener::channel();
        gateway.bus().add_listener(["P1/svc/val"], listener);

        let deferred = gateway.run(|twin| {
            twin.set_resource_value(&val(), json!(42), Utc::now())?;
            Ok(Completion::deferred(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, TwinError>(42)
            }))
        });
        // The body has run; only the future is outstanding.
        gateway.run(|_| Ok(Completion::Done(()))).await.unwrap();
        gateway.shutdown(ShutdownMode::Drain).await;

        assert_eq!(deferred.await.unwrap(), 42);
        let mut data = 0;
        while let Ok(n) = rx.try_recv() {
            if n.kind() == "DATA" {
                data += 1;
            }
        }
        assert_eq!(data, 1);
    }

    #[tokio::test]
    async fn handle_yields_closed_once_result_was_taken() {
        let gateway = gateway_with_p1().await;
        let mut handle = gateway.run(|_| Ok(Completion::Done(true)));
        // Barrier: the command above has settled.
        gateway.run(|_| Ok(Completion::Done(()))).await.unwrap();

        assert!(matches!(handle.try_result(), Some(Ok(true))));
        assert!(handle.try_result().is_none());
        assert!(matches!(handle.await, Err(TwinError::Closed)));
    }

    #[tokio::test]
    async fn actions_run_off_the_worker() {
        let mut models = ModelRegistry::new();
        models
            .register(Model::new("lamp").with_action(
                "light",
                "toggle",
                vec![("on".to_string(), DataType::Boolean)],
                DataType::Boolean,
                |args: Vec<Value>| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, anyhow::Error>(args[0].clone())
                },
            ))
            .unwrap();
        let gateway =
            GatewayThread::start(&GatewayConfig::default(), DigitalTwin::with_models(models), NotificationBus::new())
                .unwrap();
        let (listener, mut rx) = crate::bus::ChannelListener::channel();
        gateway.bus().add_listener(["L1/light/toggle"], listener);

        gateway
            .run(|twin| {
                twin.create_provider("lamp", "L1", Utc::now(), None)?;
                Ok(Completion::Done(()))
            })
            .await
            .unwrap();
        let toggled = gateway.run(|twin| {
            let path = ResourcePath::new("L1", "light", "toggle");
            Ok(Completion::Deferred(twin.invoke_action(&path, vec![json!("true")])?))
        });
        // The worker is free while the action sleeps.
        gateway.run(|_| Ok(Completion::Done(()))).await.unwrap();
        assert_eq!(toggled.await.unwrap(), json!(true));

        let mut kinds = Vec::new();
        while let Ok(n) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            match n {
                Some(n) => kinds.push(n.kind()),
                None => break,
            }
        }
        assert_eq!(kinds.iter().filter(|k| **k == "ACTION").count(), 1);
    }
}
