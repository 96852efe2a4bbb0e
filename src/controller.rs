//! Upload controller: the composition root exposed to the presentation
//! layer.
//!
//! One dispatch task per controller owns the [`WorkerConnection`], the
//! [`StatusReconciler`] and the [`ProgressAggregator`]. Caller commands and
//! worker signals arrive on two bounded queues consumed only by that task,
//! so recomputation never runs concurrently with itself. Observers receive
//! owned [`StatusUpdate`] values, never references into live state.

use crate::config::{Config, Endpoint};
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::status::{OperationalState, ReconcilerSnapshot, StatusReconciler, ToggleAction};
use crate::worker::channel::{
    link_signal_channel, CallbackEvent, LinkSignal, LinkSignalReceiver, LinkSignalSender,
};
use crate::worker::connection::{ConnectionState, ControlOp, Delivery, WorkerConnection};
use crate::worker::protocol::{Capabilities, WorkerRequest};
use crate::worker::transport::WorkerTransport;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Everything the presentation layer needs to render one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub state: OperationalState,
    pub progress: ProgressSnapshot,
    pub status_text: String,
    pub stats_text: String,
    pub connection: ConnectionState,
    /// False when no valid endpoint is configured; nothing connects then
    pub configured: bool,
    /// Pause/resume affordance usable (not finished)
    pub control_enabled: bool,
    /// The worker reported its uploading flag this session
    pub status_known: bool,
    pub toggle: ToggleAction,
    pub reconciler: ReconcilerSnapshot,
}

impl StatusUpdate {
    fn initial(configured: bool) -> Self {
        let reconciler = StatusReconciler::new();
        Self {
            state: reconciler.state(),
            progress: ProgressSnapshot::default(),
            status_text: String::new(),
            stats_text: String::new(),
            connection: ConnectionState::Disconnected,
            configured,
            control_enabled: reconciler.control_enabled(),
            status_known: reconciler.status_known(),
            toggle: reconciler.toggle_action(),
            reconciler: reconciler.snapshot(),
        }
    }

    /// Whether controls should be offered (connected with a registration)
    pub fn is_available(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

/// Receives every recomputed [`StatusUpdate`].
///
/// Called on the dispatch task; implementations must not block.
pub trait StatusObserver: Send + 'static {
    fn on_status(&self, update: &StatusUpdate);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusUpdate) + Send + 'static,
{
    fn on_status(&self, update: &StatusUpdate) {
        self(update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Command {
    Start,
    Stop,
    Control(ControlOp),
    Toggle,
    UploadAll,
    Share(Vec<String>),
    Subscribe(SubscriptionId, Box<dyn StatusObserver>),
    Unsubscribe(SubscriptionId),
    Settled(oneshot::Sender<StatusUpdate>),
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("Start"),
            Command::Stop => f.write_str("Stop"),
            Command::Control(op) => write!(f, "Control({:?})", op),
            Command::Toggle => f.write_str("Toggle"),
            Command::UploadAll => f.write_str("UploadAll"),
            Command::Share(paths) => write!(f, "Share({} paths)", paths.len()),
            Command::Subscribe(id, _) => write!(f, "Subscribe({:?})", id),
            Command::Unsubscribe(id) => write!(f, "Unsubscribe({:?})", id),
            Command::Settled(_) => f.write_str("Settled"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Handle to one controller session.
///
/// Control methods are non-blocking: they enqueue and return, and are
/// dropped when the queue is full. Calls made while the worker is
/// unreachable are dropped, not queued for later. Lifecycle and
/// subscription methods wait for queue space instead.
/// Dropping the handle tears the session down.
pub struct UploadController {
    commands: mpsc::Sender<Command>,
    updates: watch::Receiver<StatusUpdate>,
    next_subscription: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl UploadController {
    /// Spawn the dispatch task. Must be called inside a tokio runtime.
    pub fn new(config: &Config, transport: Arc<dyn WorkerTransport>) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (signal_tx, signal_rx) = link_signal_channel(capacity);
        let (update_tx, update_rx) = watch::channel(StatusUpdate::initial(config.is_configured()));

        let dispatcher = Dispatcher {
            connection: WorkerConnection::new(
                transport,
                signal_tx.clone(),
                config.call_timeout(),
                config.bind_timeout(),
            ),
            reconciler: StatusReconciler::new(),
            progress: ProgressAggregator::new(),
            status_text: String::new(),
            stats_text: String::new(),
            endpoint: config.endpoint.clone(),
            configured: config.is_configured(),
            active: false,
            reconnect_delay: config.reconnect_delay(),
            observers: Vec::new(),
            updates: update_tx,
            signals: signal_tx,
        };
        let task = tokio::spawn(dispatcher.run(command_rx, signal_rx));

        Self {
            commands: command_tx,
            updates: update_rx,
            next_subscription: AtomicU64::new(1),
            task: Some(task),
        }
    }

    fn send(&self, command: Command) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                tracing::warn!("Controller queue full, dropping {:?}", command);
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                tracing::debug!("Controller stopped, dropping {:?}", command);
            }
        }
    }

    /// Enqueue a lifecycle command, waiting for queue space.
    async fn send_lifecycle(&self, command: Command) -> bool {
        match self.commands.send(command).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                tracing::debug!("Controller stopped, dropping {:?}", command);
                false
            }
        }
    }

    /// Enter the active scope: connect if an endpoint is configured.
    pub async fn start(&self) {
        self.send_lifecycle(Command::Start).await;
    }

    /// Leave the active scope: unregister and disconnect.
    pub async fn stop(&self) {
        self.send_lifecycle(Command::Stop).await;
    }

    pub fn pause(&self) {
        self.send(Command::Control(ControlOp::Pause));
    }

    pub fn resume(&self) {
        self.send(Command::Control(ControlOp::Resume));
    }

    pub fn stop_everything(&self) {
        self.send(Command::Control(ControlOp::Stop));
    }

    /// Pause when working, resume when paused or idle, nothing when
    /// finished.
    pub fn toggle(&self) {
        self.send(Command::Toggle);
    }

    /// Ask the worker to enqueue all eligible local content. The outcome is
    /// only visible through later status updates.
    pub fn trigger_upload_all(&self) {
        self.send(Command::UploadAll);
    }

    /// Hand externally shared content to the worker for upload.
    pub fn share<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let paths: Vec<String> = paths
            .into_iter()
            .map(|p| p.as_ref().to_string_lossy().into_owned())
            .collect();
        self.send(Command::Share(paths));
    }

    /// Register an observer. It receives the current update first, then
    /// every later one. `None` when the controller has already stopped.
    pub async fn subscribe<O: StatusObserver>(&self, observer: O) -> Option<SubscriptionId> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.send_lifecycle(Command::Subscribe(id, Box::new(observer)))
            .await
            .then_some(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.send_lifecycle(Command::Unsubscribe(id)).await;
    }

    /// Latest published update
    pub fn current(&self) -> StatusUpdate {
        self.updates.borrow().clone()
    }

    /// Receiver that always holds the latest update
    pub fn watch(&self) -> watch::Receiver<StatusUpdate> {
        self.updates.clone()
    }

    /// Latest update after every command issued so far was processed.
    /// `None` once the controller has shut down.
    pub async fn settled(&self) -> Option<StatusUpdate> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Settled(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Tear down the session and wait for the dispatch task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Controller task ended abnormally: {}", e);
            }
        }
    }
}

struct Dispatcher {
    connection: WorkerConnection,
    reconciler: StatusReconciler,
    progress: ProgressAggregator,
    status_text: String,
    stats_text: String,
    endpoint: Option<String>,
    configured: bool,
    /// Between start() and stop()
    active: bool,
    reconnect_delay: Option<Duration>,
    observers: Vec<(SubscriptionId, Box<dyn StatusObserver>)>,
    updates: watch::Sender<StatusUpdate>,
    signals: LinkSignalSender,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: LinkSignalReceiver,
    ) {
        loop {
            // Commands first: a queued stop must beat a bind completion
            // that raced it.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
            }
        }

        // Nothing reaches observers once teardown begins
        self.observers.clear();
        self.connection.disconnect().await;
        tracing::debug!("Controller dispatch loop finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => {
                self.active = false;
                self.connection.disconnect().await;
                self.reset_session();
                self.publish();
            }
            Command::Control(op) => self.forward(op.into()).await,
            Command::Toggle => match self.reconciler.toggle_action() {
                ToggleAction::Pause => self.forward(ControlOp::Pause.into()).await,
                ToggleAction::Resume => self.forward(ControlOp::Resume.into()).await,
                ToggleAction::Disabled => {
                    tracing::debug!("Toggle ignored in state {:?}", self.reconciler.state())
                }
            },
            Command::UploadAll => {
                tracing::info!("Requesting upload of all local content");
                self.forward(WorkerRequest::UploadAll).await;
            }
            Command::Share(paths) => self.share(paths).await,
            Command::Subscribe(id, observer) => {
                observer.on_status(&self.updates.borrow());
                self.observers.push((id, observer));
            }
            Command::Unsubscribe(id) => self.observers.retain(|(sub, _)| *sub != id),
            Command::Settled(reply) => {
                let _ = reply.send(self.updates.borrow().clone());
            }
            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    fn start(&mut self) {
        if self.connection.state() != ConnectionState::Disconnected {
            tracing::debug!("start() ignored: already {:?}", self.connection.state());
            return;
        }
        self.active = true;
        self.configured = self
            .endpoint
            .as_deref()
            .map(Endpoint::is_valid)
            .unwrap_or(false);

        self.reset_session();
        if self.configured {
            self.connection.connect();
        } else {
            tracing::warn!("Upload endpoint not configured; not connecting to worker");
        }
        self.publish();
    }

    async fn share(&mut self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        if self.connection.is_available()
            && !self.connection.capabilities().contains(Capabilities::SHARE)
        {
            tracing::info!(
                "Worker does not accept shared content, dropping {} path(s)",
                paths.len()
            );
            return;
        }
        tracing::info!("Sharing {} path(s) with worker", paths.len());
        self.forward(WorkerRequest::Share(paths)).await;
    }

    async fn forward(&mut self, request: WorkerRequest) {
        if self.connection.request(request).await == Delivery::LinkFailed {
            self.session_lost();
        }
    }

    /// The live session ended without a stop: forget it, tell observers,
    /// and maybe come back.
    fn session_lost(&mut self) {
        self.reset_session();
        self.publish();
        self.schedule_reconnect();
    }

    async fn handle_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::Bound { generation, result } => {
                self.connection.on_bound(generation, result).await;
                self.publish();
            }
            LinkSignal::Event {
                registration,
                event,
            } => {
                if !self.connection.accepts(registration) {
                    tracing::trace!("Discarding event from stale {}: {:?}", registration, event);
                    return;
                }
                let before = self.reconciler.state();
                let affects_state = event.affects_state();
                if self.apply(event) {
                    if affects_state && self.reconciler.state() != before {
                        tracing::debug!(
                            "Operational state {:?} -> {:?}",
                            before,
                            self.reconciler.state()
                        );
                    }
                    self.publish();
                }
            }
            LinkSignal::Lost {
                registration,
                reason,
            } => {
                if self.connection.on_disconnected(registration, &reason).await {
                    self.session_lost();
                }
            }
            LinkSignal::Reconnect { generation } => {
                if self.active
                    && generation == self.connection.generation()
                    && self.connection.state() == ConnectionState::Disconnected
                {
                    tracing::info!("Reconnecting to worker");
                    self.connection.connect();
                    self.publish();
                }
            }
        }
    }

    /// Apply one worker event. Returns whether observers need an update.
    fn apply(&mut self, event: CallbackEvent) -> bool {
        match event {
            CallbackEvent::SetUploading(uploading) => {
                self.reconciler.set_uploading(uploading);
            }
            CallbackEvent::SetFileStatus {
                done,
                in_flight,
                total,
            } => {
                self.reconciler.set_file_status(done, in_flight, total);
                self.progress.set_file_status(done, in_flight, total);
            }
            CallbackEvent::SetByteStatus {
                done,
                in_flight,
                total,
            } => {
                self.progress.set_byte_status(done, in_flight, total);
            }
            CallbackEvent::SetDigestRemaining(remaining) => {
                if !self
                    .connection
                    .capabilities()
                    .contains(Capabilities::DIGEST_STATUS)
                {
                    tracing::debug!(
                        "Ignoring digest status from a worker that did not advertise it"
                    );
                    return false;
                }
                self.reconciler.set_digest_remaining(remaining);
            }
            CallbackEvent::SetStatusText(text) => self.status_text = text,
            CallbackEvent::SetStatsText(text) => self.stats_text = text,
            CallbackEvent::Log(line) => {
                tracing::info!(target: "upctl::worker", "{}", line);
                return false;
            }
        }
        true
    }

    fn schedule_reconnect(&self) {
        let Some(delay) = self.reconnect_delay else {
            return;
        };
        if !self.active {
            return;
        }
        let generation = self.connection.generation();
        let signals = self.signals.clone();
        tracing::debug!("Reconnecting in {:?}", delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(LinkSignal::Reconnect { generation }).await;
        });
    }

    /// Forget the previous worker session's progress and status lines.
    fn reset_session(&mut self) {
        self.reconciler.reset();
        self.progress.reset();
        self.status_text.clear();
        self.stats_text.clear();
    }

    fn snapshot(&self) -> StatusUpdate {
        StatusUpdate {
            state: self.reconciler.state(),
            progress: self.progress.snapshot(),
            status_text: self.status_text.clone(),
            stats_text: self.stats_text.clone(),
            connection: self.connection.state(),
            configured: self.configured,
            control_enabled: self.reconciler.control_enabled(),
            status_known: self.reconciler.status_known(),
            toggle: self.reconciler.toggle_action(),
            reconciler: self.reconciler.snapshot(),
        }
    }

    fn publish(&mut self) {
        let update = self.snapshot();
        for (_, observer) in &self.observers {
            observer.on_status(&update);
        }
        self.updates.send_replace(update);
    }
}
