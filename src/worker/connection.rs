//! Connection lifecycle to the upload worker.
//!
//! Owned exclusively by the controller's dispatch loop. `connect()` only
//! starts a bind; the result comes back on the link-signal queue as
//! [`LinkSignal::Bound`] and is fed to [`WorkerConnection::on_bound`].
//! Every connect attempt gets a new generation, and a bind or event from an
//! older generation is discarded.

use crate::error::{Error, Result};
use crate::worker::channel::{
    CallbackRegistration, CallbackSink, LinkSignal, LinkSignalSender, RegistrationId,
};
use crate::worker::protocol::{Capabilities, WorkerRequest};
use crate::worker::transport::{WorkerLink, WorkerTransport};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Control operations forwarded to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Pause,
    Resume,
    Stop,
}

impl From<ControlOp> for WorkerRequest {
    fn from(op: ControlOp) -> Self {
        match op {
            ControlOp::Pause => WorkerRequest::Pause,
            ControlOp::Resume => WorkerRequest::Resume,
            ControlOp::Stop => WorkerRequest::StopEverything,
        }
    }
}

/// Outcome of an outgoing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the worker
    Sent,
    /// Not connected, or refused locally; nothing was written
    Dropped,
    /// The write failed or timed out part-way through a frame. The link was
    /// torn down and the session is gone.
    LinkFailed,
}

async fn with_timeout<F>(limit: Duration, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(limit)),
    }
}

pub struct WorkerConnection {
    transport: Arc<dyn WorkerTransport>,
    signals: LinkSignalSender,
    state: ConnectionState,
    generation: u64,
    link: Option<Box<dyn WorkerLink>>,
    registration: Option<CallbackRegistration>,
    pending_bind: Option<JoinHandle<()>>,
    call_timeout: Duration,
    bind_timeout: Duration,
}

impl WorkerConnection {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        signals: LinkSignalSender,
        call_timeout: Duration,
        bind_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            signals,
            state: ConnectionState::Disconnected,
            generation: 0,
            link: None,
            registration: None,
            pending_bind: None,
            call_timeout,
            bind_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn registration(&self) -> Option<CallbackRegistration> {
        self.registration
    }

    /// Connected with a live registration. Gates UI affordances only;
    /// control calls are safe regardless.
    pub fn is_available(&self) -> bool {
        self.state == ConnectionState::Connected && self.registration.is_some()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.link
            .as_ref()
            .map(|link| link.capabilities())
            .unwrap_or_default()
    }

    /// Whether an event tagged with `registration` belongs to the live
    /// session.
    pub fn accepts(&self, registration: RegistrationId) -> bool {
        self.is_available() && self.registration.map(|r| r.id()) == Some(registration)
    }

    /// Start binding to the worker. Completion arrives later as
    /// [`LinkSignal::Bound`]; a no-op unless currently disconnected.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            tracing::debug!("connect() ignored: already {:?}", self.state);
            return;
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;

        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let signals = self.signals.clone();
        let bind_timeout = self.bind_timeout;
        tracing::debug!("Binding to {} (generation {})", transport.describe(), generation);

        self.pending_bind = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(bind_timeout, transport.bind()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(bind_timeout)),
            };
            // A closed queue means the controller is gone; the link drops here.
            let _ = signals.send(LinkSignal::Bound { generation, result }).await;
        }));
    }

    /// Feed a bind completion. Returns true when the connection became
    /// usable.
    pub async fn on_bound(
        &mut self,
        generation: u64,
        result: Result<Box<dyn WorkerLink>>,
    ) -> bool {
        match result {
            Ok(link) => self.on_connected(generation, link).await,
            Err(e) => {
                if self.is_current_attempt(generation) {
                    tracing::warn!("Failed to reach {}: {}", self.transport.describe(), e);
                    self.pending_bind = None;
                    self.state = ConnectionState::Disconnected;
                } else {
                    tracing::debug!("Ignoring failed stale bind (generation {}): {}", generation, e);
                }
                false
            }
        }
    }

    /// Register our callback on a freshly bound link. If registration
    /// fails the link is dropped and the connection stays disconnected.
    pub async fn on_connected(&mut self, generation: u64, mut link: Box<dyn WorkerLink>) -> bool {
        if !self.is_current_attempt(generation) {
            tracing::debug!("Discarding stale bind (generation {})", generation);
            link.close().await;
            return false;
        }
        self.pending_bind = None;

        let registration = CallbackRegistration::new(RegistrationId(generation));
        let sink = CallbackSink::new(registration.id(), self.signals.clone());

        if let Err(e) = with_timeout(self.call_timeout, link.register_callback(sink)).await {
            tracing::warn!("Callback registration failed: {}", e);
            link.close().await;
            self.state = ConnectionState::Disconnected;
            return false;
        }

        tracing::info!(
            "Connected to {} ({})",
            self.transport.describe(),
            registration.id()
        );
        self.link = Some(link);
        self.registration = Some(registration);
        self.state = ConnectionState::Connected;
        true
    }

    /// The event stream for `registration` ended (worker restart or
    /// crash). Returns true when that was the live session.
    pub async fn on_disconnected(&mut self, registration: RegistrationId, reason: &str) -> bool {
        if self.registration.map(|r| r.id()) != Some(registration) {
            tracing::debug!("Ignoring loss of stale {}: {}", registration, reason);
            return false;
        }

        tracing::warn!("Worker connection lost ({}): {}", registration, reason);
        self.drop_link().await;
        true
    }

    /// Close the link without unregistering; the stream can't be trusted.
    async fn drop_link(&mut self) {
        self.registration = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Best-effort unregister, then unconditional teardown. Idempotent;
    /// also cancels a bind still in flight.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.pending_bind.take() {
            task.abort();
        }
        // Any Bound or Reconnect already queued is now stale
        self.generation += 1;

        if let Some(mut link) = self.link.take() {
            if self.registration.is_some() {
                if let Err(e) = with_timeout(self.call_timeout, link.unregister_callback()).await {
                    tracing::debug!("Unregister failed (ignored): {}", e);
                }
            }
            link.close().await;
        }
        self.registration = None;

        if self.state != ConnectionState::Disconnected {
            tracing::info!("Disconnected from {}", self.transport.describe());
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Forward a control operation; dropped when not connected.
    pub async fn control(&mut self, op: ControlOp) -> Delivery {
        self.request(op.into()).await
    }

    /// Send a request to the worker. Failures are logged, never propagated.
    /// A transport failure leaves a partial frame on the stream, so the link
    /// is dropped and the connection goes back to `Disconnected`.
    pub async fn request(&mut self, request: WorkerRequest) -> Delivery {
        if self.state != ConnectionState::Connected {
            tracing::debug!("Dropping {:?}: worker not connected", request);
            return Delivery::Dropped;
        }
        let Some(link) = self.link.as_mut() else {
            return Delivery::Dropped;
        };

        let name = request.message_type();
        match with_timeout(self.call_timeout, link.request(request)).await {
            Ok(()) => Delivery::Sent,
            Err(e) if e.is_transport() => {
                tracing::warn!("Worker call {:?} failed, dropping link: {}", name, e);
                self.drop_link().await;
                Delivery::LinkFailed
            }
            Err(e) => {
                tracing::warn!("Worker call {:?} failed: {}", name, e);
                Delivery::Dropped
            }
        }
    }

    fn is_current_attempt(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connecting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::channel::{link_signal_channel, LinkSignalReceiver};
    use crate::worker::protocol::{read_frame, write_frame, Hello};
    use crate::worker::testing::{MockBehavior, MockTransport};
    use crate::worker::transport::StreamLink;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn setup(behavior: MockBehavior) -> (WorkerConnection, LinkSignalReceiver, Arc<MockTransport>) {
        let transport = MockTransport::new(behavior);
        let (tx, rx) = link_signal_channel(16);
        let conn = WorkerConnection::new(transport.clone(), tx, TIMEOUT, TIMEOUT);
        (conn, rx, transport)
    }

    async fn complete_bind(conn: &mut WorkerConnection, rx: &mut LinkSignalReceiver) -> bool {
        match rx.recv().await.unwrap() {
            LinkSignal::Bound { generation, result } => conn.on_bound(generation, result).await,
            other => panic!("Expected Bound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_and_register() {
        let (mut conn, mut rx, transport) = setup(MockBehavior::default());
        assert!(!conn.is_available());

        conn.connect();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(complete_bind(&mut conn, &mut rx).await);

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.is_available());
        let registration = conn.registration().unwrap().id();
        assert!(conn.accepts(registration));
        assert!(!conn.accepts(RegistrationId(registration.0 + 1)));
        assert_eq!(transport.log.calls(), vec!["bind", "register reg#1"]);
    }

    #[tokio::test]
    async fn test_bind_failure_stays_disconnected() {
        let (mut conn, mut rx, _transport) = setup(MockBehavior {
            fail_bind: true,
            ..Default::default()
        });

        conn.connect();
        assert!(!complete_bind(&mut conn, &mut rx).await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_available());
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_usable() {
        let (mut conn, mut rx, transport) = setup(MockBehavior {
            fail_register: true,
            ..Default::default()
        });

        conn.connect();
        assert!(!complete_bind(&mut conn, &mut rx).await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.registration().is_none());
        assert_eq!(
            transport.log.calls(),
            vec!["bind", "register reg#1", "close"]
        );

        // Outgoing calls are ignored until a registration succeeds
        assert_eq!(conn.control(ControlOp::Pause).await, Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_control_when_disconnected_is_dropped() {
        let (mut conn, _rx, transport) = setup(MockBehavior::default());
        assert_eq!(conn.control(ControlOp::Pause).await, Delivery::Dropped);
        assert_eq!(
            conn.request(WorkerRequest::UploadAll).await,
            Delivery::Dropped
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(transport.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_control_forwarded_when_connected() {
        let (mut conn, mut rx, transport) = setup(MockBehavior::default());
        conn.connect();
        complete_bind(&mut conn, &mut rx).await;
        transport.log.clear();

        assert_eq!(conn.control(ControlOp::Pause).await, Delivery::Sent);
        assert_eq!(conn.control(ControlOp::Stop).await, Delivery::Sent);
        assert_eq!(transport.log.calls(), vec!["Pause", "StopEverything"]);
    }

    #[tokio::test]
    async fn test_remote_failure_drops_the_link() {
        let (mut conn, mut rx, transport) = setup(MockBehavior {
            fail_requests: true,
            ..Default::default()
        });
        conn.connect();
        complete_bind(&mut conn, &mut rx).await;
        let live = conn.registration().unwrap().id();
        transport.log.clear();

        assert_eq!(conn.control(ControlOp::Resume).await, Delivery::LinkFailed);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.accepts(live));
        // No unregister on a broken stream
        assert_eq!(transport.log.calls(), vec!["Resume", "close"]);

        // The pump's own loss report for that session is now stale
        assert!(!conn.on_disconnected(live, "eof").await);
    }

    /// Worker that answers the handshake and then never reads again
    #[derive(Default)]
    struct StalledTransport {
        held: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl WorkerTransport for StalledTransport {
        async fn bind(&self) -> Result<Box<dyn WorkerLink>> {
            let (ctl_read, mut worker_write) = tokio::io::duplex(64);
            let (mut worker_read, ctl_write) = tokio::io::duplex(64);
            let worker = tokio::spawn(async move {
                read_frame(&mut worker_read).await?;
                write_frame(&mut worker_write, &Hello::new(Capabilities::all()).encode()).await?;
                Ok::<_, Error>((worker_read, worker_write))
            });

            let link = StreamLink::handshake(ctl_read, ctl_write).await?;
            let (worker_read, worker_write) = worker
                .await
                .map_err(|e| Error::Transport(e.to_string()))??;
            self.held.lock().unwrap().extend([worker_read, worker_write]);
            Ok(Box::new(link))
        }
    }

    #[tokio::test]
    async fn test_timed_out_write_drops_the_link() {
        let transport = Arc::new(StalledTransport::default());
        let (tx, mut rx) = link_signal_channel(16);
        let mut conn = WorkerConnection::new(transport, tx, Duration::from_millis(100), TIMEOUT);
        conn.connect();
        assert!(complete_bind(&mut conn, &mut rx).await);

        // Far larger than the pipe, so the frame is cut off mid-write
        let share = WorkerRequest::Share(vec!["x".repeat(4000)]);
        assert_eq!(conn.request(share).await, Delivery::LinkFailed);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_available());
        assert!(conn.registration().is_none());

        // Nothing else is written into the half-sent frame
        assert_eq!(conn.control(ControlOp::Pause).await, Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_is_idempotent() {
        let (mut conn, mut rx, transport) = setup(MockBehavior {
            fail_unregister: true,
            ..Default::default()
        });
        conn.connect();
        complete_bind(&mut conn, &mut rx).await;
        transport.log.clear();

        conn.disconnect().await;
        assert_eq!(transport.log.calls(), vec!["unregister", "close"]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_available());

        conn.disconnect().await;
        assert_eq!(transport.log.calls(), vec!["unregister", "close"]);
    }

    #[tokio::test]
    async fn test_disconnect_wins_over_completed_bind() {
        let (mut conn, mut rx, transport) = setup(MockBehavior::default());
        conn.connect();
        let stale_generation = conn.generation();

        // The bind finished and its completion is queued but not yet handled
        let signal = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        conn.disconnect().await;

        let (generation, result) = match signal {
            LinkSignal::Bound { generation, result } => (generation, result),
            other => panic!("Expected Bound, got {:?}", other),
        };
        assert_eq!(generation, stale_generation);
        assert!(!conn.on_bound(generation, result).await);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.registration().is_none());
        assert_eq!(transport.log.calls(), vec!["bind", "close"]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_bind_in_flight() {
        let gate = Arc::new(Notify::new());
        let (mut conn, mut rx, transport) = setup(MockBehavior {
            bind_gate: Some(gate.clone()),
            ..Default::default()
        });
        conn.connect();

        // Wait until the transport is inside bind()
        tokio::time::timeout(TIMEOUT, async {
            while transport.log.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        conn.disconnect().await;
        gate.notify_one();

        let late = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(late.is_err(), "cancelled bind still reported back");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(transport.log.calls(), vec!["bind"]);
    }

    #[tokio::test]
    async fn test_loss_of_live_session() {
        let (mut conn, mut rx, _transport) = setup(MockBehavior::default());
        conn.connect();
        complete_bind(&mut conn, &mut rx).await;
        let live = conn.registration().unwrap().id();

        assert!(!conn.on_disconnected(RegistrationId(99), "stale").await);
        assert!(conn.is_available());

        assert!(conn.on_disconnected(live, "eof").await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.accepts(live));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (mut conn, mut rx, transport) = setup(MockBehavior::default());
        conn.connect();
        complete_bind(&mut conn, &mut rx).await;
        let first = conn.registration().unwrap().id();
        conn.disconnect().await;

        transport.set_behavior(MockBehavior {
            capabilities: Capabilities::SHARE,
            ..Default::default()
        });
        conn.connect();
        assert!(complete_bind(&mut conn, &mut rx).await);

        let second = conn.registration().unwrap().id();
        assert_ne!(first, second);
        assert!(!conn.accepts(first));
        assert!(conn.capabilities().contains(Capabilities::SHARE));
    }
}
