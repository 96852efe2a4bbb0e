//! Transports to the worker process.
//!
//! [`WorkerTransport`] binds, [`WorkerLink`] is one bound connection. The
//! shipped link speaks the framed protocol over any byte stream; two
//! transports produce one: a TCP socket to an already-running worker, or a
//! worker subprocess on stdin/stdout.

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::worker::channel::CallbackSink;
use crate::worker::protocol::{
    decode_inbound, negotiate_version, read_frame, write_frame, Capabilities, Hello, Inbound,
    VersionNegotiationResult, WorkerRequest,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long a spawned worker gets to exit on its own after its stdin closes
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(1);

/// One bound connection to the worker
#[async_trait]
pub trait WorkerLink: Send {
    /// Optional features the worker advertised
    fn capabilities(&self) -> Capabilities;

    /// Start pushing worker events into `sink`. At most once per link.
    async fn register_callback(&mut self, sink: CallbackSink) -> Result<()>;

    /// Stop pushing events. Best-effort; the worker may already be gone.
    async fn unregister_callback(&mut self) -> Result<()>;

    async fn request(&mut self, request: WorkerRequest) -> Result<()>;

    /// Tear down the transport unconditionally.
    async fn close(&mut self);
}

/// Something that can produce a [`WorkerLink`]
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn bind(&self) -> Result<Box<dyn WorkerLink>>;

    fn describe(&self) -> String {
        "worker".to_string()
    }
}

/// Framed-protocol link over a read half and a write half
pub struct StreamLink<R, W> {
    reader: Option<R>,
    writer: W,
    capabilities: Capabilities,
    reader_task: Option<JoinHandle<()>>,
    child: Option<Child>,
}

impl<R, W> StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Exchange Hello frames and check the worker's protocol version.
    pub async fn handshake(mut reader: R, mut writer: W) -> Result<Self> {
        write_frame(&mut writer, &Hello::new(Capabilities::all()).encode()).await?;

        let (msg_type, payload) = read_frame(&mut reader).await?;
        let hello = match decode_inbound(msg_type, payload)? {
            Inbound::Hello(hello) => hello,
            Inbound::Fatal(message) => {
                return Err(Error::Transport(format!(
                    "Worker refused connection: {}",
                    message
                )))
            }
            Inbound::Event(event) => {
                return Err(Error::Protocol(format!(
                    "Expected Hello from worker, got {:?}",
                    event
                )))
            }
        };

        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(version) => {
                tracing::debug!(
                    "Worker handshake ok: protocol v{}, capabilities {:?}",
                    version,
                    hello.capabilities
                );
            }
            VersionNegotiationResult::TooOld {
                peer,
                min_supported,
            } => {
                return Err(Error::Protocol(format!(
                    "Worker protocol v{} is older than minimum v{}",
                    peer, min_supported
                )))
            }
            VersionNegotiationResult::TooNew {
                peer,
                max_supported,
            } => {
                return Err(Error::Protocol(format!(
                    "Worker protocol v{} is newer than maximum v{}",
                    peer, max_supported
                )))
            }
        }

        Ok(Self {
            reader: Some(reader),
            writer,
            capabilities: hello.capabilities,
            reader_task: None,
            child: None,
        })
    }

    /// Tie a spawned worker's lifetime to this link.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    fn stop_reader(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

impl<R, W> Drop for StreamLink<R, W> {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Forward worker frames into `sink` until the stream ends.
async fn pump_events<R: AsyncRead + Unpin>(mut reader: R, sink: CallbackSink) {
    loop {
        let (msg_type, payload) = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                sink.lost(e.to_string()).await;
                return;
            }
        };
        match decode_inbound(msg_type, payload) {
            Ok(Inbound::Event(event)) => {
                if sink.deliver(event).await.is_err() {
                    // Controller is gone
                    return;
                }
            }
            Ok(Inbound::Fatal(message)) => {
                sink.lost(format!("Worker fatal error: {}", message)).await;
                return;
            }
            Ok(Inbound::Hello(_)) => {
                tracing::warn!("Ignoring repeated Hello from worker");
            }
            Err(e) => {
                sink.lost(e.to_string()).await;
                return;
            }
        }
    }
}

#[async_trait]
impl<R, W> WorkerLink for StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn register_callback(&mut self, sink: CallbackSink) -> Result<()> {
        let reader = self.reader.take().ok_or_else(|| {
            Error::Registration("a callback is already registered on this link".to_string())
        })?;

        if let Err(e) = write_frame(&mut self.writer, &WorkerRequest::RegisterCallback.encode()).await
        {
            return Err(Error::Registration(e.to_string()));
        }

        tracing::debug!("Registered callback {}", sink.registration());
        self.reader_task = Some(tokio::spawn(pump_events(reader, sink)));
        Ok(())
    }

    async fn unregister_callback(&mut self) -> Result<()> {
        let result = write_frame(
            &mut self.writer,
            &WorkerRequest::UnregisterCallback.encode(),
        )
        .await;
        self.stop_reader();
        result
    }

    async fn request(&mut self, request: WorkerRequest) -> Result<()> {
        write_frame(&mut self.writer, &request.encode()).await
    }

    async fn close(&mut self) {
        self.stop_reader();
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Worker stream shutdown: {}", e);
        }
        if let Some(child) = self.child.take() {
            tokio::spawn(reap_child(child));
        }
    }
}

/// Give a worker whose stdin closed a moment to exit, then kill it.
async fn reap_child(mut child: Child) {
    match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("Worker process exited: {}", status),
        Ok(Err(e)) => tracing::debug!("Failed to reap worker process: {}", e),
        Err(_) => {
            tracing::debug!("Worker process still running, killing it");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill worker process: {}", e);
            }
        }
    }
}

/// Connects to a worker already listening on a TCP address
#[derive(Debug, Clone)]
pub struct SocketTransport {
    address: String,
}

impl SocketTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl WorkerTransport for SocketTransport {
    async fn bind(&self) -> Result<Box<dyn WorkerLink>> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            Error::Transport(format!("Failed to connect to {}: {}", self.address, e))
        })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let link = StreamLink::handshake(reader, writer).await?;
        Ok(Box::new(link))
    }

    fn describe(&self) -> String {
        format!("worker at {}", self.address)
    }
}

/// Spawns the worker and speaks the protocol on its stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn bind(&self) -> Result<Box<dyn WorkerLink>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!(
                "Failed to spawn worker {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to open worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to open worker stdout".to_string()))?;

        let link = StreamLink::handshake(stdout, stdin).await?;
        Ok(Box::new(link.with_child(child)))
    }

    fn describe(&self) -> String {
        format!("worker process {}", self.program.display())
    }
}

/// Pick the transport described by the `[worker]` config section.
pub fn from_config(worker: &WorkerConfig) -> Result<Arc<dyn WorkerTransport>> {
    if let Some(address) = &worker.address {
        return Ok(Arc::new(SocketTransport::new(address.clone())));
    }
    if let Some(program) = &worker.program {
        return Ok(Arc::new(ProcessTransport::new(
            program.clone(),
            worker.args.clone(),
        )));
    }
    Err(Error::Config(
        "no worker configured: set worker.address or worker.program".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::channel::{link_signal_channel, CallbackEvent, LinkSignal, RegistrationId};
    use crate::worker::protocol::{encode_event, encode_fatal, MessageType};
    use tokio::io::DuplexStream;

    /// Worker side of a duplex pair: answers the handshake, returns its ends.
    async fn fake_worker_handshake(
        capabilities: Capabilities,
    ) -> (StreamLink<DuplexStream, DuplexStream>, DuplexStream, DuplexStream) {
        let (ctl_read, mut worker_write) = tokio::io::duplex(4096);
        let (mut worker_read, ctl_write) = tokio::io::duplex(4096);

        let worker = tokio::spawn(async move {
            let (msg_type, _) = read_frame(&mut worker_read).await.unwrap();
            assert_eq!(msg_type, MessageType::Hello);
            write_frame(&mut worker_write, &Hello::new(capabilities).encode())
                .await
                .unwrap();
            (worker_read, worker_write)
        });

        let link = StreamLink::handshake(ctl_read, ctl_write).await.unwrap();
        let (worker_read, worker_write) = worker.await.unwrap();
        (link, worker_read, worker_write)
    }

    #[tokio::test]
    async fn test_handshake_reports_capabilities() {
        let (link, _r, _w) = fake_worker_handshake(Capabilities::SHARE).await;
        assert!(link.capabilities().contains(Capabilities::SHARE));
        assert!(!link.capabilities().contains(Capabilities::DIGEST_STATUS));
    }

    #[tokio::test]
    async fn test_handshake_rejects_new_version() {
        let (ctl_read, mut worker_write) = tokio::io::duplex(1024);
        let (_worker_read, ctl_write) = tokio::io::duplex(1024);

        let hello = Hello {
            version: 42,
            capabilities: Capabilities::empty(),
        };
        write_frame(&mut worker_write, &hello.encode()).await.unwrap();

        let result = StreamLink::handshake(ctl_read, ctl_write).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_registered_events_are_pumped() {
        let (mut link, mut worker_read, mut worker_write) =
            fake_worker_handshake(Capabilities::empty()).await;
        let (tx, mut rx) = link_signal_channel(8);

        link.register_callback(CallbackSink::new(RegistrationId(5), tx))
            .await
            .unwrap();
        let (msg_type, _) = read_frame(&mut worker_read).await.unwrap();
        assert_eq!(msg_type, MessageType::RegisterCallback);

        write_frame(&mut worker_write, &encode_event(&CallbackEvent::SetUploading(true)))
            .await
            .unwrap();
        write_frame(&mut worker_write, &encode_fatal("shutting down"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            LinkSignal::Event {
                registration,
                event,
            } => {
                assert_eq!(registration, RegistrationId(5));
                assert_eq!(event, CallbackEvent::SetUploading(true));
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            LinkSignal::Lost { registration: RegistrationId(5), .. }
        ));
    }

    #[tokio::test]
    async fn test_double_registration_fails() {
        let (mut link, _r, _w) = fake_worker_handshake(Capabilities::empty()).await;
        let (tx, _rx) = link_signal_channel(8);

        link.register_callback(CallbackSink::new(RegistrationId(1), tx.clone()))
            .await
            .unwrap();
        let err = link
            .register_callback(CallbackSink::new(RegistrationId(2), tx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[tokio::test]
    async fn test_requests_are_framed() {
        let (mut link, mut worker_read, _w) = fake_worker_handshake(Capabilities::SHARE).await;

        link.request(WorkerRequest::Pause).await.unwrap();
        link.request(WorkerRequest::Share(vec!["a.jpg".to_string()]))
            .await
            .unwrap();

        let (msg_type, payload) = read_frame(&mut worker_read).await.unwrap();
        assert_eq!(
            WorkerRequest::decode(msg_type, payload).unwrap(),
            WorkerRequest::Pause
        );
        let (msg_type, payload) = read_frame(&mut worker_read).await.unwrap();
        assert_eq!(
            WorkerRequest::decode(msg_type, payload).unwrap(),
            WorkerRequest::Share(vec!["a.jpg".to_string()])
        );
    }

    #[tokio::test]
    async fn test_request_after_worker_gone_fails() {
        let (mut link, worker_read, worker_write) =
            fake_worker_handshake(Capabilities::empty()).await;
        drop(worker_read);
        drop(worker_write);

        assert!(link.request(WorkerRequest::Resume).await.is_err());
        // Closing a dead link must not fail or hang
        link.close().await;
    }

    #[tokio::test]
    async fn test_socket_transport_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = SocketTransport::new(address);
        let result = transport.bind().await;
        assert!(matches!(result, Err(Error::Transport(_)) | Err(Error::Io(_))));
    }

    #[test]
    fn test_from_config_prefers_address() {
        let worker = WorkerConfig {
            address: Some("127.0.0.1:7431".to_string()),
            program: Some(PathBuf::from("/usr/bin/upload-worker")),
            args: vec![],
        };
        let transport = from_config(&worker).unwrap();
        assert_eq!(transport.describe(), "worker at 127.0.0.1:7431");

        let worker = WorkerConfig {
            address: None,
            ..worker
        };
        let transport = from_config(&worker).unwrap();
        assert_eq!(
            transport.describe(),
            "worker process /usr/bin/upload-worker"
        );

        assert!(matches!(
            from_config(&WorkerConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_does_not_wait_for_child() {
        let (link, _r, _w) = fake_worker_handshake(Capabilities::empty()).await;
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut link = link.with_child(child);

        let started = std::time::Instant::now();
        link.close().await;
        assert!(started.elapsed() < CHILD_EXIT_GRACE / 2);
    }

    #[tokio::test]
    async fn test_process_transport_missing_program() {
        let transport = ProcessTransport::new("/nonexistent/upload-worker", vec![]);
        let result = transport.bind().await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
