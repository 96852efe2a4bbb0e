//! In-memory transport for unit tests.

use crate::error::{Error, Result};
use crate::worker::channel::CallbackSink;
use crate::worker::protocol::{Capabilities, WorkerRequest};
use crate::worker::transport::{WorkerLink, WorkerTransport};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Knobs for the next links handed out by [`MockTransport`]
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub fail_bind: bool,
    pub fail_register: bool,
    pub fail_unregister: bool,
    pub fail_requests: bool,
    pub capabilities: Capabilities,
    /// Hold every bind until this is notified
    pub bind_gate: Option<Arc<Notify>>,
}

/// Shared view of everything the mock links were asked to do
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    calls: Arc<Mutex<Vec<String>>>,
    sinks: Arc<Mutex<Vec<CallbackSink>>>,
}

impl MockLog {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Sink of the most recent successful registration
    pub fn last_sink(&self) -> Option<CallbackSink> {
        self.sinks.lock().unwrap().last().cloned()
    }
}

pub struct MockLink {
    behavior: MockBehavior,
    log: MockLog,
}

#[async_trait]
impl WorkerLink for MockLink {
    fn capabilities(&self) -> Capabilities {
        self.behavior.capabilities
    }

    async fn register_callback(&mut self, sink: CallbackSink) -> Result<()> {
        self.log.record(format!("register {}", sink.registration()));
        if self.behavior.fail_register {
            return Err(Error::Registration("mock refused".to_string()));
        }
        self.log.sinks.lock().unwrap().push(sink);
        Ok(())
    }

    async fn unregister_callback(&mut self) -> Result<()> {
        self.log.record("unregister");
        if self.behavior.fail_unregister {
            return Err(Error::Transport("mock worker gone".to_string()));
        }
        Ok(())
    }

    async fn request(&mut self, request: WorkerRequest) -> Result<()> {
        self.log.record(format!("{:?}", request));
        if self.behavior.fail_requests {
            return Err(Error::Transport("mock pipe broken".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.log.record("close");
    }
}

#[derive(Default)]
pub struct MockTransport {
    behavior: Mutex<MockBehavior>,
    pub log: MockLog,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            log: MockLog::default(),
        })
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn bind(&self) -> Result<Box<dyn WorkerLink>> {
        let behavior = self.behavior.lock().unwrap().clone();
        self.log.record("bind");
        if let Some(gate) = &behavior.bind_gate {
            gate.notified().await;
        }
        if behavior.fail_bind {
            return Err(Error::Transport("mock worker unreachable".to_string()));
        }
        Ok(Box::new(MockLink {
            behavior,
            log: self.log.clone(),
        }))
    }
}
