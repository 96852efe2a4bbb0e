//! Callback channel: worker -> controller push notifications.
//!
//! Everything the worker pushes, and everything the transport reports about
//! the link itself, lands on one bounded queue consumed by the controller's
//! dispatch loop. Events are tagged with the registration they were
//! delivered under so the loop can drop anything from a torn-down session.

use crate::error::{Error, Result};
use crate::worker::transport::WorkerLink;
use std::fmt;
use tokio::sync::mpsc;

/// A single push notification from the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    SetUploading(bool),
    SetFileStatus { done: u32, in_flight: u32, total: u32 },
    SetByteStatus { done: u64, in_flight: u64, total: u64 },
    SetDigestRemaining(u32),
    /// Free-form status line, opaque to the state machine
    SetStatusText(String),
    /// Free-form statistics line, opaque to the state machine
    SetStatsText(String),
    /// Diagnostic line from the worker
    Log(String),
}

impl CallbackEvent {
    /// Whether applying this event can change the operational state
    pub fn affects_state(&self) -> bool {
        matches!(
            self,
            CallbackEvent::SetUploading(_)
                | CallbackEvent::SetFileStatus { .. }
                | CallbackEvent::SetDigestRemaining(_)
        )
    }
}

/// Identifies one callback registration. Unique per connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

/// Token held while this controller is registered with the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRegistration {
    id: RegistrationId,
}

impl CallbackRegistration {
    pub(crate) fn new(id: RegistrationId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }
}

/// Messages arriving at the controller's serialization point from outside
/// the caller's context: bind completions, worker events, link loss.
pub enum LinkSignal {
    /// A bind started by connect attempt `generation` finished
    Bound {
        generation: u64,
        result: Result<Box<dyn WorkerLink>>,
    },
    Event {
        registration: RegistrationId,
        event: CallbackEvent,
    },
    /// The event stream for `registration` ended
    Lost {
        registration: RegistrationId,
        reason: String,
    },
    /// Delayed reconnect after an unexpected disconnect
    Reconnect { generation: u64 },
}

impl fmt::Debug for LinkSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSignal::Bound { generation, result } => f
                .debug_struct("Bound")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            LinkSignal::Event {
                registration,
                event,
            } => f
                .debug_struct("Event")
                .field("registration", registration)
                .field("event", event)
                .finish(),
            LinkSignal::Lost {
                registration,
                reason,
            } => f
                .debug_struct("Lost")
                .field("registration", registration)
                .field("reason", reason)
                .finish(),
            LinkSignal::Reconnect { generation } => f
                .debug_struct("Reconnect")
                .field("generation", generation)
                .finish(),
        }
    }
}

pub type LinkSignalSender = mpsc::Sender<LinkSignal>;
pub type LinkSignalReceiver = mpsc::Receiver<LinkSignal>;

/// Create the bounded queue feeding the dispatch loop
pub fn link_signal_channel(capacity: usize) -> (LinkSignalSender, LinkSignalReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Handed to a [`WorkerLink`] on registration; the link pushes worker
/// events through it in the order the worker sent them.
#[derive(Debug, Clone)]
pub struct CallbackSink {
    registration: RegistrationId,
    tx: LinkSignalSender,
}

impl CallbackSink {
    pub fn new(registration: RegistrationId, tx: LinkSignalSender) -> Self {
        Self { registration, tx }
    }

    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    /// Push one event. Fails once the controller is gone.
    pub async fn deliver(&self, event: CallbackEvent) -> Result<()> {
        self.tx
            .send(LinkSignal::Event {
                registration: self.registration,
                event,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Report that the event stream ended.
    pub async fn lost(&self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(LinkSignal::Lost {
                registration: self.registration,
                reason: reason.into(),
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_events_in_order() {
        let (tx, mut rx) = link_signal_channel(8);
        let sink = CallbackSink::new(RegistrationId(3), tx);

        sink.deliver(CallbackEvent::SetUploading(true)).await.unwrap();
        sink.deliver(CallbackEvent::SetDigestRemaining(4))
            .await
            .unwrap();
        sink.lost("eof").await;

        match rx.recv().await.unwrap() {
            LinkSignal::Event {
                registration,
                event,
            } => {
                assert_eq!(registration, RegistrationId(3));
                assert_eq!(event, CallbackEvent::SetUploading(true));
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            LinkSignal::Event {
                event: CallbackEvent::SetDigestRemaining(4),
                ..
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            LinkSignal::Lost { reason, .. } if reason == "eof"
        ));
    }

    #[tokio::test]
    async fn test_deliver_after_controller_gone() {
        let (tx, rx) = link_signal_channel(1);
        let sink = CallbackSink::new(RegistrationId(1), tx);
        drop(rx);

        assert!(sink.is_closed());
        let err = sink
            .deliver(CallbackEvent::Log("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[test]
    fn test_affects_state() {
        assert!(CallbackEvent::SetUploading(false).affects_state());
        assert!(CallbackEvent::SetFileStatus {
            done: 0,
            in_flight: 0,
            total: 0
        }
        .affects_state());
        assert!(!CallbackEvent::SetStatsText(String::new()).affects_state());
        assert!(!CallbackEvent::SetByteStatus {
            done: 0,
            in_flight: 0,
            total: 0
        }
        .affects_state());
    }
}
