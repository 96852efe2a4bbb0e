//! Everything on the controller's side of the worker process boundary.
//!
//! # Architecture
//!
//! ```text
//!   caller ──commands──▶ ┌────────────────────┐ ──requests──▶ ┌────────┐
//!                        │  dispatch loop     │               │ worker │
//!   observers ◀─updates─ │ (UploadController) │ ◀─LinkSignal─ │ process│
//!                        └────────────────────┘               └────────┘
//! ```
//!
//! `connection` owns the lifecycle (bind, register, unregister, close),
//! `channel` carries pushed events back to the single consumer,
//! `transport` is the seam to the actual IPC, and `protocol` is the frame
//! codec spoken over it.

pub mod channel;
pub mod connection;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{
    link_signal_channel, CallbackEvent, CallbackRegistration, CallbackSink, LinkSignal,
    RegistrationId,
};
pub use connection::{ConnectionState, ControlOp, Delivery, WorkerConnection};
pub use protocol::{
    decode_inbound, encode_event, encode_fatal, negotiate_version, read_frame, write_frame,
    Capabilities, Hello, Inbound, MessageType, VersionNegotiationResult, WorkerRequest,
    MAX_FRAME_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
pub use transport::{
    from_config, ProcessTransport, SocketTransport, StreamLink, WorkerLink, WorkerTransport,
};
