//! Client-side controller for a background upload worker.
//!
//! Tracks the connection to a worker living in another process, registers
//! for its status callbacks, and reconciles the worker's piecemeal signals
//! into one [`OperationalState`] plus progress for display.

pub mod config;
pub mod controller;
pub mod error;
pub mod progress;
pub mod status;
pub mod worker;

pub use config::{Config, Endpoint};
pub use controller::{StatusObserver, StatusUpdate, SubscriptionId, UploadController};
pub use error::{Error, Result};
pub use progress::{ByteProgress, FileProgress, ProgressAggregator, ProgressSnapshot, ScaledBar};
pub use status::{reconcile, OperationalState, ReconcilerSnapshot, StatusReconciler, ToggleAction};
pub use worker::{ConnectionState, ControlOp, Delivery};
