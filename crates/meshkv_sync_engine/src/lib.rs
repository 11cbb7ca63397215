//! Device-to-device data synchronization engine for meshkv stores.
//!
//! The engine keeps replicas of one key-value store convergent across
//! devices. Each peer tracks watermarks over a monotonic timestamp stream,
//! ships changed rows in paginated packets under a sliding send window, and
//! resolves conflicts last-writer-wins on apply. A small state machine
//! sequences the ability handshake, the data exchange and teardown;
//! per-peer queues make sure only one task runs against a peer at a time.
//!
//! The engine is transport- and storage-agnostic: hosts plug in a
//! [`Communicator`] for message delivery and a [`SyncStorage`] for the row
//! store. [`MemoryStorage`] and the mock communicators back the tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod communicator;
mod config;
mod context;
mod engine;
mod error;
mod ledger;
mod machine;
mod storage;
mod watermark;

pub use communicator::{loopback_pair, Communicator, LoopbackCommunicator, MockCommunicator};
pub use config::{DataSizeSpec, RetryConfig, SyncConfig};
pub use context::SyncTaskContext;
pub use engine::{AckOutcome, DataSyncEngine, RecvOutcome, SyncStats};
pub use error::{SyncError, SyncResult, TaskOutcome};
pub use ledger::{ResendInfo, ResendLedger};
pub use machine::{
    SyncScheduler, SyncState, SyncStateMachine, SyncStatus, SyncTarget, TaskEvent,
};
pub use storage::{ContinueToken, MemoryStorage, SyncDataPage, SyncStorage};
pub use watermark::{MarkKind, WatermarkStore};
