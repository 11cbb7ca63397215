//! Per-task context shared between the engine and the state machine.

use meshkv_sync_protocol::{
    DeviceId, SyncMode, PROTOCOL_VERSION_BASE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mutable state for one sync task against one peer.
///
/// The `current` flag lets late ack handlers notice that the task they
/// belong to has already been torn down.
#[derive(Debug, Clone)]
pub struct SyncTaskContext {
    /// Target device.
    pub peer: DeviceId,
    /// Requested direction.
    pub mode: SyncMode,
    /// Session this task runs under.
    pub session_id: u32,
    /// Query identity; empty means full sync.
    pub query_id: String,
    /// Peer protocol version, learned during the ability handshake.
    pub peer_protocol_version: u32,
    /// Peer software version, learned during the ability handshake.
    pub peer_software_version: u32,
    /// Resend attempts consumed so far.
    pub retry_count: u32,
    current: Arc<AtomicBool>,
}

impl SyncTaskContext {
    /// Creates a context for a full sync.
    pub fn new(peer: impl Into<DeviceId>, mode: SyncMode, session_id: u32) -> Self {
        Self {
            peer: peer.into(),
            mode,
            session_id,
            query_id: String::new(),
            peer_protocol_version: PROTOCOL_VERSION_BASE,
            peer_software_version: 0,
            retry_count: 0,
            current: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Scopes the task to a registered query.
    pub fn with_query(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    /// True when the task is scoped to a query.
    pub fn is_query_sync(&self) -> bool {
        !self.query_id.is_empty()
    }

    /// False once the task has been finished or aborted.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    /// Marks the task as torn down; clones observe this too.
    pub fn clear(&self) {
        self.current.store(false, Ordering::SeqCst);
    }

    /// Consumes one retry attempt, returning the new count.
    pub fn bump_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Resets the retry budget after forward progress.
    pub fn reset_retry(&mut self) {
        self.retry_count = 0;
    }
}
