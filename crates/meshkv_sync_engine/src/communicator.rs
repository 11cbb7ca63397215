//! Message transport seam.
//!
//! The engine only ever sends framed [`Message`]s; delivery, routing and
//! retransmission at the link layer belong to the host. [`MockCommunicator`]
//! captures outbound traffic for inspection and [`loopback_pair`] wires two
//! endpoints together over in-process channels.

use crate::error::{SyncError, SyncResult};
use meshkv_sync_protocol::{DeviceId, Message};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Outbound message sink.
pub trait Communicator: Send + Sync {
    /// Sends one framed message to a peer.
    fn send(&self, peer: &DeviceId, message: &Message) -> SyncResult<()>;
}

/// Test double that records every send.
///
/// Messages round-trip through the codec before being stored, so a packet
/// that would not survive the wire fails here too.
pub struct MockCommunicator {
    sent: Mutex<Vec<(DeviceId, Message)>>,
    online: AtomicBool,
}

impl MockCommunicator {
    /// Creates an online mock.
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Toggles simulated reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Drains and returns everything sent so far.
    pub fn take_sent(&self) -> Vec<(DeviceId, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Number of messages sent so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Default for MockCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for MockCommunicator {
    fn send(&self, peer: &DeviceId, message: &Message) -> SyncResult<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::comm_retryable("peer unreachable"));
        }
        let bytes = message.encode()?;
        let decoded = Message::decode(&bytes)?;
        self.sent.lock().push((peer.clone(), decoded));
        Ok(())
    }
}

/// One half of an in-process link.
pub struct LoopbackCommunicator {
    local: DeviceId,
    tx: Mutex<Sender<(DeviceId, Vec<u8>)>>,
    rx: Mutex<Receiver<(DeviceId, Vec<u8>)>>,
}

impl LoopbackCommunicator {
    /// Receives the next pending message, if any, tagged with the sender.
    pub fn try_recv(&self) -> SyncResult<Option<(DeviceId, Message)>> {
        match self.rx.lock().try_recv() {
            Ok((from, bytes)) => Ok(Some((from, Message::decode(&bytes)?))),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(SyncError::comm_fatal("link closed"))
            }
        }
    }
}

impl Communicator for LoopbackCommunicator {
    fn send(&self, _peer: &DeviceId, message: &Message) -> SyncResult<()> {
        let bytes = message.encode()?;
        self.tx
            .lock()
            .send((self.local.clone(), bytes))
            .map_err(|_| SyncError::comm_fatal("link closed"))
    }
}

/// Builds two connected endpoints; what one sends the other receives.
pub fn loopback_pair(a: &str, b: &str) -> (LoopbackCommunicator, LoopbackCommunicator) {
    let (tx_ab, rx_ab) = mpsc::channel();
    let (tx_ba, rx_ba) = mpsc::channel();
    (
        LoopbackCommunicator {
            local: a.to_string(),
            tx: Mutex::new(tx_ab),
            rx: Mutex::new(rx_ba),
        },
        LoopbackCommunicator {
            local: b.to_string(),
            tx: Mutex::new(tx_ba),
            rx: Mutex::new(rx_ab),
        },
    )
}
