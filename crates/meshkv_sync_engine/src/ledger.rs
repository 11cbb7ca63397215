//! In-flight packet ledger.
//!
//! Every data packet sent inside a session is recorded here until its ack
//! arrives, keeping enough information to rebuild the exact packet on
//! resend.

use meshkv_sync_protocol::Timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Everything needed to regenerate one in-flight packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendInfo {
    /// Session the packet belongs to.
    pub session_id: u32,
    /// Packet identity echoed back by acks.
    pub packet_id: u64,
    /// Normal-stream range covered, begin inclusive.
    pub begin_time: Timestamp,
    /// Normal-stream range covered, end exclusive.
    pub end_time: Timestamp,
    /// Delete-stream range covered, begin inclusive.
    pub delete_begin_time: Timestamp,
    /// Delete-stream range covered, end exclusive.
    pub delete_end_time: Timestamp,
}

/// Sequence-keyed map of unacknowledged packets.
#[derive(Default)]
pub struct ResendLedger {
    entries: Mutex<BTreeMap<u32, ResendInfo>>,
}

impl ResendLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a packet under its sequence id.
    pub fn record(&self, sequence_id: u32, info: ResendInfo) {
        self.entries.lock().insert(sequence_id, info);
    }

    /// Looks up the entry for a sequence id.
    pub fn lookup(&self, sequence_id: u32) -> Option<ResendInfo> {
        self.entries.lock().get(&sequence_id).cloned()
    }

    /// Removes one entry once its ack has been processed.
    pub fn clear(&self, sequence_id: u32) -> Option<ResendInfo> {
        self.entries.lock().remove(&sequence_id)
    }

    /// Drops everything. Called at session start and on abort.
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    /// True when no packet is awaiting an ack.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of in-flight packets.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Lowest outstanding sequence id, if any.
    pub fn first_sequence(&self) -> Option<u32> {
        self.entries.lock().keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(session_id: u32, packet_id: u64) -> ResendInfo {
        ResendInfo {
            session_id,
            packet_id,
            begin_time: 0,
            end_time: 10,
            delete_begin_time: 0,
            delete_end_time: 0,
        }
    }

    #[test]
    fn record_lookup_clear() {
        let ledger = ResendLedger::new();
        ledger.record(1, info(7, 100));
        assert_eq!(ledger.lookup(1).unwrap().packet_id, 100);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.clear(1).unwrap().session_id, 7);
        assert!(ledger.is_empty());
        assert!(ledger.clear(1).is_none());
    }

    #[test]
    fn first_sequence_is_lowest() {
        let ledger = ResendLedger::new();
        ledger.record(5, info(1, 1));
        ledger.record(2, info(1, 2));
        ledger.record(9, info(1, 3));
        assert_eq!(ledger.first_sequence(), Some(2));
        ledger.clear(2);
        assert_eq!(ledger.first_sequence(), Some(5));
    }

    #[test]
    fn clear_all_empties_ledger() {
        let ledger = ResendLedger::new();
        ledger.record(1, info(1, 1));
        ledger.record(2, info(1, 2));
        ledger.clear_all();
        assert!(ledger.is_empty());
        assert_eq!(ledger.first_sequence(), None);
    }
}
