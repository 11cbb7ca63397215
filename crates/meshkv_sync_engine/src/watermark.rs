//! Watermark bookkeeping.
//!
//! Four marks exist per (peer, query) pair: what we have sent and what we
//! have received, each split into a normal stream and a delete stream.
//! Marks live in storage meta keys and are cached in memory; they only move
//! forward except through the explicit [`WatermarkStore::rewind`] and
//! [`WatermarkStore::reset_peer`] paths.

use crate::error::SyncResult;
use crate::storage::SyncStorage;
use meshkv_sync_protocol::{DeviceId, WaterMark};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Which of the four marks a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkKind {
    /// Highest timestamp we have sent to the peer (normal stream).
    LocalSend,
    /// Highest timestamp we have received from the peer (normal stream).
    PeerRecv,
    /// Highest tombstone timestamp we have sent.
    LocalDeleteSend,
    /// Highest tombstone timestamp we have received.
    PeerDeleteRecv,
}

impl MarkKind {
    fn tag(self) -> &'static str {
        match self {
            MarkKind::LocalSend => "send",
            MarkKind::PeerRecv => "recv",
            MarkKind::LocalDeleteSend => "send_del",
            MarkKind::PeerDeleteRecv => "recv_del",
        }
    }

    const ALL: [MarkKind; 4] = [
        MarkKind::LocalSend,
        MarkKind::PeerRecv,
        MarkKind::LocalDeleteSend,
        MarkKind::PeerDeleteRecv,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MarkKey {
    kind: MarkKind,
    peer: DeviceId,
    query: String,
}

fn meta_key(key: &MarkKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.peer.len() + key.query.len());
    out.extend_from_slice(b"wm/");
    out.extend_from_slice(key.kind.tag().as_bytes());
    out.push(b'/');
    out.extend_from_slice(key.peer.as_bytes());
    out.push(b'/');
    out.extend_from_slice(key.query.as_bytes());
    out
}

/// Cached, persisted watermarks.
pub struct WatermarkStore {
    storage: Arc<dyn SyncStorage>,
    cache: RwLock<HashMap<MarkKey, WaterMark>>,
    // Serializes read-modify-write against the backing meta keys.
    write_lock: Mutex<()>,
}

impl WatermarkStore {
    /// Creates a store backed by `storage` meta keys.
    pub fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Reads a mark, falling back to the persisted value on cache miss.
    pub fn get(&self, kind: MarkKind, peer: &str, query: &str) -> SyncResult<WaterMark> {
        let key = MarkKey {
            kind,
            peer: peer.to_string(),
            query: query.to_string(),
        };
        if let Some(mark) = self.cache.read().get(&key) {
            return Ok(*mark);
        }
        let mark = match self.storage.get_meta(&meta_key(&key))? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_le_bytes(buf)
            }
            _ => 0,
        };
        self.cache.write().insert(key, mark);
        Ok(mark)
    }

    /// Advances a mark. Values at or below the current mark are ignored.
    pub fn advance(
        &self,
        kind: MarkKind,
        peer: &str,
        query: &str,
        mark: WaterMark,
    ) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        if mark <= self.get(kind, peer, query)? {
            return Ok(());
        }
        self.store(kind, peer, query, mark)
    }

    /// Forces a mark backwards. Only legitimate after the peer reported a
    /// watermark mismatch or lost its data.
    pub fn rewind(
        &self,
        kind: MarkKind,
        peer: &str,
        query: &str,
        mark: WaterMark,
    ) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        self.store(kind, peer, query, mark)
    }

    /// Zeroes every known mark for a peer, all queries included.
    pub fn reset_peer(&self, peer: &str) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        let mut queries: Vec<String> = self
            .cache
            .read()
            .keys()
            .filter(|key| key.peer == peer)
            .map(|key| key.query.clone())
            .collect();
        if !queries.contains(&String::new()) {
            queries.push(String::new());
        }
        queries.sort();
        queries.dedup();
        for query in &queries {
            for kind in MarkKind::ALL {
                self.store(kind, peer, query, 0)?;
            }
        }
        Ok(())
    }

    /// Highest timestamp sent to the peer.
    pub fn local_watermark(&self, peer: &str, query: &str) -> SyncResult<WaterMark> {
        self.get(MarkKind::LocalSend, peer, query)
    }

    /// Advances the sent mark.
    pub fn set_local_watermark(&self, peer: &str, query: &str, mark: WaterMark) -> SyncResult<()> {
        self.advance(MarkKind::LocalSend, peer, query, mark)
    }

    /// Highest timestamp received from the peer.
    pub fn peer_watermark(&self, peer: &str, query: &str) -> SyncResult<WaterMark> {
        self.get(MarkKind::PeerRecv, peer, query)
    }

    /// Advances the received mark.
    pub fn set_peer_watermark(&self, peer: &str, query: &str, mark: WaterMark) -> SyncResult<()> {
        self.advance(MarkKind::PeerRecv, peer, query, mark)
    }

    /// Highest tombstone timestamp sent to the peer.
    pub fn local_delete_watermark(&self, peer: &str, query: &str) -> SyncResult<WaterMark> {
        self.get(MarkKind::LocalDeleteSend, peer, query)
    }

    /// Highest tombstone timestamp received from the peer.
    pub fn peer_delete_watermark(&self, peer: &str, query: &str) -> SyncResult<WaterMark> {
        self.get(MarkKind::PeerDeleteRecv, peer, query)
    }

    fn store(&self, kind: MarkKind, peer: &str, query: &str, mark: WaterMark) -> SyncResult<()> {
        let key = MarkKey {
            kind,
            peer: peer.to_string(),
            query: query.to_string(),
        };
        self.storage
            .put_meta(&meta_key(&key), &mark.to_le_bytes())?;
        self.cache.write().insert(key, mark);
        Ok(())
    }
}
