//! Storage adapter seam.
//!
//! The engine never talks to a row store directly; it consumes the
//! [`SyncStorage`] trait. [`MemoryStorage`] is the in-memory reference
//! implementation used throughout the tests.

use crate::config::DataSizeSpec;
use crate::error::{SyncError, SyncResult};
use meshkv_sync_protocol::conflict::{self, ConflictOutcome};
use meshkv_sync_protocol::{flags, DataItem, SyncTimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Opaque handle continuing a paginated read.
pub type ContinueToken = u64;

/// One page of changed rows.
#[derive(Debug, Clone, Default)]
pub struct SyncDataPage {
    /// Items in ascending timestamp order.
    pub items: Vec<DataItem>,
    /// Present when more data remains beyond this page.
    pub token: Option<ContinueToken>,
}

/// Capability surface the engine requires from the row store.
pub trait SyncStorage: Send + Sync {
    /// Returns a bounded page of rows changed inside `range`.
    fn get_sync_data(&self, range: &SyncTimeRange, spec: &DataSizeSpec)
        -> SyncResult<SyncDataPage>;

    /// Continues a paginated read.
    fn get_sync_data_next(
        &self,
        token: ContinueToken,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage>;

    /// Applies a batch of received rows in one transaction, resolving
    /// per-row conflicts. Either the whole batch commits or none of it.
    fn put_sync_data(&self, items: &[DataItem], peer: &str) -> SyncResult<()>;

    /// Reads a meta key.
    fn get_meta(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>>;

    /// Writes a meta key.
    fn put_meta(&self, key: &[u8], value: &[u8]) -> SyncResult<()>;

    /// Removes all rows that originated from `peer`.
    fn remove_device_data(&self, peer: &str) -> SyncResult<()>;

    /// Highest timestamp assigned so far.
    fn max_timestamp(&self) -> Timestamp;

    /// Content fingerprint of the current schema.
    fn schema_fingerprint(&self) -> Vec<u8>;

    /// Security classification of the store.
    fn security_label(&self) -> i32;

    /// True while another writer holds the store; sync calls made anyway
    /// fail with [`SyncError::Busy`].
    fn is_busy(&self) -> bool {
        false
    }
}

struct TokenState {
    remaining: Vec<DataItem>,
}

/// In-memory [`SyncStorage`] for tests and examples.
///
/// Rows are keyed by hash key; paginated reads snapshot the matching rows in
/// timestamp order and hand out continuation tokens over the remainder.
pub struct MemoryStorage {
    rows: RwLock<HashMap<Vec<u8>, DataItem>>,
    meta: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    tokens: Mutex<HashMap<ContinueToken, TokenState>>,
    next_token: AtomicU64,
    clock: AtomicU64,
    busy: AtomicBool,
    security_label: AtomicI32,
    schema: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            meta: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            security_label: AtomicI32::new(0),
            schema: RwLock::new(Vec::new()),
        }
    }

    /// Writes a local row, assigning the next timestamp.
    pub fn put_local(&self, key: &[u8], value: &[u8]) -> Timestamp {
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let item = DataItem::put(key.to_vec(), value.to_vec(), ts);
        self.rows.write().insert(item.hash_key.clone(), item);
        ts
    }

    /// Deletes a local row, leaving a tombstone.
    pub fn delete_local(&self, key: &[u8]) -> Timestamp {
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let item = DataItem::tombstone(key.to_vec(), ts);
        self.rows.write().insert(item.hash_key.clone(), item);
        ts
    }

    /// Returns the stored item for a key, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<DataItem> {
        let hash = meshkv_sync_protocol::hash_key_for(key);
        self.rows.read().get(&hash).cloned()
    }

    /// Returns the live value for a key.
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get(key)
            .filter(|item| !item.is_delete())
            .map(|item| item.value)
    }

    /// Number of stored rows, tombstones included.
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Simulates the store being locked by another writer.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Sets the security classification.
    pub fn set_security_label(&self, label: i32) {
        self.security_label.store(label, Ordering::SeqCst);
    }

    /// Sets the schema fingerprint.
    pub fn set_schema(&self, fingerprint: Vec<u8>) {
        *self.schema.write() = fingerprint;
    }

    fn check_busy(&self) -> SyncResult<()> {
        if self.busy.load(Ordering::SeqCst) {
            Err(SyncError::Busy)
        } else {
            Ok(())
        }
    }

    fn collect(&self, range: &SyncTimeRange) -> Vec<DataItem> {
        let rows = self.rows.read();
        let mut matched: Vec<DataItem> = rows
            .values()
            .filter(|item| {
                if item.is_delete() {
                    range.contains_delete(item.timestamp)
                } else {
                    range.contains(item.timestamp)
                }
            })
            .cloned()
            .collect();
        matched.sort_by_key(|item| item.timestamp);
        matched
    }

    fn page_of(&self, mut items: Vec<DataItem>, spec: &DataSizeSpec) -> SyncDataPage {
        let mut bytes = 0usize;
        let mut cut = items.len();
        for (idx, item) in items.iter().enumerate() {
            bytes += item.byte_size();
            // Always make progress: the first item goes out even when it
            // alone exceeds the byte budget.
            if idx + 1 >= spec.packet_size || (bytes > spec.block_size && idx > 0) {
                cut = idx + 1;
                break;
            }
        }
        let remaining = items.split_off(cut.min(items.len()));
        let token = if remaining.is_empty() {
            None
        } else {
            let token = self.next_token.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().insert(token, TokenState { remaining });
            Some(token)
        };
        SyncDataPage { items, token }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStorage for MemoryStorage {
    fn get_sync_data(
        &self,
        range: &SyncTimeRange,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage> {
        self.check_busy()?;
        if !range.is_valid() {
            return Err(SyncError::InvalidArgs("inverted time range".into()));
        }
        Ok(self.page_of(self.collect(range), spec))
    }

    fn get_sync_data_next(
        &self,
        token: ContinueToken,
        spec: &DataSizeSpec,
    ) -> SyncResult<SyncDataPage> {
        self.check_busy()?;
        let state = self
            .tokens
            .lock()
            .remove(&token)
            .ok_or_else(|| SyncError::InvalidArgs("unknown continuation token".into()))?;
        Ok(self.page_of(state.remaining, spec))
    }

    fn put_sync_data(&self, items: &[DataItem], peer: &str) -> SyncResult<()> {
        self.check_busy()?;
        let mut rows = self.rows.write();
        // Single writer lock for the whole batch keeps it atomic.
        for incoming in items {
            let existing = rows.get(&incoming.hash_key);
            match conflict::resolve(existing, incoming) {
                ConflictOutcome::KeepLocal => continue,
                ConflictOutcome::ApplyIncoming => {
                    let mut applied = incoming.clone();
                    applied.flags &= !flags::LOCAL;
                    if applied.orig_device.is_empty() {
                        applied.orig_device = peer.to_string();
                    }
                    // Received timestamps ratchet the local clock forward so
                    // later local writes still order after them.
                    let _ = self
                        .clock
                        .fetch_max(applied.timestamp, Ordering::SeqCst);
                    rows.insert(applied.hash_key.clone(), applied);
                }
            }
        }
        Ok(())
    }

    fn get_meta(&self, key: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.meta.read().get(key).cloned())
    }

    fn put_meta(&self, key: &[u8], value: &[u8]) -> SyncResult<()> {
        self.meta.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove_device_data(&self, peer: &str) -> SyncResult<()> {
        self.check_busy()?;
        self.rows.write().retain(|_, item| item.orig_device != peer);
        Ok(())
    }

    fn max_timestamp(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    fn schema_fingerprint(&self) -> Vec<u8> {
        self.schema.read().clone()
    }

    fn security_label(&self) -> i32 {
        self.security_label.load(Ordering::SeqCst)
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}
