//! Data sync engine.
//!
//! One engine serves a single store. It drives outbound sessions (push,
//! pull, push-pull) and answers inbound packets from peers. All watermark
//! movement, pagination, windowing and resend bookkeeping happens here; the
//! state machine in [`crate::machine`] only sequences the phases.

use crate::communicator::Communicator;
use crate::config::SyncConfig;
use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{ResendInfo, ResendLedger};
use crate::storage::SyncStorage;
use crate::watermark::{MarkKind, WatermarkStore};
use meshkv_sync_protocol::{
    AbilityAck, AbilityRequest, ControlAckPacket, ControlCmd, ControlRequestPacket,
    DataAckPacket, DataItem, DataRequestPacket, DeviceId, Message, RecvCode, SyncMode,
    SyncPacket, SyncTimeRange, Timestamp, WaterMark, SEND_FINISHED,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Control sequences live above this so they never collide with data
/// sequence ids in the ledger.
const CONTROL_SEQUENCE_BASE: u32 = 0x8000_0000;

/// Upper bound on live subscriptions accepted from one peer.
const MAX_SUBSCRIPTIONS_PER_PEER: usize = 8;

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Data packets sent, resends excluded.
    pub packets_sent: u64,
    /// Data acks accepted.
    pub acks_received: u64,
    /// Items shipped in outbound packets.
    pub items_sent: u64,
    /// Items applied from inbound packets.
    pub items_applied: u64,
    /// Packets rebuilt and sent again.
    pub resends: u64,
    /// Rows dropped for exceeding the value size limit.
    pub oversize_dropped: u64,
    /// Watermark mismatches that forced a rewind.
    pub watermark_rewinds: u64,
}

/// What an accepted ack means for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// More packets remain in flight or were just sent.
    Progress,
    /// Every packet of the session has been sent and acknowledged.
    Finished,
    /// The ack did not match any in-flight packet and was ignored.
    Stale,
}

/// What an inbound data packet turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Batch applied and acknowledged.
    Applied {
        /// The sender marked this as its final packet.
        is_last: bool,
    },
    /// Batch was already covered by our watermark; acknowledged only.
    Duplicate,
    /// Sender is ahead of what we have; told it to rewind.
    WatermarkGap,
    /// Packet was a pull request; a response push has been started.
    PullServed,
}

struct SessionState {
    session_id: u32,
    mode: u8,
    window_remaining: u32,
    max_sequence_id_sent: u32,
    all_data_sent: bool,
    continue_token: Option<u64>,
    send_cursor: Timestamp,
    delete_cursor: Timestamp,
    session_end: Timestamp,
    control_sequence: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session_id: 0,
            mode: 0,
            window_remaining: 0,
            max_sequence_id_sent: 0,
            all_data_sent: false,
            continue_token: None,
            send_cursor: 0,
            delete_cursor: 0,
            session_end: 0,
            control_sequence: CONTROL_SEQUENCE_BASE,
        }
    }
}

/// Session state and resend bookkeeping for one peer. Tasks against
/// distinct peers never touch each other's entry, so a session starting
/// for one peer cannot wipe another peer's in-flight packets.
struct PeerSession {
    state: Mutex<SessionState>,
    ledger: ResendLedger,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            ledger: ResendLedger::new(),
        }
    }
}

/// Single-store sync engine.
pub struct DataSyncEngine {
    config: SyncConfig,
    storage: Arc<dyn SyncStorage>,
    communicator: Arc<dyn Communicator>,
    watermarks: WatermarkStore,
    sessions: Mutex<HashMap<DeviceId, Arc<PeerSession>>>,
    next_packet_id: AtomicU64,
    stats: Mutex<SyncStats>,
    remove_pending: Mutex<HashSet<DeviceId>>,
    subscriptions: Mutex<HashMap<DeviceId, HashSet<String>>>,
}

impl DataSyncEngine {
    /// Builds an engine over a store and a transport.
    pub fn new(
        config: SyncConfig,
        storage: Arc<dyn SyncStorage>,
        communicator: Arc<dyn Communicator>,
    ) -> Self {
        let watermarks = WatermarkStore::new(storage.clone());
        Self {
            config,
            storage,
            communicator,
            watermarks,
            sessions: Mutex::new(HashMap::new()),
            next_packet_id: AtomicU64::new(0),
            stats: Mutex::new(SyncStats::default()),
            remove_pending: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Number of packets awaiting an ack from a peer.
    pub fn in_flight(&self, peer: &str) -> usize {
        self.session_for(peer).ledger.len()
    }

    /// Watermark bookkeeping, exposed for inspection.
    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    fn with_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock());
    }

    fn session_for(&self, peer: &str) -> Arc<PeerSession> {
        self.sessions
            .lock()
            .entry(peer.to_string())
            .or_default()
            .clone()
    }

    fn effective_version(&self, ctx: &SyncTaskContext) -> u32 {
        self.config.protocol_version.min(ctx.peer_protocol_version)
    }

    fn security_compatible(local: i32, remote: i32) -> bool {
        local == 0 || remote == 0 || local == remote
    }

    fn schema_mismatch(&self, remote: &[u8]) -> bool {
        let local = self.storage.schema_fingerprint();
        !local.is_empty() && !remote.is_empty() && local != remote
    }

    // ---- outbound sessions ----------------------------------------------

    /// Schedules a "forget everything from this peer" before the next sync.
    pub fn queue_remove_device_data(&self, peer: &str) {
        self.remove_pending.lock().insert(peer.to_string());
    }

    fn remove_device_data_if_need(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        if !self.remove_pending.lock().contains(&ctx.peer) {
            return Ok(());
        }
        self.storage.remove_device_data(&ctx.peer)?;
        self.watermarks.reset_peer(&ctx.peer)?;
        self.remove_pending.lock().remove(&ctx.peer);
        info!(peer = %ctx.peer, "removed stale device data before sync");
        Ok(())
    }

    fn reset_sync_status(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        let send_mark = self
            .watermarks
            .get(MarkKind::LocalSend, &ctx.peer, &ctx.query_id)?;
        let delete_mark = if ctx.is_query_sync() {
            self.watermarks
                .get(MarkKind::LocalDeleteSend, &ctx.peer, &ctx.query_id)?
        } else {
            0
        };
        let sess = self.session_for(&ctx.peer);
        let mut session = sess.state.lock();
        session.session_id = ctx.session_id;
        session.mode = ctx.mode.to_code();
        session.window_remaining = self.config.window_size_for(ctx.peer_protocol_version);
        session.max_sequence_id_sent = 0;
        session.all_data_sent = false;
        session.continue_token = None;
        session.send_cursor = send_mark;
        session.delete_cursor = delete_mark;
        session.session_end = self.storage.max_timestamp() + 1;
        session.control_sequence = CONTROL_SEQUENCE_BASE;
        drop(session);
        sess.ledger.clear_all();
        Ok(())
    }

    /// Enters a new session and sends the first window of packets.
    pub fn sync_start(&self, ctx: &mut SyncTaskContext) -> SyncResult<()> {
        info!(
            peer = %ctx.peer,
            mode = ?ctx.mode,
            session = ctx.session_id,
            query = %ctx.query_id,
            "sync session start"
        );
        // Removal zeroes the peer's watermarks, so it must run before the
        // session snapshots its send cursor from them.
        self.remove_device_data_if_need(ctx)?;
        self.reset_sync_status(ctx)?;
        match ctx.mode {
            SyncMode::Push | SyncMode::PushPull => self.send_next_batches(ctx),
            SyncMode::Pull => self.send_pull_request(ctx),
        }
    }

    /// Sends packets until the window closes or the data runs out.
    pub fn send_next_batches(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        while self.send_one_packet(ctx)? {}
        Ok(())
    }

    fn send_one_packet(&self, ctx: &SyncTaskContext) -> SyncResult<bool> {
        let peer_mark = self
            .watermarks
            .get(MarkKind::PeerRecv, &ctx.peer, &ctx.query_id)?;
        let sess = self.session_for(&ctx.peer);
        let mut session = sess.state.lock();
        if session.window_remaining == 0 || session.all_data_sent {
            return Ok(false);
        }

        let page = match session.continue_token {
            Some(token) => self
                .storage
                .get_sync_data_next(token, &self.config.data_size)?,
            None => {
                let range = if ctx.is_query_sync() {
                    SyncTimeRange::with_delete_range(
                        session.send_cursor,
                        session.session_end,
                        session.delete_cursor,
                        session.session_end,
                    )
                } else {
                    SyncTimeRange::full(session.send_cursor, session.session_end)
                };
                self.storage.get_sync_data(&range, &self.config.data_size)?
            }
        };
        session.continue_token = None;

        let is_last = page.token.is_none();
        let page_max = page.items.iter().map(|item| item.timestamp).max();
        let end = if is_last {
            session.session_end
        } else {
            // Mid-session packets cover up to the last row they carry.
            page_max.map(|ts| ts + 1).unwrap_or(session.send_cursor)
        };
        let items = self.filter_oversize(page.items);

        let begin = session.send_cursor;
        let delete_begin = session.delete_cursor;
        let delete_end = if ctx.is_query_sync() { end } else { 0 };
        let sequence_id = session.max_sequence_id_sent + 1;
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst) + 1;

        let packet = DataRequestPacket {
            version: self.effective_version(ctx),
            mode: session.mode,
            data: items,
            local_watermark: begin,
            peer_watermark: peer_mark,
            delete_watermark: delete_begin,
            end_watermark: end,
            delete_end_watermark: delete_end,
            send_code: if is_last { SEND_FINISHED } else { 0 },
            packet_id,
            is_last_sequence: is_last,
            query_id: ctx.query_id.clone(),
            schema_fingerprint: self.storage.schema_fingerprint(),
            security_label: self.storage.security_label(),
        };
        let item_count = packet.data.len() as u64;

        sess.ledger.record(
            sequence_id,
            ResendInfo {
                session_id: session.session_id,
                packet_id,
                begin_time: begin,
                end_time: end,
                delete_begin_time: delete_begin,
                delete_end_time: delete_end,
            },
        );
        let message = Message::new(
            session.session_id,
            sequence_id,
            SyncPacket::DataRequest(packet),
        );
        if let Err(err) = self.communicator.send(&ctx.peer, &message) {
            sess.ledger.clear(sequence_id);
            return Err(err);
        }

        session.max_sequence_id_sent = sequence_id;
        session.window_remaining -= 1;
        session.all_data_sent = is_last;
        session.continue_token = page.token;
        session.send_cursor = end;
        if ctx.is_query_sync() {
            session.delete_cursor = delete_end;
        }
        drop(session);

        debug!(
            peer = %ctx.peer,
            sequence = sequence_id,
            items = item_count,
            last = is_last,
            "data packet sent"
        );
        self.with_stats(|s| {
            s.packets_sent += 1;
            s.items_sent += item_count;
        });
        Ok(true)
    }

    fn filter_oversize(&self, items: Vec<DataItem>) -> Vec<DataItem> {
        let mut kept = Vec::with_capacity(items.len());
        let mut dropped = 0u64;
        for item in items {
            if item.value.len() > self.config.max_value_size {
                dropped += 1;
                continue;
            }
            kept.push(item);
        }
        if dropped > 0 {
            warn!(dropped, "dropped oversize rows from outbound packet");
            self.with_stats(|s| s.oversize_dropped += dropped);
        }
        kept
    }

    fn send_pull_request(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        let recv_mark = self
            .watermarks
            .get(MarkKind::PeerRecv, &ctx.peer, &ctx.query_id)?;
        let delete_recv = if ctx.is_query_sync() {
            self.watermarks
                .get(MarkKind::PeerDeleteRecv, &ctx.peer, &ctx.query_id)?
        } else {
            0
        };
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst) + 1;
        let packet = DataRequestPacket {
            version: self.effective_version(ctx),
            mode: SyncMode::Pull.to_code(),
            data: Vec::new(),
            local_watermark: 0,
            peer_watermark: recv_mark,
            delete_watermark: delete_recv,
            end_watermark: 0,
            delete_end_watermark: 0,
            send_code: 0,
            packet_id,
            is_last_sequence: true,
            query_id: ctx.query_id.clone(),
            schema_fingerprint: self.storage.schema_fingerprint(),
            security_label: self.storage.security_label(),
        };
        let message = Message::new(ctx.session_id, 1, SyncPacket::DataRequest(packet));
        self.communicator.send(&ctx.peer, &message)
    }

    // ---- inbound data ---------------------------------------------------

    fn send_data_ack(
        &self,
        peer: &DeviceId,
        session_id: u32,
        sequence_id: u32,
        version: u32,
        code: RecvCode,
        watermark: WaterMark,
        delete_watermark: WaterMark,
        packet_id: u64,
    ) -> SyncResult<()> {
        let ack = DataAckPacket {
            version,
            recv_code: code.to_code(),
            watermark,
            delete_watermark,
            packet_id,
        };
        let message = Message::new(session_id, sequence_id, SyncPacket::DataAck(ack));
        self.communicator.send(peer, &message)
    }

    /// Handles an inbound data packet: pull requests get a response push,
    /// push batches get validated, applied and acknowledged.
    pub fn data_request_recv(
        &self,
        ctx: &mut SyncTaskContext,
        message: &Message,
    ) -> SyncResult<RecvOutcome> {
        let SyncPacket::DataRequest(packet) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected data request".into()));
        };
        let version = self.config.protocol_version.min(packet.version);
        let query = packet.query_id.clone();
        let reject = |code: RecvCode, watermark, delete| {
            self.send_data_ack(
                &ctx.peer,
                message.session_id,
                message.sequence_id,
                version,
                code,
                watermark,
                delete,
                packet.packet_id,
            )
        };

        if packet.version > self.config.protocol_version {
            reject(RecvCode::NotSupport, 0, 0)?;
            return Err(SyncError::NotSupport);
        }
        if !Self::security_compatible(self.storage.security_label(), packet.security_label) {
            reject(RecvCode::SecurityCheckFailed, 0, 0)?;
            return Err(SyncError::SecurityCheck);
        }
        if self.schema_mismatch(&packet.schema_fingerprint) {
            reject(RecvCode::SchemaChanged, 0, 0)?;
            return Err(SyncError::SchemaChanged);
        }
        let Some(mode) = SyncMode::from_code(packet.mode) else {
            reject(RecvCode::InvalidArgs, 0, 0)?;
            return Err(SyncError::InvalidArgs("unknown sync mode".into()));
        };

        if mode == SyncMode::Pull && packet.data.is_empty() {
            self.pull_response_start(
                ctx,
                &query,
                message.session_id,
                packet.peer_watermark,
                packet.delete_watermark,
            )?;
            return Ok(RecvOutcome::PullServed);
        }

        let known = self.watermarks.get(MarkKind::PeerRecv, &ctx.peer, &query)?;
        let known_delete = self
            .watermarks
            .get(MarkKind::PeerDeleteRecv, &ctx.peer, &query)?;

        if packet.local_watermark > known {
            warn!(
                peer = %ctx.peer,
                expected = known,
                got = packet.local_watermark,
                "watermark gap on inbound data, requesting rewind"
            );
            reject(RecvCode::WaterMarkInvalid, known, known_delete)?;
            return Ok(RecvOutcome::WatermarkGap);
        }
        if packet.end_watermark <= known {
            // Already applied once; ack again so the sender can move on.
            reject(RecvCode::Ok, known, known_delete)?;
            return Ok(RecvOutcome::Duplicate);
        }

        if let Err(err) = self.storage.put_sync_data(&packet.data, &ctx.peer) {
            reject(err.to_recv_code(), known, known_delete)?;
            return Err(err);
        }
        self.with_stats(|s| s.items_applied += packet.data.len() as u64);

        self.watermarks
            .advance(MarkKind::PeerRecv, &ctx.peer, &query, packet.end_watermark)?;
        if !query.is_empty() {
            self.watermarks.advance(
                MarkKind::PeerDeleteRecv,
                &ctx.peer,
                &query,
                packet.delete_end_watermark,
            )?;
        }
        self.send_data_ack(
            &ctx.peer,
            message.session_id,
            message.sequence_id,
            version,
            RecvCode::Ok,
            packet.end_watermark,
            packet.delete_end_watermark,
            packet.packet_id,
        )?;
        debug!(
            peer = %ctx.peer,
            sequence = message.sequence_id,
            items = packet.data.len(),
            "data batch applied"
        );

        if mode == SyncMode::PushPull && packet.is_last_sequence {
            self.pull_response_start(
                ctx,
                &query,
                message.session_id,
                packet.peer_watermark,
                packet.delete_watermark,
            )?;
            return Ok(RecvOutcome::PullServed);
        }
        Ok(RecvOutcome::Applied {
            is_last: packet.is_last_sequence,
        })
    }

    /// Starts pushing our data back after a pull or push-pull request.
    ///
    /// The requester's view of where we left off is authoritative; if it
    /// lost data its mark is behind ours and we rewind to match.
    fn pull_response_start(
        &self,
        ctx: &mut SyncTaskContext,
        query: &str,
        session_id: u32,
        begin: WaterMark,
        delete_begin: WaterMark,
    ) -> SyncResult<()> {
        self.watermarks
            .rewind(MarkKind::LocalSend, &ctx.peer, query, begin)?;
        if !query.is_empty() {
            self.watermarks
                .rewind(MarkKind::LocalDeleteSend, &ctx.peer, query, delete_begin)?;
        }
        ctx.session_id = session_id;
        ctx.query_id = query.to_string();
        // The response is an ordinary push; an empty response packet must
        // not read as another pull request on the far side.
        ctx.mode = SyncMode::Push;
        self.reset_sync_status(ctx)?;
        self.send_next_batches(ctx)
    }

    // ---- acks -----------------------------------------------------------

    /// True when the ack matches the peer's live session and an in-flight
    /// packet.
    pub fn ack_packet_id_check(&self, peer: &str, message: &Message) -> bool {
        let SyncPacket::DataAck(ack) = &message.packet else {
            return false;
        };
        let sess = self.session_for(peer);
        if message.session_id != sess.state.lock().session_id {
            return false;
        }
        match sess.ledger.lookup(message.sequence_id) {
            Some(info) => ack.packet_id == 0 || ack.packet_id == info.packet_id,
            None => false,
        }
    }

    /// Processes a data ack, advancing watermarks and the send window.
    pub fn ack_recv(
        &self,
        ctx: &mut SyncTaskContext,
        message: &Message,
    ) -> SyncResult<AckOutcome> {
        if !ctx.is_current() {
            return Ok(AckOutcome::Stale);
        }
        let SyncPacket::DataAck(ack) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected data ack".into()));
        };
        if !self.ack_packet_id_check(&ctx.peer, message) {
            debug!(sequence = message.sequence_id, "stale ack ignored");
            return Ok(AckOutcome::Stale);
        }
        let Some(code) = ack.recv_code() else {
            return Err(SyncError::NotSupport);
        };
        let sess = self.session_for(&ctx.peer);

        match code {
            RecvCode::Ok => {
                let Some(info) = sess.ledger.clear(message.sequence_id) else {
                    return Ok(AckOutcome::Stale);
                };
                self.watermarks.advance(
                    MarkKind::LocalSend,
                    &ctx.peer,
                    &ctx.query_id,
                    info.end_time,
                )?;
                if ctx.is_query_sync() {
                    self.watermarks.advance(
                        MarkKind::LocalDeleteSend,
                        &ctx.peer,
                        &ctx.query_id,
                        info.delete_end_time,
                    )?;
                }
                ctx.reset_retry();
                sess.state.lock().window_remaining += 1;
                self.with_stats(|s| s.acks_received += 1);

                self.send_next_batches(ctx)?;
                let session = sess.state.lock();
                if session.all_data_sent && sess.ledger.is_empty() {
                    Ok(AckOutcome::Finished)
                } else {
                    Ok(AckOutcome::Progress)
                }
            }
            RecvCode::WaterMarkInvalid => {
                info!(
                    peer = %ctx.peer,
                    rewind_to = ack.watermark,
                    "peer reported watermark mismatch, rewinding"
                );
                self.with_stats(|s| s.watermark_rewinds += 1);
                self.watermarks.rewind(
                    MarkKind::LocalSend,
                    &ctx.peer,
                    &ctx.query_id,
                    ack.watermark,
                )?;
                if ctx.is_query_sync() {
                    self.watermarks.rewind(
                        MarkKind::LocalDeleteSend,
                        &ctx.peer,
                        &ctx.query_id,
                        ack.delete_watermark,
                    )?;
                }
                sess.ledger.clear_all();
                {
                    let mut session = sess.state.lock();
                    session.window_remaining =
                        self.config.window_size_for(ctx.peer_protocol_version);
                    session.all_data_sent = false;
                    session.continue_token = None;
                    session.send_cursor = ack.watermark;
                    session.delete_cursor = ack.delete_watermark;
                    session.session_end = self.storage.max_timestamp() + 1;
                }
                self.send_next_batches(ctx)?;
                Ok(AckOutcome::Progress)
            }
            other => match SyncError::from_recv_code(other) {
                Some(err) => Err(err),
                None => Ok(AckOutcome::Stale),
            },
        }
    }

    /// Rebuilds and resends the packet recorded under `sequence_id`.
    pub fn resend_data(&self, ctx: &SyncTaskContext, sequence_id: u32) -> SyncResult<()> {
        let sess = self.session_for(&ctx.peer);
        let info = sess
            .ledger
            .lookup(sequence_id)
            .ok_or_else(|| SyncError::InvalidArgs("no in-flight packet to resend".into()))?;
        let (session_id, mode, is_last) = {
            let session = sess.state.lock();
            if info.session_id != session.session_id {
                return Err(SyncError::InvalidArgs("resend crosses sessions".into()));
            }
            (
                session.session_id,
                session.mode,
                session.all_data_sent && sequence_id == session.max_sequence_id_sent,
            )
        };
        let peer_mark = self
            .watermarks
            .get(MarkKind::PeerRecv, &ctx.peer, &ctx.query_id)?;
        let range = SyncTimeRange::with_delete_range(
            info.begin_time,
            info.end_time,
            info.delete_begin_time,
            info.delete_end_time,
        );
        let page = self.storage.get_sync_data(&range, &self.config.data_size)?;
        let items = self.filter_oversize(page.items);

        let packet = DataRequestPacket {
            version: self.effective_version(ctx),
            mode,
            data: items,
            local_watermark: info.begin_time,
            peer_watermark: peer_mark,
            delete_watermark: info.delete_begin_time,
            end_watermark: info.end_time,
            delete_end_watermark: info.delete_end_time,
            send_code: if is_last { SEND_FINISHED } else { 0 },
            packet_id: info.packet_id,
            is_last_sequence: is_last,
            query_id: ctx.query_id.clone(),
            schema_fingerprint: self.storage.schema_fingerprint(),
            security_label: self.storage.security_label(),
        };
        let message = Message::new(session_id, sequence_id, SyncPacket::DataRequest(packet));
        self.communicator.send(&ctx.peer, &message)?;
        self.with_stats(|s| s.resends += 1);
        info!(peer = %ctx.peer, sequence = sequence_id, "packet resent");
        Ok(())
    }

    /// Lowest sequence id still waiting for an ack from a peer.
    pub fn first_outstanding(&self, peer: &str) -> Option<u32> {
        self.session_for(peer).ledger.first_sequence()
    }

    // ---- ability handshake ----------------------------------------------

    /// Opens a session by announcing our versions and store properties.
    pub fn ability_sync_start(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        let packet = AbilityRequest {
            version: self.config.protocol_version,
            software_version: self.config.software_version,
            schema_fingerprint: self.storage.schema_fingerprint(),
            security_label: self.storage.security_label(),
        };
        let message = Message::new(ctx.session_id, 0, SyncPacket::AbilityRequest(packet));
        self.communicator.send(&ctx.peer, &message)
    }

    /// Answers a peer's ability announcement.
    pub fn ability_request_recv(
        &self,
        ctx: &SyncTaskContext,
        message: &Message,
    ) -> SyncResult<()> {
        let SyncPacket::AbilityRequest(packet) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected ability request".into()));
        };
        let ack_code = if !Self::security_compatible(
            self.storage.security_label(),
            packet.security_label,
        ) {
            RecvCode::SecurityCheckFailed
        } else if self.schema_mismatch(&packet.schema_fingerprint) {
            RecvCode::SchemaChanged
        } else {
            RecvCode::Ok
        };
        let ack = AbilityAck {
            version: self.config.protocol_version.min(packet.version),
            software_version: self.config.software_version,
            ack_code: ack_code.to_code(),
            schema_fingerprint: self.storage.schema_fingerprint(),
            security_label: self.storage.security_label(),
        };
        let reply = Message::new(message.session_id, 0, SyncPacket::AbilityAck(ack));
        self.communicator.send(&ctx.peer, &reply)?;
        match SyncError::from_recv_code(ack_code) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Absorbs the peer's ability ack, fixing the negotiated versions.
    pub fn ability_ack_recv(
        &self,
        ctx: &mut SyncTaskContext,
        message: &Message,
    ) -> SyncResult<()> {
        let SyncPacket::AbilityAck(ack) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected ability ack".into()));
        };
        ctx.peer_protocol_version = self.config.protocol_version.min(ack.version);
        ctx.peer_software_version = ack.software_version;
        match ack.ack_code() {
            Some(RecvCode::Ok) => {}
            Some(code) => {
                return Err(SyncError::from_recv_code(code).unwrap_or(SyncError::NotSupport))
            }
            None => return Err(SyncError::NotSupport),
        }
        if !Self::security_compatible(self.storage.security_label(), ack.security_label) {
            return Err(SyncError::SecurityCheck);
        }
        if self.schema_mismatch(&ack.schema_fingerprint) {
            return Err(SyncError::SchemaChanged);
        }
        debug!(
            peer = %ctx.peer,
            version = ctx.peer_protocol_version,
            "ability handshake complete"
        );
        Ok(())
    }

    // ---- control commands -----------------------------------------------

    /// Sends a subscribe or unsubscribe for the context's query.
    pub fn control_cmd_start(&self, ctx: &SyncTaskContext, cmd: ControlCmd) -> SyncResult<u32> {
        if !ctx.is_query_sync() {
            return Err(SyncError::InvalidArgs(
                "control commands are query scoped".into(),
            ));
        }
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst) + 1;
        let sess = self.session_for(&ctx.peer);
        let sequence_id = {
            let mut session = sess.state.lock();
            session.control_sequence += 1;
            session.control_sequence
        };
        sess.ledger.record(
            sequence_id,
            ResendInfo {
                session_id: ctx.session_id,
                packet_id,
                begin_time: 0,
                end_time: 0,
                delete_begin_time: 0,
                delete_end_time: 0,
            },
        );
        let packet = ControlRequestPacket {
            version: self.effective_version(ctx),
            cmd,
            query_id: ctx.query_id.clone(),
            packet_id,
        };
        let message = Message::new(ctx.session_id, sequence_id, SyncPacket::ControlRequest(packet));
        if let Err(err) = self.communicator.send(&ctx.peer, &message) {
            sess.ledger.clear(sequence_id);
            return Err(err);
        }
        Ok(sequence_id)
    }

    /// Handles an inbound subscribe/unsubscribe request.
    pub fn control_request_recv(
        &self,
        ctx: &SyncTaskContext,
        message: &Message,
    ) -> SyncResult<ControlCmd> {
        let SyncPacket::ControlRequest(packet) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected control request".into()));
        };
        let reply = |code: RecvCode| {
            let ack = ControlAckPacket {
                version: self.config.protocol_version.min(packet.version),
                recv_code: code.to_code(),
                cmd: packet.cmd,
            };
            self.communicator.send(
                &ctx.peer,
                &Message::new(message.session_id, message.sequence_id, SyncPacket::ControlAck(ack)),
            )
        };
        if packet.query_id.is_empty() {
            reply(RecvCode::InvalidArgs)?;
            return Err(SyncError::InvalidArgs("subscription without query".into()));
        }
        match packet.cmd {
            ControlCmd::Subscribe => {
                let mut subs = self.subscriptions.lock();
                let entry = subs.entry(ctx.peer.clone()).or_default();
                if !entry.contains(&packet.query_id)
                    && entry.len() >= MAX_SUBSCRIPTIONS_PER_PEER
                {
                    drop(subs);
                    reply(RecvCode::OverMaxLimits)?;
                    return Err(SyncError::OverMaxLimits);
                }
                entry.insert(packet.query_id.clone());
            }
            ControlCmd::Unsubscribe => {
                let mut subs = self.subscriptions.lock();
                let removed = subs
                    .get_mut(&ctx.peer)
                    .map(|set| set.remove(&packet.query_id))
                    .unwrap_or(false);
                if !removed {
                    drop(subs);
                    reply(RecvCode::NotFound)?;
                    return Err(SyncError::NotFound);
                }
            }
        }
        reply(RecvCode::Ok)?;
        Ok(packet.cmd)
    }

    /// Handles the ack for a control command we sent.
    pub fn control_ack_recv(&self, ctx: &SyncTaskContext, message: &Message) -> SyncResult<()> {
        let SyncPacket::ControlAck(packet) = &message.packet else {
            return Err(SyncError::InvalidArgs("expected control ack".into()));
        };
        if self.session_for(&ctx.peer).ledger.clear(message.sequence_id).is_none() {
            return Ok(()); // late duplicate
        }
        match packet.recv_code() {
            Some(RecvCode::Ok) => Ok(()),
            Some(code) => Err(SyncError::from_recv_code(code).unwrap_or(SyncError::NotSupport)),
            None => Err(SyncError::NotSupport),
        }
    }

    /// True when the peer holds a live subscription on the query.
    pub fn is_subscribed(&self, peer: &str, query_id: &str) -> bool {
        self.subscriptions
            .lock()
            .get(peer)
            .map(|set| set.contains(query_id))
            .unwrap_or(false)
    }

    // ---- teardown -------------------------------------------------------

    /// Drops all session state held for a peer. Safe to call from any phase.
    pub fn clear_sync_status(&self, peer: &str) {
        self.sessions.lock().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::MockCommunicator;
    use crate::config::DataSizeSpec;
    use crate::storage::MemoryStorage;
    use meshkv_sync_protocol::PROTOCOL_VERSION_CURRENT;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn engine_with(
        rows: usize,
        packet_size: usize,
    ) -> (Arc<DataSyncEngine>, Arc<MemoryStorage>, Arc<MockCommunicator>) {
        let storage = Arc::new(MemoryStorage::new());
        for i in 0..rows {
            storage.put_local(format!("key-{i:04}").as_bytes(), b"value");
        }
        let comm = Arc::new(MockCommunicator::new());
        let config = SyncConfig::new("dev-a").with_data_size(DataSizeSpec {
            block_size: 1024 * 1024,
            packet_size,
        });
        let engine = Arc::new(DataSyncEngine::new(config, storage.clone(), comm.clone()));
        (engine, storage, comm)
    }

    fn ctx_v2(mode: SyncMode) -> SyncTaskContext {
        let mut ctx = SyncTaskContext::new("dev-b", mode, 11);
        ctx.peer_protocol_version = PROTOCOL_VERSION_CURRENT;
        ctx
    }

    fn ok_ack(message: &Message) -> Message {
        let SyncPacket::DataRequest(packet) = &message.packet else {
            panic!("expected data request");
        };
        Message::new(
            message.session_id,
            message.sequence_id,
            SyncPacket::DataAck(DataAckPacket {
                version: packet.version,
                recv_code: RecvCode::Ok.to_code(),
                watermark: packet.end_watermark,
                delete_watermark: packet.delete_end_watermark,
                packet_id: packet.packet_id,
            }),
        )
    }

    #[test]
    fn push_single_packet_finishes_on_ack() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();

        let sent = comm.take_sent();
        assert_eq!(sent.len(), 1);
        let SyncPacket::DataRequest(packet) = &sent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(packet.data.len(), 3);
        assert_eq!(packet.send_code, SEND_FINISHED);
        assert!(packet.is_last_sequence);

        let outcome = engine.ack_recv(&mut ctx, &ok_ack(&sent[0].1)).unwrap();
        assert_eq!(outcome, AckOutcome::Finished);
        assert_eq!(engine.in_flight("dev-b"), 0);
        let mark = engine
            .watermarks()
            .get(MarkKind::LocalSend, "dev-b", "")
            .unwrap();
        assert_eq!(mark, 4); // 3 rows, session end is max + 1
    }

    #[test]
    fn window_limits_packets_in_flight() {
        let (engine, _storage, comm) = engine_with(25, 5);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();

        // 5 pages of 5 rows, window of 3.
        let first = comm.take_sent();
        assert_eq!(first.len(), 3);
        assert_eq!(engine.in_flight("dev-b"), 3);

        let outcome = engine.ack_recv(&mut ctx, &ok_ack(&first[0].1)).unwrap();
        assert_eq!(outcome, AckOutcome::Progress);
        assert_eq!(comm.take_sent().len(), 1);
        assert_eq!(engine.in_flight("dev-b"), 3);
    }

    #[test]
    fn full_windowed_push_drains_everything() {
        let (engine, _storage, comm) = engine_with(25, 5);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();

        let mut pending: Vec<Message> =
            comm.take_sent().into_iter().map(|(_, m)| m).collect();
        let mut finished = false;
        let mut rounds = 0;
        while let Some(message) = pending.first().cloned() {
            pending.remove(0);
            rounds += 1;
            assert!(rounds < 20, "push did not converge");
            match engine.ack_recv(&mut ctx, &ok_ack(&message)).unwrap() {
                AckOutcome::Finished => {
                    finished = true;
                    break;
                }
                AckOutcome::Progress => {
                    pending.extend(comm.take_sent().into_iter().map(|(_, m)| m));
                }
                AckOutcome::Stale => panic!("unexpected stale ack"),
            }
        }
        assert!(finished);
        assert_eq!(engine.stats().packets_sent, 5);
        assert_eq!(engine.stats().items_sent, 25);
    }

    #[test]
    fn stale_session_ack_is_ignored() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();

        let mut stale = ok_ack(&sent[0].1);
        stale.session_id = 999;
        assert_eq!(
            engine.ack_recv(&mut ctx, &stale).unwrap(),
            AckOutcome::Stale
        );
        assert_eq!(engine.in_flight("dev-b"), 1);
    }

    #[test]
    fn wrong_packet_id_ack_is_ignored() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();

        let mut forged = ok_ack(&sent[0].1);
        if let SyncPacket::DataAck(ack) = &mut forged.packet {
            ack.packet_id = 12345;
        }
        assert_eq!(
            engine.ack_recv(&mut ctx, &forged).unwrap(),
            AckOutcome::Stale
        );
    }

    #[test]
    fn error_ack_maps_to_sync_error() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();

        let mut nack = ok_ack(&sent[0].1);
        if let SyncPacket::DataAck(ack) = &mut nack.packet {
            ack.recv_code = RecvCode::SchemaChanged.to_code();
        }
        let err = engine.ack_recv(&mut ctx, &nack).unwrap_err();
        assert!(matches!(err, SyncError::SchemaChanged));
        assert_eq!(err.outcome(), crate::error::TaskOutcome::Abort);
    }

    #[test]
    fn watermark_invalid_ack_rewinds_and_resends() {
        let (engine, _storage, comm) = engine_with(10, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        // Pretend half the data was already sent.
        engine
            .watermarks()
            .advance(MarkKind::LocalSend, "dev-b", "", 5)
            .unwrap();
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();
        let SyncPacket::DataRequest(packet) = &sent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(packet.data.len(), 6); // rows 5..=10

        // Peer lost everything and answers with mark zero.
        let mut rewind = ok_ack(&sent[0].1);
        if let SyncPacket::DataAck(ack) = &mut rewind.packet {
            ack.recv_code = RecvCode::WaterMarkInvalid.to_code();
            ack.watermark = 0;
            ack.delete_watermark = 0;
        }
        let outcome = engine.ack_recv(&mut ctx, &rewind).unwrap();
        assert_eq!(outcome, AckOutcome::Progress);
        assert_eq!(engine.stats().watermark_rewinds, 1);

        let resent = comm.take_sent();
        assert_eq!(resent.len(), 1);
        let SyncPacket::DataRequest(packet) = &resent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(packet.local_watermark, 0);
        assert_eq!(packet.data.len(), 10);
    }

    #[test]
    fn oversize_rows_are_dropped_not_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put_local(b"small", b"ok");
        storage.put_local(b"big", &vec![0u8; 200]);
        storage.put_local(b"small2", b"ok");
        let comm = Arc::new(MockCommunicator::new());
        let config = SyncConfig::new("dev-a").with_max_value_size(100);
        let engine = DataSyncEngine::new(config, storage, comm.clone());

        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();
        let SyncPacket::DataRequest(packet) = &sent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(packet.data.len(), 2);
        assert_eq!(engine.stats().oversize_dropped, 1);
        // The covered range still spans the dropped row.
        assert_eq!(packet.end_watermark, 4);
    }

    #[test]
    fn busy_storage_fails_sync_start() {
        let (engine, storage, _comm) = engine_with(3, 100);
        storage.set_busy(true);
        let mut ctx = ctx_v2(SyncMode::Push);
        let err = engine.sync_start(&mut ctx).unwrap_err();
        assert!(matches!(err, SyncError::Busy));
        assert!(err.is_retryable());
    }

    #[test]
    fn inbound_batch_applies_and_acks() {
        let (engine, storage, comm) = engine_with(0, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        let items = vec![
            DataItem::put(b"k1".to_vec(), b"v1".to_vec(), 3),
            DataItem::put(b"k2".to_vec(), b"v2".to_vec(), 5),
        ];
        let request = Message::new(
            11,
            1,
            SyncPacket::DataRequest(DataRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                mode: SyncMode::Push.to_code(),
                data: items,
                local_watermark: 0,
                peer_watermark: 0,
                delete_watermark: 0,
                end_watermark: 6,
                delete_end_watermark: 0,
                send_code: SEND_FINISHED,
                packet_id: 77,
                is_last_sequence: true,
                query_id: String::new(),
                schema_fingerprint: Vec::new(),
                security_label: 0,
            }),
        );
        let outcome = engine.data_request_recv(&mut ctx, &request).unwrap();
        assert_eq!(outcome, RecvOutcome::Applied { is_last: true });
        assert_eq!(storage.get_value(b"k1"), Some(b"v1".to_vec()));

        let acks = comm.take_sent();
        assert_eq!(acks.len(), 1);
        let SyncPacket::DataAck(ack) = &acks[0].1.packet else {
            panic!("expected ack");
        };
        assert_eq!(ack.recv_code(), Some(RecvCode::Ok));
        assert_eq!(ack.watermark, 6);
        assert_eq!(ack.packet_id, 77);

        // Redelivery of the same packet is ack-only.
        let outcome = engine.data_request_recv(&mut ctx, &request).unwrap();
        assert_eq!(outcome, RecvOutcome::Duplicate);
        assert_eq!(storage.row_count(), 2);
        assert_eq!(engine.stats().items_applied, 2);
    }

    #[test]
    fn inbound_gap_requests_rewind() {
        let (engine, _storage, comm) = engine_with(0, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        let request = Message::new(
            11,
            2,
            SyncPacket::DataRequest(DataRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                mode: SyncMode::Push.to_code(),
                data: vec![DataItem::put(b"k".to_vec(), b"v".to_vec(), 9)],
                local_watermark: 8, // we have never seen 0..8
                peer_watermark: 0,
                delete_watermark: 0,
                end_watermark: 10,
                delete_end_watermark: 0,
                send_code: 0,
                packet_id: 5,
                is_last_sequence: false,
                query_id: String::new(),
                schema_fingerprint: Vec::new(),
                security_label: 0,
            }),
        );
        let outcome = engine.data_request_recv(&mut ctx, &request).unwrap();
        assert_eq!(outcome, RecvOutcome::WatermarkGap);

        let acks = comm.take_sent();
        let SyncPacket::DataAck(ack) = &acks[0].1.packet else {
            panic!("expected ack");
        };
        assert_eq!(ack.recv_code(), Some(RecvCode::WaterMarkInvalid));
        assert_eq!(ack.watermark, 0);
    }

    #[test]
    fn security_mismatch_rejected() {
        let (engine, storage, comm) = engine_with(0, 100);
        storage.set_security_label(2);
        let mut ctx = ctx_v2(SyncMode::Push);
        let request = Message::new(
            11,
            1,
            SyncPacket::DataRequest(DataRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                mode: SyncMode::Push.to_code(),
                data: Vec::new(),
                local_watermark: 0,
                peer_watermark: 0,
                delete_watermark: 0,
                end_watermark: 1,
                delete_end_watermark: 0,
                send_code: SEND_FINISHED,
                packet_id: 1,
                is_last_sequence: true,
                query_id: String::new(),
                schema_fingerprint: Vec::new(),
                security_label: 3,
            }),
        );
        let err = engine.data_request_recv(&mut ctx, &request).unwrap_err();
        assert!(matches!(err, SyncError::SecurityCheck));
        let acks = comm.take_sent();
        let SyncPacket::DataAck(ack) = &acks[0].1.packet else {
            panic!("expected ack");
        };
        assert_eq!(ack.recv_code(), Some(RecvCode::SecurityCheckFailed));
    }

    #[test]
    fn pull_request_triggers_response_push() {
        let (engine, _storage, comm) = engine_with(4, 100);
        let mut ctx = ctx_v2(SyncMode::Pull);
        let request = Message::new(
            21,
            1,
            SyncPacket::DataRequest(DataRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                mode: SyncMode::Pull.to_code(),
                data: Vec::new(),
                local_watermark: 0,
                peer_watermark: 0, // puller has nothing yet
                delete_watermark: 0,
                end_watermark: 0,
                delete_end_watermark: 0,
                send_code: 0,
                packet_id: 9,
                is_last_sequence: true,
                query_id: String::new(),
                schema_fingerprint: Vec::new(),
                security_label: 0,
            }),
        );
        let outcome = engine.data_request_recv(&mut ctx, &request).unwrap();
        assert_eq!(outcome, RecvOutcome::PullServed);

        let sent = comm.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.session_id, 21);
        let SyncPacket::DataRequest(packet) = &sent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(packet.data.len(), 4);
        assert!(packet.is_last_sequence);
    }

    #[test]
    fn resend_rebuilds_same_packet() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();
        let sent = comm.take_sent();
        let SyncPacket::DataRequest(original) = &sent[0].1.packet else {
            panic!("expected data request");
        };

        engine.resend_data(&ctx, sent[0].1.sequence_id).unwrap();
        let resent = comm.take_sent();
        let SyncPacket::DataRequest(rebuilt) = &resent[0].1.packet else {
            panic!("expected data request");
        };
        assert_eq!(rebuilt.packet_id, original.packet_id);
        assert_eq!(rebuilt.local_watermark, original.local_watermark);
        assert_eq!(rebuilt.end_watermark, original.end_watermark);
        assert_eq!(rebuilt.data.len(), original.data.len());
        assert_eq!(engine.stats().resends, 1);
    }

    #[test]
    fn ability_handshake_negotiates_version() {
        let (engine, _storage, comm) = engine_with(0, 100);
        let mut ctx = SyncTaskContext::new("dev-b", SyncMode::Push, 5);
        engine.ability_sync_start(&ctx).unwrap();
        let sent = comm.take_sent();
        assert!(matches!(sent[0].1.packet, SyncPacket::AbilityRequest(_)));

        let ack = Message::new(
            5,
            0,
            SyncPacket::AbilityAck(AbilityAck {
                version: PROTOCOL_VERSION_CURRENT,
                software_version: 9,
                ack_code: RecvCode::Ok.to_code(),
                schema_fingerprint: Vec::new(),
                security_label: 0,
            }),
        );
        engine.ability_ack_recv(&mut ctx, &ack).unwrap();
        assert_eq!(ctx.peer_protocol_version, PROTOCOL_VERSION_CURRENT);
        assert_eq!(ctx.peer_software_version, 9);
    }

    #[test]
    fn ability_ack_with_old_peer_downgrades_window() {
        let (engine, _storage, _comm) = engine_with(0, 100);
        let mut ctx = SyncTaskContext::new("dev-b", SyncMode::Push, 5);
        let ack = Message::new(
            5,
            0,
            SyncPacket::AbilityAck(AbilityAck {
                version: 1,
                software_version: 1,
                ack_code: RecvCode::Ok.to_code(),
                schema_fingerprint: Vec::new(),
                security_label: 0,
            }),
        );
        engine.ability_ack_recv(&mut ctx, &ack).unwrap();
        assert_eq!(ctx.peer_protocol_version, 1);
        assert_eq!(engine.config().window_size_for(ctx.peer_protocol_version), 1);
    }

    #[test]
    fn subscribe_round_trip_and_limits() {
        let (engine, _storage, comm) = engine_with(0, 100);
        let responder_ctx = SyncTaskContext::new("dev-b", SyncMode::Push, 1);

        for i in 0..MAX_SUBSCRIPTIONS_PER_PEER {
            let request = Message::new(
                1,
                CONTROL_SEQUENCE_BASE + i as u32 + 1,
                SyncPacket::ControlRequest(ControlRequestPacket {
                    version: PROTOCOL_VERSION_CURRENT,
                    cmd: ControlCmd::Subscribe,
                    query_id: format!("q{i}"),
                    packet_id: i as u64 + 1,
                }),
            );
            engine.control_request_recv(&responder_ctx, &request).unwrap();
        }
        assert!(engine.is_subscribed("dev-b", "q0"));

        let over = Message::new(
            1,
            CONTROL_SEQUENCE_BASE + 99,
            SyncPacket::ControlRequest(ControlRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                cmd: ControlCmd::Subscribe,
                query_id: "one-too-many".into(),
                packet_id: 99,
            }),
        );
        let err = engine.control_request_recv(&responder_ctx, &over).unwrap_err();
        assert!(matches!(err, SyncError::OverMaxLimits));

        let unsub = Message::new(
            1,
            CONTROL_SEQUENCE_BASE + 100,
            SyncPacket::ControlRequest(ControlRequestPacket {
                version: PROTOCOL_VERSION_CURRENT,
                cmd: ControlCmd::Unsubscribe,
                query_id: "q0".into(),
                packet_id: 100,
            }),
        );
        engine.control_request_recv(&responder_ctx, &unsub).unwrap();
        assert!(!engine.is_subscribed("dev-b", "q0"));
        assert!(comm.sent_count() >= MAX_SUBSCRIPTIONS_PER_PEER);
    }

    #[test]
    fn sessions_for_distinct_peers_are_independent() {
        let (engine, _storage, comm) = engine_with(3, 100);
        let mut ctx_b = ctx_v2(SyncMode::Push);
        let mut ctx_c = SyncTaskContext::new("dev-c", SyncMode::Push, 12);
        ctx_c.peer_protocol_version = PROTOCOL_VERSION_CURRENT;

        engine.sync_start(&mut ctx_b).unwrap();
        let to_b = comm.take_sent();
        assert_eq!(engine.in_flight("dev-b"), 1);

        // A second peer entering a session must not clear dev-b's ledger.
        engine.sync_start(&mut ctx_c).unwrap();
        assert_eq!(engine.in_flight("dev-b"), 1);
        assert_eq!(engine.in_flight("dev-c"), 1);

        let outcome = engine.ack_recv(&mut ctx_b, &ok_ack(&to_b[0].1)).unwrap();
        assert_eq!(outcome, AckOutcome::Finished);
        assert_eq!(engine.in_flight("dev-c"), 1);
    }

    #[test]
    fn removal_resets_send_cursor_before_session_opens() {
        let (engine, _storage, comm) = engine_with(5, 100);
        engine
            .watermarks()
            .advance(MarkKind::LocalSend, "dev-b", "", 3)
            .unwrap();
        engine.queue_remove_device_data("dev-b");
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();

        let sent = comm.take_sent();
        let SyncPacket::DataRequest(packet) = &sent[0].1.packet else {
            panic!("expected data request");
        };
        // The session opens from the zeroed mark, not the pre-removal cursor.
        assert_eq!(packet.local_watermark, 0);
        assert_eq!(packet.data.len(), 5);
    }

    #[test]
    fn queued_device_removal_runs_before_sync() {
        let (engine, storage, comm) = engine_with(1, 100);
        let remote = DataItem::put(b"their-key".to_vec(), b"v".to_vec(), 50);
        storage.put_sync_data(&[remote], "dev-b").unwrap();
        engine
            .watermarks()
            .advance(MarkKind::PeerRecv, "dev-b", "", 50)
            .unwrap();
        assert_eq!(storage.row_count(), 2);

        engine.queue_remove_device_data("dev-b");
        let mut ctx = ctx_v2(SyncMode::Push);
        engine.sync_start(&mut ctx).unwrap();

        assert_eq!(storage.row_count(), 1);
        assert_eq!(
            engine.watermarks().get(MarkKind::PeerRecv, "dev-b", "").unwrap(),
            0
        );
        assert!(!comm.take_sent().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Whatever order acks, duplicate acks and timeout resends land in,
        // the send watermark only ever moves forward.
        #[test]
        fn send_mark_is_monotonic_under_ack_and_timeout_noise(
            script in proptest::collection::vec(0u8..3, 1..40),
        ) {
            let (engine, _storage, comm) = engine_with(25, 5);
            let mut ctx = ctx_v2(SyncMode::Push);
            engine.sync_start(&mut ctx).unwrap();
            let mut pending: VecDeque<Message> =
                comm.take_sent().into_iter().map(|(_, m)| m).collect();
            let mut acked: Vec<Message> = Vec::new();
            let mut last_mark = 0;
            for op in script {
                match op {
                    0 => {
                        if let Some(message) = pending.pop_front() {
                            engine.ack_recv(&mut ctx, &ok_ack(&message)).unwrap();
                            acked.push(message);
                            pending.extend(
                                comm.take_sent().into_iter().map(|(_, m)| m),
                            );
                        }
                    }
                    1 => {
                        if let Some(message) = acked.last() {
                            let outcome =
                                engine.ack_recv(&mut ctx, &ok_ack(message)).unwrap();
                            prop_assert_eq!(outcome, AckOutcome::Stale);
                        }
                    }
                    _ => {
                        if let Some(sequence) = engine.first_outstanding("dev-b") {
                            engine.resend_data(&ctx, sequence).unwrap();
                            comm.take_sent();
                        }
                    }
                }
                let mark = engine
                    .watermarks()
                    .get(MarkKind::LocalSend, "dev-b", "")
                    .unwrap();
                prop_assert!(
                    mark >= last_mark,
                    "send mark regressed from {} to {}",
                    last_mark,
                    mark
                );
                last_mark = mark;
            }
        }
    }
}
