//! Sync task state machine and per-peer scheduling.
//!
//! A task walks Idle -> AbilitySync -> DataSync -> Finished, with Aborted
//! reachable from any live phase. Events arrive over an mpsc channel so
//! transports and timers can post from other threads; every armed timeout
//! carries a timer id and stale ids are ignored.

use crate::context::SyncTaskContext;
use crate::engine::{AckOutcome, DataSyncEngine, RecvOutcome};
use crate::error::{SyncError, TaskOutcome};
use meshkv_sync_protocol::{DeviceId, Message, SyncMode, SyncPacket};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Capacity of a task's event queue. Events arrive one network round trip
/// at a time, so the queue stays far below this in practice.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Phase of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No task running.
    Idle,
    /// Version handshake in flight.
    AbilitySync,
    /// Data and acks moving.
    DataSync,
    /// Completed successfully.
    Finished,
    /// Torn down after an unrecoverable error or cancel.
    Aborted,
}

/// Terminal status reported per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// All data exchanged and acknowledged.
    Ok,
    /// Peer or store was busy past the retry budget.
    Busy,
    /// No ack arrived in time.
    Timeout,
    /// Schemas diverged.
    SchemaChanged,
    /// Security labels were incompatible.
    SecurityCheck,
    /// Peer cannot speak a common protocol version.
    NotSupport,
    /// Task cancelled by the host.
    Cancelled,
    /// Anything else.
    Error,
}

impl From<&SyncError> for SyncStatus {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::Busy => SyncStatus::Busy,
            SyncError::Timeout => SyncStatus::Timeout,
            SyncError::SchemaChanged | SyncError::SchemaNotFound => SyncStatus::SchemaChanged,
            SyncError::SecurityCheck => SyncStatus::SecurityCheck,
            SyncError::NotSupport => SyncStatus::NotSupport,
            SyncError::Cancelled => SyncStatus::Cancelled,
            _ => SyncStatus::Error,
        }
    }
}

/// Input to a running task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A packet from the peer.
    Remote(Message),
    /// An armed timer fired; ignored unless the id is current.
    Timeout(u64),
    /// Host asked the task to stop.
    Cancel,
}

/// One queued unit of work against a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    /// Peer to sync with.
    pub peer: DeviceId,
    /// Direction.
    pub mode: SyncMode,
    /// Query scope; empty for full sync.
    pub query_id: String,
}

impl SyncTarget {
    /// Full sync target.
    pub fn new(peer: impl Into<DeviceId>, mode: SyncMode) -> Self {
        Self {
            peer: peer.into(),
            mode,
            query_id: String::new(),
        }
    }

    /// Scopes the target to a query.
    pub fn with_query(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    /// True when `newer` would redo everything this target would do.
    pub fn superseded_by(&self, newer: &SyncTarget) -> bool {
        self.peer == newer.peer
            && self.query_id == newer.query_id
            && (newer.mode == self.mode || newer.mode == SyncMode::PushPull)
    }
}

/// Pops the next target worth running, dropping entries a later queued
/// target makes redundant.
fn next_runnable(queue: &mut VecDeque<SyncTarget>) -> Option<SyncTarget> {
    while let Some(front) = queue.pop_front() {
        if queue.iter().any(|later| front.superseded_by(later)) {
            debug!(peer = %front.peer, mode = ?front.mode, "skipping superseded sync target");
            continue;
        }
        return Some(front);
    }
    None
}

/// Drives one task from handshake to a terminal state.
pub struct SyncStateMachine {
    engine: Arc<DataSyncEngine>,
    ctx: SyncTaskContext,
    state: SyncState,
    timer_id: u64,
    next_timer: u64,
    send_done: bool,
    recv_done: bool,
    status: Option<SyncStatus>,
    tx: SyncSender<TaskEvent>,
    rx: Receiver<TaskEvent>,
}

impl SyncStateMachine {
    /// Builds an idle machine for one task.
    pub fn new(engine: Arc<DataSyncEngine>, ctx: SyncTaskContext) -> Self {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        Self {
            engine,
            ctx,
            state: SyncState::Idle,
            timer_id: 0,
            next_timer: 0,
            send_done: false,
            recv_done: false,
            status: None,
            tx,
            rx,
        }
    }

    /// Current phase.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Terminal status, once reached.
    pub fn status(&self) -> Option<SyncStatus> {
        self.status
    }

    /// True in `Finished` or `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SyncState::Finished | SyncState::Aborted)
    }

    /// Task context, for inspection.
    pub fn context(&self) -> &SyncTaskContext {
        &self.ctx
    }

    /// Id of the timer currently armed; fire it via [`TaskEvent::Timeout`].
    pub fn current_timer(&self) -> u64 {
        self.timer_id
    }

    /// Queues an event for [`poll`](Self::poll).
    pub fn post(&self, event: TaskEvent) {
        // A closed channel means the machine is being dropped; nothing to do.
        let _ = self.tx.send(event);
    }

    /// Drains and processes all queued events.
    pub fn poll(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.step(event);
        }
    }

    fn arm_timer(&mut self) -> u64 {
        self.next_timer += 1;
        self.timer_id = self.next_timer;
        self.timer_id
    }

    /// Opens the task with the ability handshake.
    ///
    /// Handshake failures are never retried; an unreachable or
    /// incompatible peer aborts the task immediately.
    pub fn start(&mut self) {
        if self.state != SyncState::Idle {
            return;
        }
        match self.engine.ability_sync_start(&self.ctx) {
            Ok(()) => {
                self.state = SyncState::AbilitySync;
                self.arm_timer();
            }
            Err(err) => self.abort(&err),
        }
    }

    /// Applies one event.
    pub fn step(&mut self, event: TaskEvent) {
        if self.is_terminal() {
            return;
        }
        match event {
            TaskEvent::Cancel => self.abort(&SyncError::Cancelled),
            TaskEvent::Timeout(id) => {
                if id != self.timer_id {
                    debug!(stale = id, current = self.timer_id, "stale timer ignored");
                    return;
                }
                self.on_timeout();
            }
            TaskEvent::Remote(message) => self.on_remote(&message),
        }
    }

    fn on_timeout(&mut self) {
        match self.state {
            SyncState::AbilitySync => self.abort(&SyncError::Timeout),
            SyncState::DataSync => match self.engine.first_outstanding(&self.ctx.peer) {
                Some(sequence_id) => {
                    if self.ctx.bump_retry() > self.engine.config().retry.max_attempts {
                        self.abort(&SyncError::Timeout);
                        return;
                    }
                    match self.engine.resend_data(&self.ctx, sequence_id) {
                        Ok(()) => {
                            self.arm_timer();
                        }
                        Err(err) => self.handle_error(err),
                    }
                }
                None => self.abort(&SyncError::Timeout),
            },
            _ => {}
        }
    }

    fn on_remote(&mut self, message: &Message) {
        match (self.state, &message.packet) {
            (SyncState::AbilitySync, SyncPacket::AbilityAck(_)) => {
                if let Err(err) = self.engine.ability_ack_recv(&mut self.ctx, message) {
                    self.abort(&err);
                    return;
                }
                match self.engine.sync_start(&mut self.ctx) {
                    Ok(()) => {
                        self.state = SyncState::DataSync;
                        self.send_done = self.ctx.mode == SyncMode::Pull;
                        self.recv_done = self.ctx.mode == SyncMode::Push;
                        self.arm_timer();
                    }
                    Err(err) => self.handle_error(err),
                }
            }
            (SyncState::DataSync, SyncPacket::DataAck(_)) => {
                match self.engine.ack_recv(&mut self.ctx, message) {
                    Ok(AckOutcome::Finished) => {
                        self.send_done = true;
                        self.arm_timer();
                        self.maybe_finish();
                    }
                    Ok(AckOutcome::Progress) => {
                        self.arm_timer();
                    }
                    Ok(AckOutcome::Stale) => {}
                    Err(err) => self.handle_error(err),
                }
            }
            (SyncState::DataSync, SyncPacket::DataRequest(_)) => {
                // Response data for the pull half of this task.
                match self.engine.data_request_recv(&mut self.ctx, message) {
                    Ok(RecvOutcome::Applied { is_last }) => {
                        if is_last {
                            self.recv_done = true;
                        }
                        self.arm_timer();
                        self.maybe_finish();
                    }
                    Ok(_) => {
                        self.arm_timer();
                    }
                    Err(err) => self.handle_error(err),
                }
            }
            (SyncState::DataSync, SyncPacket::ControlAck(_)) => {
                if let Err(err) = self.engine.control_ack_recv(&self.ctx, message) {
                    self.handle_error(err);
                }
            }
            (state, packet) => {
                debug!(?state, packet_type = packet.type_code(), "packet ignored in this phase");
            }
        }
    }

    fn handle_error(&mut self, err: SyncError) {
        match err.outcome() {
            TaskOutcome::Ok => {}
            TaskOutcome::Abort => self.abort(&err),
            TaskOutcome::Retry => {
                if self.ctx.bump_retry() > self.engine.config().retry.max_attempts {
                    self.abort(&err);
                    return;
                }
                let result = match self.engine.first_outstanding(&self.ctx.peer) {
                    Some(sequence_id) => self.engine.resend_data(&self.ctx, sequence_id),
                    None => self.engine.sync_start(&mut self.ctx),
                };
                match result {
                    Ok(()) => {
                        self.arm_timer();
                    }
                    Err(next) => self.handle_error(next),
                }
            }
        }
    }

    fn maybe_finish(&mut self) {
        if self.send_done && self.recv_done {
            self.finish();
        }
    }

    fn finish(&mut self) {
        info!(peer = %self.ctx.peer, session = self.ctx.session_id, "sync task finished");
        self.state = SyncState::Finished;
        self.status = Some(SyncStatus::Ok);
        self.engine.clear_sync_status(&self.ctx.peer);
        self.ctx.clear();
    }

    fn abort(&mut self, err: &SyncError) {
        warn!(peer = %self.ctx.peer, session = self.ctx.session_id, %err, "sync task aborted");
        self.state = SyncState::Aborted;
        self.status = Some(SyncStatus::from(err));
        self.engine.clear_sync_status(&self.ctx.peer);
        self.ctx.clear();
    }
}

/// Per-peer task queues over one engine.
///
/// At most one task runs per peer; further targets queue behind it and
/// targets made redundant by a later entry are skipped. Inbound packets for
/// peers with no running task are answered passively.
pub struct SyncScheduler {
    engine: Arc<DataSyncEngine>,
    queues: Mutex<HashMap<DeviceId, VecDeque<SyncTarget>>>,
    machines: Mutex<HashMap<DeviceId, SyncStateMachine>>,
    responders: Mutex<HashMap<DeviceId, SyncTaskContext>>,
    results: Mutex<HashMap<DeviceId, SyncStatus>>,
    next_session: AtomicU32,
}

impl SyncScheduler {
    /// Builds a scheduler over an engine.
    pub fn new(engine: Arc<DataSyncEngine>) -> Self {
        Self {
            engine,
            queues: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            next_session: AtomicU32::new(0),
        }
    }

    /// Queues a target and starts it if the peer is idle.
    pub fn queue_target(&self, target: SyncTarget) {
        let peer = target.peer.clone();
        self.queues
            .lock()
            .entry(peer.clone())
            .or_default()
            .push_back(target);
        self.exec_next_task(&peer);
    }

    /// Starts the next queued target for a peer. Returns true when a task
    /// entered a live phase.
    pub fn exec_next_task(&self, peer: &str) -> bool {
        loop {
            let mut machines = self.machines.lock();
            if machines.contains_key(peer) {
                return false;
            }
            let target = {
                let mut queues = self.queues.lock();
                queues.get_mut(peer).and_then(next_runnable)
            };
            let Some(target) = target else {
                return false;
            };
            let session_id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
            let ctx = SyncTaskContext::new(target.peer.clone(), target.mode, session_id)
                .with_query(target.query_id.clone());
            let mut machine = SyncStateMachine::new(self.engine.clone(), ctx);
            machine.start();
            if machine.is_terminal() {
                self.results
                    .lock()
                    .insert(peer.to_string(), machine.status().unwrap_or(SyncStatus::Error));
                drop(machines);
                continue;
            }
            machines.insert(peer.to_string(), machine);
            return true;
        }
    }

    /// Routes an inbound packet: to the running task if one exists, else to
    /// the passive responder path.
    pub fn handle_remote(&self, from: &str, message: Message) {
        {
            let machines = self.machines.lock();
            if machines.contains_key(from) {
                drop(machines);
                self.step_machine(from, TaskEvent::Remote(message));
                return;
            }
        }
        let mut ctx = self
            .responders
            .lock()
            .remove(from)
            .unwrap_or_else(|| SyncTaskContext::new(from, SyncMode::Push, message.session_id));
        let result = match &message.packet {
            SyncPacket::AbilityRequest(_) => {
                ctx.session_id = message.session_id;
                self.engine.ability_request_recv(&ctx, &message).map(|_| ())
            }
            SyncPacket::DataRequest(_) => self
                .engine
                .data_request_recv(&mut ctx, &message)
                .map(|_| ()),
            SyncPacket::DataAck(_) => self.engine.ack_recv(&mut ctx, &message).map(|_| ()),
            SyncPacket::ControlRequest(_) => self
                .engine
                .control_request_recv(&ctx, &message)
                .map(|_| ()),
            SyncPacket::ControlAck(_) => self.engine.control_ack_recv(&ctx, &message),
            SyncPacket::AbilityAck(_) => Ok(()), // no task waiting for it
        };
        if let Err(err) = result {
            warn!(peer = %from, %err, "inbound packet rejected");
        }
        self.responders.lock().insert(from.to_string(), ctx);
    }

    /// Fires a timer against the running task, if the id is still current.
    pub fn fire_timeout(&self, peer: &str, timer_id: u64) {
        self.step_machine(peer, TaskEvent::Timeout(timer_id));
    }

    /// Cancels the running task for a peer.
    pub fn cancel(&self, peer: &str) {
        self.step_machine(peer, TaskEvent::Cancel);
    }

    fn step_machine(&self, peer: &str, event: TaskEvent) {
        let mut machines = self.machines.lock();
        let Some(machine) = machines.get_mut(peer) else {
            return;
        };
        machine.post(event);
        machine.poll();
        if machine.is_terminal() {
            let status = machine.status().unwrap_or(SyncStatus::Error);
            machines.remove(peer);
            self.results.lock().insert(peer.to_string(), status);
            drop(machines);
            self.exec_next_task(peer);
        }
    }

    /// Phase of the running task, if any.
    pub fn active_state(&self, peer: &str) -> Option<SyncState> {
        self.machines.lock().get(peer).map(|m| m.state())
    }

    /// Timer id armed by the running task, if any.
    pub fn current_timer(&self, peer: &str) -> Option<u64> {
        self.machines.lock().get(peer).map(|m| m.current_timer())
    }

    /// Last terminal status recorded for a peer.
    pub fn sync_status(&self, peer: &str) -> Option<SyncStatus> {
        self.results.lock().get(peer).copied()
    }

    /// Targets still waiting behind the running task.
    pub fn queued_len(&self, peer: &str) -> usize {
        self.queues.lock().get(peer).map(|q| q.len()).unwrap_or(0)
    }
}
