//! Circuits
//!
//! A circuit is shared between the application (through [`Circuit`] and
//! [`TorStream`] handles) and the channel reader thread, which feeds it
//! inbound cells. All mutable circuit state, including the stream table,
//! lives in one `CircuitInner` behind the circuit mutex. Outbound cells are
//! encrypted and written while that mutex is held, so the order in which
//! the cipher streams advance matches the order on the wire.
//!
//! Handshake replies (CREATED2, EXTENDED2, TRUNCATED) are queued for the
//! circuit builder; stream traffic is routed into the stream table.

use super::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use super::crypto::{CircuitKeys, OnionCrypto};
use super::flow_control::CircuitFlowControl;
use super::relay::Relay;
use super::stream::{StreamState, TorStream};
use crate::channel::Channel;
use crate::context::TorContext;
use crate::error::{destroy_reason_name, Result, TorError};
use crate::stream_mux::{StreamMultiplexer, StreamMuxStats};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// DESTROY reason sent by clients for ordinary teardown
pub const DESTROY_REASON_NONE: u8 = 0;

/// DESTROY reason for protocol violations
pub const DESTROY_REASON_PROTOCOL: u8 = 1;

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// ID allocated, no hop yet
    Created,
    /// At least one hop, still growing
    Extending,
    Ready,
    Destroying,
    Closed,
}

/// Handshake-level messages waiting for the builder
#[derive(Debug)]
pub(crate) enum ControlMessage {
    Created2(Vec<u8>),
    Relay { hop: usize, cell: RelayCell },
}

pub(crate) struct CircuitInner {
    pub(crate) state: CircuitState,
    pub(crate) hops: Vec<Relay>,
    crypto: OnionCrypto,
    pub(crate) flow: CircuitFlowControl,
    control: VecDeque<ControlMessage>,
    pub(crate) streams: StreamMultiplexer,
    closed_reason: Option<TorError>,
}

impl CircuitInner {
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, CircuitState::Destroying | CircuitState::Closed)
    }

    /// The error every operation on a closed circuit reports
    pub(crate) fn closed_error(&self) -> TorError {
        self.closed_reason
            .clone()
            .unwrap_or_else(|| TorError::CircuitClosed("circuit is closed".into()))
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// Index of the last hop, where streams exit
    pub(crate) fn exit_hop(&self) -> Result<usize> {
        self.hops
            .len()
            .checked_sub(1)
            .ok_or_else(|| TorError::InvalidState("circuit has no hops".into()))
    }
}

/// Shared circuit state
pub struct CircuitCore {
    id: u32,
    channel: Arc<Channel>,
    ctx: TorContext,
    inner: Mutex<CircuitInner>,
    changed: Condvar,
}

impl CircuitCore {
    pub(crate) fn new(id: u32, channel: Arc<Channel>, ctx: TorContext) -> Arc<Self> {
        let max_streams = ctx.config().max_streams_per_circuit;
        Arc::new(Self {
            id,
            channel,
            ctx,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Created,
                hops: Vec::new(),
                crypto: OnionCrypto::new(),
                flow: CircuitFlowControl::new(),
                control: VecDeque::new(),
                streams: StreamMultiplexer::new(max_streams),
                closed_reason: None,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn context(&self) -> &TorContext {
        &self.ctx
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while `blocked` holds, at most `timeout`. The flag is true when
    /// the wait ended on the timeout.
    pub(crate) fn wait_while<'a, F>(
        &self,
        guard: MutexGuard<'a, CircuitInner>,
        timeout: Duration,
        blocked: F,
    ) -> (MutexGuard<'a, CircuitInner>, bool)
    where
        F: FnMut(&mut CircuitInner) -> bool,
    {
        let (guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, blocked)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    pub(crate) fn set_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        if !inner.is_closed() {
            inner.state = state;
        }
    }

    /// CREATE2 carrying an ntor onionskin: HTYPE (2) | HLEN (2) | HDATA
    pub(crate) fn send_create2(&self, handshake_type: u16, handshake: &[u8]) -> Result<()> {
        let inner = self.lock();
        inner.ensure_open()?;
        let mut payload = Vec::with_capacity(4 + handshake.len());
        payload.extend_from_slice(&handshake_type.to_be_bytes());
        payload.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        payload.extend_from_slice(handshake);
        self.channel
            .send_cell(&Cell::new(self.id, CellCommand::Create2, payload))
    }

    /// Wait for the next handshake-level message
    pub(crate) fn wait_control(&self, timeout: Duration, what: &str) -> Result<ControlMessage> {
        let inner = self.lock();
        let (mut inner, _) = self.wait_while(inner, timeout, |i| {
            i.control.is_empty() && !i.is_closed()
        });
        if let Some(msg) = inner.control.pop_front() {
            return Ok(msg);
        }
        if inner.is_closed() {
            return Err(inner.closed_error());
        }
        Err(TorError::timeout(what))
    }

    /// Append a hop after a successful handshake
    pub(crate) fn add_hop(&self, relay: Relay, keys: &CircuitKeys) {
        let mut inner = self.lock();
        inner.crypto.add_hop(keys);
        inner.hops.push(relay);
        if inner.state == CircuitState::Created {
            inner.state = CircuitState::Extending;
        }
    }

    /// Encrypt `cell` for `hop` and write it. Callers hold the circuit lock.
    pub(crate) fn send_relay(
        &self,
        inner: &mut CircuitInner,
        hop: usize,
        cell: RelayCell,
        early: bool,
    ) -> Result<()> {
        let mut payload = cell.to_bytes()?;
        inner.crypto.encrypt_forward(&mut payload, hop)?;
        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        log::trace!(
            target: self.ctx.log_target(),
            "circuit {:#010x}: {:?} on stream {} to hop {}",
            self.id,
            cell.command,
            cell.stream_id,
            hop + 1
        );
        self.channel
            .send_cell(&Cell::new(self.id, command, payload))
    }

    /// Send a circuit-level relay cell (stream 0)
    pub(crate) fn send_control(&self, hop: usize, cell: RelayCell, early: bool) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        self.send_relay(&mut inner, hop, cell, early)
    }

    /// Tear the circuit down from our side: DESTROY, close every stream,
    /// release the circuit ID. Idempotent.
    pub fn destroy(&self, reason: u8) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        inner.state = CircuitState::Destroying;
        if let Err(e) = self.channel.send_cell(&Cell::destroy(self.id, reason)) {
            log::debug!(
                target: self.ctx.log_target(),
                "DESTROY for circuit {:#010x} not sent: {}",
                self.id,
                e
            );
        }
        self.close_locked(&mut inner, TorError::CircuitClosed("closed locally".into()));
        drop(inner);
        self.notify();
        log::debug!(target: self.ctx.log_target(), "Circuit {:#010x} destroyed", self.id);
    }

    /// Inbound cell from the channel reader
    pub(crate) fn handle_cell(&self, cell: Cell) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }

        match cell.command {
            CellCommand::Created2 => inner.control.push_back(ControlMessage::Created2(cell.payload)),
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(DESTROY_REASON_NONE);
                log::info!(
                    target: self.ctx.log_target(),
                    "Circuit {:#010x} destroyed by relay ({})",
                    self.id,
                    destroy_reason_name(reason)
                );
                self.close_locked(&mut inner, TorError::circuit_destroyed(reason));
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                let mut payload = cell.payload;
                if let Err(e) = self.handle_relay(&mut inner, &mut payload) {
                    log::warn!(
                        target: self.ctx.log_target(),
                        "Circuit {:#010x}: {}; tearing down",
                        self.id,
                        e
                    );
                    let _ = self
                        .channel
                        .send_cell(&Cell::destroy(self.id, DESTROY_REASON_PROTOCOL));
                    self.close_locked(&mut inner, e);
                }
            }
            _ => {}
        }

        drop(inner);
        self.notify();
    }

    /// The channel under this circuit went away
    pub(crate) fn on_channel_closed(&self, reason: &TorError) {
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        self.close_locked(
            &mut inner,
            TorError::CircuitClosed(format!("channel closed: {}", reason)),
        );
        drop(inner);
        self.notify();
    }

    fn close_locked(&self, inner: &mut CircuitInner, reason: TorError) {
        inner.state = CircuitState::Closed;
        inner.closed_reason = Some(reason);
        inner.control.clear();
        inner.streams.close_all();
        self.channel.remove_circuit(self.id);
    }

    fn handle_relay(&self, inner: &mut CircuitInner, payload: &mut [u8]) -> Result<()> {
        let hop = inner.crypto.decrypt_backward(payload)?;
        let cell = RelayCell::from_bytes(payload)?;
        log::trace!(
            target: self.ctx.log_target(),
            "circuit {:#010x}: {:?} on stream {} from hop {}",
            self.id,
            cell.command,
            cell.stream_id,
            hop + 1
        );

        if cell.stream_id == 0 {
            match cell.command {
                RelayCommand::Sendme => inner.flow.on_sendme_received()?,
                RelayCommand::Drop => {}
                RelayCommand::Data
                | RelayCommand::Begin
                | RelayCommand::End
                | RelayCommand::Connected => {
                    return Err(TorError::ProtocolError(format!(
                        "{:?} without a stream",
                        cell.command
                    )))
                }
                RelayCommand::Truncated if inner.state == CircuitState::Ready => {
                    let reason = cell.data.first().copied().unwrap_or(DESTROY_REASON_NONE);
                    log::warn!(
                        target: self.ctx.log_target(),
                        "Circuit {:#010x} truncated at hop {} ({}); closing",
                        self.id,
                        hop + 1,
                        destroy_reason_name(reason)
                    );
                    // The remaining hops carry nothing once the exit is gone
                    inner.state = CircuitState::Destroying;
                    let _ = self
                        .channel
                        .send_cell(&Cell::destroy(self.id, DESTROY_REASON_NONE));
                    self.close_locked(inner, TorError::circuit_destroyed(reason));
                }
                other if inner.state == CircuitState::Ready => log::debug!(
                    target: self.ctx.log_target(),
                    "Circuit {:#010x}: dropping unexpected {:?} from hop {}",
                    self.id,
                    other,
                    hop + 1
                ),
                _ => inner.control.push_back(ControlMessage::Relay { hop, cell }),
            }
            return Ok(());
        }

        let stream_id = cell.stream_id;
        match cell.command {
            RelayCommand::Data => {
                if inner.flow.on_receive()? {
                    let digest = inner.crypto.last_received_digest(hop).ok_or_else(|| {
                        TorError::InvalidState(format!("no digest for hop {}", hop))
                    })?;
                    let sendme = RelayCell::new(RelayCommand::Sendme, 0, sendme_v1_payload(&digest));
                    self.send_relay(inner, hop, sendme, false)?;
                }
                if inner.streams.route_data(stream_id, &cell.data)? {
                    let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new());
                    self.send_relay(inner, hop, sendme, false)?;
                }
            }
            RelayCommand::Connected => {
                if let Some(stream) = inner.streams.get_mut(stream_id) {
                    if stream.state == StreamState::Connecting {
                        stream.state = StreamState::Open;
                        stream.wake();
                    }
                }
            }
            RelayCommand::End => {
                let reason = cell.data.first().copied().unwrap_or(super::stream::END_REASON_MISC);
                if let Some(stream) = inner.streams.get_mut(stream_id) {
                    stream.end_reason = Some(reason);
                    stream.state = match stream.state {
                        StreamState::Open => StreamState::HalfClosedRemote,
                        _ => StreamState::Closed,
                    };
                    stream.wake();
                    log::debug!(
                        target: self.ctx.log_target(),
                        "Stream {} ended by exit ({})",
                        stream_id,
                        super::stream::end_reason_name(reason)
                    );
                }
            }
            RelayCommand::Sendme => {
                if let Some(stream) = inner.streams.get_mut(stream_id) {
                    stream.flow.on_sendme_received()?;
                }
            }
            other => log::debug!(
                target: self.ctx.log_target(),
                "Ignoring {:?} on stream {}",
                other,
                stream_id
            ),
        }
        Ok(())
    }
}

/// Authenticated SENDME: VERSION (1) | DATA_LEN (2) | DIGEST (20)
fn sendme_v1_payload(digest: &[u8; 20]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + digest.len());
    payload.push(1);
    payload.extend_from_slice(&(digest.len() as u16).to_be_bytes());
    payload.extend_from_slice(digest);
    payload
}

/// An established circuit. Dropping it destroys the circuit.
pub struct Circuit {
    core: Arc<CircuitCore>,
}

impl Circuit {
    pub(crate) fn new(core: Arc<CircuitCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn hops(&self) -> Vec<Relay> {
        self.core.lock().hops.clone()
    }

    pub fn hop_count(&self) -> usize {
        self.core.lock().hops.len()
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    pub fn is_open(&self) -> bool {
        !self.core.lock().is_closed()
    }

    /// First hop (the channel's guard)
    pub fn guard_relay(&self) -> &Relay {
        self.core.channel().guard()
    }

    pub fn exit_relay(&self) -> Option<Relay> {
        self.core.lock().hops.last().cloned()
    }

    /// Open a stream to `(host, port)` through the last hop
    pub fn create_stream(&self, (host, port): (&str, u16)) -> Result<TorStream> {
        TorStream::open(&self.core, host, port)
    }

    pub fn stream_stats(&self) -> StreamMuxStats {
        self.core.lock().streams.stats()
    }

    /// Circuit-level (send, receive) windows
    pub fn windows(&self) -> (u16, u16) {
        let inner = self.core.lock();
        (inner.flow.send_window(), inner.flow.recv_window())
    }

    pub fn close(&self) {
        self.core.destroy(DESTROY_REASON_NONE);
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#010x}", self.core.id()))
            .field("state", &inner.state)
            .field(
                "hops",
                &inner.hops.iter().map(|h| h.nickname.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
