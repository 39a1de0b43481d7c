//! Tor streams
//!
//! A [`TorStream`] is one TCP connection tunnelled through the exit hop of
//! a circuit. Its state lives in the circuit's stream table; the handle
//! only carries the circuit and the stream ID. Reads and writes block the
//! calling thread, bounded by the stream timeout, and honor both the
//! stream (500/+50) and circuit (1000/+100) SENDME windows.
//!
//! A stream can also be handed to a reactor as a [`Source`]: inbound data
//! and the remote close are then delivered to the registered callback.

use super::cell::{RelayCell, RelayCommand};
use super::circuit::CircuitCore;
use crate::error::{Result, TorError};
use crate::reactor::{Readable, Source, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// END reason: no more specific reason
pub const END_REASON_MISC: u8 = 1;

/// END reason: the stream finished normally
pub const END_REASON_DONE: u8 = 6;

/// Name of a RELAY_END reason code
pub fn end_reason_name(reason: u8) -> &'static str {
    match reason {
        1 => "MISC",
        2 => "RESOLVEFAILED",
        3 => "CONNECTREFUSED",
        4 => "EXITPOLICY",
        5 => "DESTROY",
        6 => "DONE",
        7 => "TIMEOUT",
        8 => "NOROUTE",
        9 => "HIBERNATING",
        10 => "INTERNAL",
        11 => "RESOURCELIMIT",
        12 => "CONNRESET",
        13 => "TORPROTOCOL",
        14 => "NOTDIRECTORY",
        _ => "UNKNOWN",
    }
}

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// BEGIN sent, waiting for CONNECTED
    Connecting,
    Open,
    /// We sent END; inbound data is discarded
    HalfClosedLocal,
    /// The exit sent END; buffered data can still be read
    HalfClosedRemote,
    Closed,
}

/// A stream through a circuit. Dropping it closes the stream.
pub struct TorStream {
    circuit: Arc<CircuitCore>,
    id: u16,
    target: String,
    timeout: Duration,
}

impl TorStream {
    /// Send BEGIN for `host:port` to the exit and wait for CONNECTED
    pub(crate) fn open(circuit: &Arc<CircuitCore>, host: &str, port: u16) -> Result<Self> {
        let ctx = circuit.context().clone();
        let config = ctx.config();
        let target = format!("{}:{}", host, port);

        let mut inner = circuit.lock();
        inner.ensure_open()?;
        let exit = inner.exit_hop()?;
        let id = inner.streams.open(&target)?;

        let mut begin = target.clone().into_bytes();
        begin.push(0);
        if let Err(e) = circuit.send_relay(&mut inner, exit, RelayCell::new(RelayCommand::Begin, id, begin), false) {
            inner.streams.fail(id, &e.to_string());
            return Err(e);
        }
        log::debug!(target: ctx.log_target(), "Stream {}: BEGIN {}", id, target);

        let (mut inner, timed_out) = circuit.wait_while(inner, config.stream_connect_timeout(), |i| {
            matches!(i.streams.get(id).map(|s| s.state), Some(StreamState::Connecting))
        });

        let state = inner.streams.get(id).map(|s| (s.state, s.end_reason));
        match state {
            Some((StreamState::Open, _)) => {
                drop(inner);
                log::info!(target: ctx.log_target(), "Stream {} connected to {}", id, target);
                Ok(Self {
                    circuit: circuit.clone(),
                    id,
                    target,
                    timeout: config.stream_timeout(),
                })
            }
            Some((StreamState::Connecting, _)) if timed_out => {
                let end = RelayCell::new(RelayCommand::End, id, vec![END_REASON_MISC]);
                let _ = circuit.send_relay(&mut inner, exit, end, false);
                inner.streams.fail(id, "connect timed out");
                Err(TorError::timeout(format!("stream connect to {}", target)))
            }
            Some((_, reason)) => {
                let reason = reason.unwrap_or(END_REASON_MISC);
                inner.streams.fail(id, end_reason_name(reason));
                Err(TorError::StreamClosed(format!(
                    "{} refused by exit: {} ({})",
                    target,
                    end_reason_name(reason),
                    reason
                )))
            }
            None => Err(inner.closed_error()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit.id()
    }

    /// Current state; `Closed` once the stream has left the circuit
    pub fn state(&self) -> StreamState {
        self.circuit
            .lock()
            .streams
            .get(self.id)
            .map(|s| s.state)
            .unwrap_or(StreamState::Closed)
    }

    /// Timeout for blocking `send` and `recv`
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send all of `data`, split into DATA cells of at most 498 bytes
    pub fn send(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            let inner = self.circuit.lock();
            let (mut inner, timed_out) = self.circuit.wait_while(inner, self.timeout, |i| {
                if i.is_closed() {
                    return false;
                }
                match i.streams.get(self.id) {
                    Some(s) if s.state == StreamState::Open => {
                        !(s.flow.can_send() && i.flow.can_send())
                    }
                    _ => false,
                }
            });
            inner.ensure_open()?;
            let exit = inner.exit_hop()?;

            let stream = inner.streams.get_mut(self.id).ok_or_else(|| {
                TorError::StreamClosed(format!("stream {} is gone", self.id))
            })?;
            if stream.state != StreamState::Open {
                return Err(TorError::StreamClosed(format!(
                    "stream {} is {:?}",
                    self.id, stream.state
                )));
            }
            if timed_out && !stream.flow.can_send() {
                return Err(TorError::timeout("stream send window"));
            }
            if timed_out && !inner.flow.can_send() {
                return Err(TorError::timeout("circuit send window"));
            }

            if let Some(stream) = inner.streams.get_mut(self.id) {
                stream.flow.on_send()?;
            }
            inner.flow.on_send()?;
            let cell = RelayCell::new(RelayCommand::Data, self.id, chunk.to_vec());
            self.circuit.send_relay(&mut inner, exit, cell, false)?;
            inner.streams.record_sent(self.id, chunk.len());
        }
        Ok(())
    }

    /// Up to `max` buffered bytes, blocking until some arrive.
    ///
    /// An empty result means the exit closed the stream and the buffer is
    /// drained, so `max` must be at least 1.
    pub fn recv(&self, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Err(TorError::Stream("recv needs room for at least one byte".into()));
        }
        let inner = self.circuit.lock();
        let (mut inner, timed_out) = self.circuit.wait_while(inner, self.timeout, |i| {
            i.streams
                .get(self.id)
                .map_or(false, |s| s.recv_buf.is_empty() && s.remote_open())
        });

        if inner.is_closed() && inner.streams.get(self.id).is_none() {
            return Err(inner.closed_error());
        }
        let stream = inner.streams.get_mut(self.id).ok_or_else(|| {
            TorError::StreamClosed(format!("stream {} is closed", self.id))
        })?;

        if !stream.recv_buf.is_empty() {
            let n = max.min(stream.recv_buf.len());
            return Ok(stream.recv_buf.drain(..n).collect());
        }
        if !stream.remote_open() {
            return Ok(Vec::new());
        }
        if timed_out {
            return Err(TorError::timeout(format!("recv on stream {}", self.id)));
        }
        Ok(Vec::new())
    }

    /// Send END (DONE). Buffered inbound data stays readable only if the
    /// exit had already closed its side.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.circuit.lock();
        let Some(state) = inner.streams.get(self.id).map(|s| s.state) else {
            return Ok(());
        };
        match state {
            StreamState::Open | StreamState::Connecting => {
                if let Some(stream) = inner.streams.get_mut(self.id) {
                    stream.state = StreamState::HalfClosedLocal;
                    stream.wake();
                }
                if !inner.is_closed() {
                    let exit = inner.exit_hop()?;
                    let end = RelayCell::new(RelayCommand::End, self.id, vec![END_REASON_DONE]);
                    self.circuit.send_relay(&mut inner, exit, end, false)?;
                }
                log::debug!(
                    target: self.circuit.context().log_target(),
                    "Stream {} closed locally",
                    self.id
                );
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                if let Some(stream) = inner.streams.remove(self.id) {
                    stream.wake();
                }
            }
            StreamState::HalfClosedLocal => {}
        }
        drop(inner);
        self.circuit.notify();
        Ok(())
    }

    /// A non-owning reactor source for this stream
    pub fn source(&self) -> StreamSource {
        StreamSource {
            circuit: self.circuit.clone(),
            id: self.id,
        }
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        let open = self.state() == StreamState::Open;
        if open {
            if let Err(e) = self.close() {
                log::debug!(
                    target: self.circuit.context().log_target(),
                    "END for stream {} not sent: {}",
                    self.id,
                    e
                );
            }
        }
        self.circuit.lock().streams.remove(self.id);
        self.circuit.notify();
    }
}

impl std::fmt::Debug for TorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorStream")
            .field("id", &self.id)
            .field("circuit", &format_args!("{:#010x}", self.circuit.id()))
            .field("target", &self.target)
            .finish()
    }
}

impl io::Read for TorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = self.recv(buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for TorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reactor view of a stream that does not own it
pub struct StreamSource {
    circuit: Arc<CircuitCore>,
    id: u16,
}

fn attach_stream(circuit: &CircuitCore, id: u16, waker: Waker) -> Result<()> {
    let mut inner = circuit.lock();
    match inner.streams.get_mut(id) {
        Some(stream) => {
            stream.waker = Some(waker);
            Ok(())
        }
        None => Err(TorError::StreamClosed(format!("stream {} is closed", id))),
    }
}

fn drain_stream(circuit: &CircuitCore, id: u16) -> Readable {
    let mut inner = circuit.lock();
    let Some(stream) = inner.streams.get_mut(id) else {
        return Readable::Closed;
    };
    if !stream.recv_buf.is_empty() {
        let data: Vec<u8> = stream.recv_buf.drain(..).collect();
        // The close is reported on the next turn
        if !stream.remote_open() {
            stream.wake();
        }
        drop(inner);
        circuit.notify();
        return Readable::Data(data);
    }
    if stream.remote_open() {
        Readable::Pending
    } else {
        Readable::Closed
    }
}

fn detach_stream(circuit: &CircuitCore, id: u16) {
    if let Some(stream) = circuit.lock().streams.get_mut(id) {
        stream.waker = None;
    }
}

impl Source for StreamSource {
    fn attach(&mut self, waker: Waker) -> Result<()> {
        attach_stream(&self.circuit, self.id, waker)
    }

    fn drain(&mut self) -> Readable {
        drain_stream(&self.circuit, self.id)
    }

    fn detach(&mut self) {
        detach_stream(&self.circuit, self.id);
    }
}

impl Source for TorStream {
    fn attach(&mut self, waker: Waker) -> Result<()> {
        attach_stream(&self.circuit, self.id, waker)
    }

    fn drain(&mut self) -> Readable {
        drain_stream(&self.circuit, self.id)
    }

    fn detach(&mut self) {
        detach_stream(&self.circuit, self.id);
    }
}
