//! Guard connection (channel)
//!
//! One link to a guard relay shared by every circuit whose first hop is
//! that guard. [`Channel::connect`] runs the link handshake:
//!
//! ```text
//! -> VERSIONS [4, 5]            (2-byte circuit IDs)
//! <- VERSIONS                    negotiate highest common version >= 4
//! <- CERTS, AUTH_CHALLENGE       (PADDING / VPADDING skipped)
//! <- NETINFO
//! -> NETINFO
//! ```
//!
//! Afterwards a single reader thread owns the decoder and demultiplexes
//! cells to circuits by circuit ID. Writers share the link through a mutex.
//! A malformed cell or a link error closes the channel and every circuit
//! on it.

use crate::context::TorContext;
use crate::error::{Result, TorError};
use crate::network::{Connector, Link, LinkControl};
use crate::protocol::certs::{CertsCell, VerifiedRelay};
use crate::protocol::circuit::CircuitCore;
use crate::protocol::{Cell, CellCodec, CellCommand, Relay};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

/// Read size of the channel reader
const READ_CHUNK: usize = 16 * 1024;

/// Initiator circuit IDs have the high bit set (link protocol 4+)
const CIRC_ID_INITIATOR_BIT: u32 = 0x8000_0000;

struct LinkWriter {
    sink: Box<dyn Write + Send>,
    codec: CellCodec,
}

/// A guard connection
pub struct Channel {
    ctx: TorContext,
    guard: Relay,
    link_version: u16,
    peer: VerifiedRelay,
    writer: Mutex<LinkWriter>,
    circuits: Mutex<HashMap<u32, Weak<CircuitCore>>>,
    control: LinkControl,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Connect to `guard` and complete the link handshake
    pub fn connect(ctx: &TorContext, guard: &Relay, connector: &dyn Connector) -> Result<Arc<Self>> {
        let config = ctx.config();
        log::info!(target: ctx.log_target(), "Connecting to guard {}", guard);

        let Link {
            mut reader,
            mut writer,
            control,
        } = connector.connect(guard, config.connect_timeout())?;

        control.set_read_timeout(Some(config.link_handshake_timeout()))?;
        let handshake = link_handshake(ctx, &control, &mut reader, &mut writer);
        let (codec, link_version, peer) = match handshake {
            Ok(done) => done,
            Err(e) => {
                control.shutdown();
                return Err(e);
            }
        };
        control.set_read_timeout(None)?;

        let channel = Arc::new(Self {
            ctx: ctx.clone(),
            guard: guard.clone(),
            link_version,
            peer,
            writer: Mutex::new(LinkWriter {
                sink: writer,
                codec: CellCodec::with_link_version(link_version),
            }),
            circuits: Mutex::new(HashMap::new()),
            control,
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let reader_channel = channel.clone();
        let handle = thread::Builder::new()
            .name(format!("tor-channel-{}", guard.nickname))
            .spawn(move || reader_channel.read_loop(reader, codec))
            .map_err(|e| TorError::Internal(format!("spawn channel reader: {}", e)))?;
        *channel.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        log::info!(
            target: ctx.log_target(),
            "Channel to {} open (link protocol v{})",
            guard,
            link_version
        );
        Ok(channel)
    }

    pub fn guard(&self) -> &Relay {
        &self.guard
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    /// Ed25519 keys proven by the guard's CERTS cell
    pub fn peer(&self) -> &VerifiedRelay {
        &self.peer
    }

    pub fn context(&self) -> &TorContext {
        &self.ctx
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits().len()
    }

    /// Allocate a fresh circuit ID and register a circuit under it
    pub(crate) fn allocate_circuit(self: &Arc<Self>) -> Result<Arc<CircuitCore>> {
        if !self.is_open() {
            return Err(TorError::CircuitClosed("channel is closed".into()));
        }

        let mut circuits = self.circuits();
        let id = loop {
            let candidate = rand::random::<u32>() | CIRC_ID_INITIATOR_BIT;
            if !circuits.contains_key(&candidate) {
                break candidate;
            }
        };
        let core = CircuitCore::new(id, self.clone(), self.ctx.clone());
        circuits.insert(id, Arc::downgrade(&core));
        log::debug!(target: self.ctx.log_target(), "Allocated circuit {:#010x}", id);
        Ok(core)
    }

    /// Release a circuit ID; later cells for it are dropped
    pub(crate) fn remove_circuit(&self, id: u32) {
        self.circuits().remove(&id);
    }

    /// Encode and write one cell
    pub fn send_cell(&self, cell: &Cell) -> Result<()> {
        if !self.is_open() {
            return Err(TorError::CircuitClosed("channel is closed".into()));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = writer.codec.encode(cell)?;
        writer.sink.write_all(&bytes)?;
        writer.sink.flush()?;
        log::trace!(
            target: self.ctx.log_target(),
            "-> {:?} on circuit {:#010x}",
            cell.command,
            cell.circuit_id
        );
        Ok(())
    }

    /// Close the link; every circuit on it is closed
    pub fn shutdown(&self) {
        self.teardown(TorError::CircuitClosed("channel shut down".into()));
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<u32, Weak<CircuitCore>>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_loop(self: Arc<Self>, mut reader: Box<dyn Read + Send>, mut codec: CellCodec) {
        let mut buf = vec![0u8; READ_CHUNK];
        let reason = loop {
            match codec.decode() {
                Ok(Some(cell)) => {
                    self.dispatch(cell);
                    continue;
                }
                Ok(None) => {}
                Err(e) => break e,
            }
            if !self.is_open() {
                break TorError::CircuitClosed("channel shut down".into());
            }
            match reader.read(&mut buf) {
                Ok(0) => break TorError::ConnectionFailed("guard closed the link".into()),
                Ok(n) => codec.feed(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break e.into(),
            }
        };

        if self.is_open() {
            log::warn!(
                target: self.ctx.log_target(),
                "Channel to {} failed: {}",
                self.guard,
                reason
            );
        }
        self.teardown(reason);
    }

    fn dispatch(&self, cell: Cell) {
        match cell.command {
            CellCommand::Relay
            | CellCommand::RelayEarly
            | CellCommand::Destroy
            | CellCommand::Created2 => {
                let circuit = self
                    .circuits()
                    .get(&cell.circuit_id)
                    .and_then(Weak::upgrade);
                match circuit {
                    Some(circuit) => circuit.handle_cell(cell),
                    None => log::debug!(
                        target: self.ctx.log_target(),
                        "{:?} for unknown circuit {:#010x}, dropped",
                        cell.command,
                        cell.circuit_id
                    ),
                }
            }
            CellCommand::Padding | CellCommand::Vpadding => {}
            other => log::debug!(
                target: self.ctx.log_target(),
                "Ignoring {:?} on an open channel",
                other
            ),
        }
    }

    fn teardown(&self, reason: TorError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.control.shutdown();

        let circuits: Vec<Arc<CircuitCore>> = self
            .circuits()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for circuit in circuits {
            circuit.on_channel_closed(&reason);
        }
        log::debug!(
            target: self.ctx.log_target(),
            "Channel to {} closed: {}",
            self.guard,
            reason
        );
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("guard", &self.guard.nickname)
            .field("link_version", &self.link_version)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Run VERSIONS .. NETINFO. Returns the decoder (it may already hold the
/// first cells after NETINFO), the link version and the verified peer keys.
fn link_handshake(
    ctx: &TorContext,
    control: &LinkControl,
    reader: &mut Box<dyn Read + Send>,
    writer: &mut Box<dyn Write + Send>,
) -> Result<(CellCodec, u16, VerifiedRelay)> {
    let config = ctx.config();
    let mut codec = CellCodec::new();

    let ours = &config.link_versions;
    let payload: Vec<u8> = ours.iter().flat_map(|v| v.to_be_bytes()).collect();
    writer.write_all(&codec.encode(&Cell::new(0, CellCommand::Versions, payload))?)?;
    writer.flush()?;

    let versions = read_cell(reader, &mut codec)?;
    if versions.command != CellCommand::Versions {
        return Err(TorError::UnexpectedCell {
            expected: "VERSIONS".into(),
            got: format!("{:?}", versions.command),
        });
    }
    let version = negotiate_version(ours, &parse_versions(&versions.payload)?)?;
    codec.set_link_version(version);
    log::debug!(target: ctx.log_target(), "Negotiated link protocol v{}", version);

    let mut certs: Option<CertsCell> = None;
    let netinfo = loop {
        let cell = read_cell(reader, &mut codec)?;
        match cell.command {
            CellCommand::Certs => certs = Some(CertsCell::parse(&cell.payload)?),
            CellCommand::AuthChallenge => {
                // We never authenticate as a relay
                log::trace!(target: ctx.log_target(), "AUTH_CHALLENGE ignored");
            }
            CellCommand::Padding | CellCommand::Vpadding => {}
            CellCommand::Netinfo => break cell,
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "CERTS, AUTH_CHALLENGE or NETINFO".into(),
                    got: format!("{:?}", other),
                })
            }
        }
    };

    let certs = certs.ok_or_else(|| {
        TorError::CertificateError("guard sent NETINFO without CERTS".into())
    })?;
    let peer = certs.verify(unix_now())?;

    let our_address = parse_netinfo_other_address(&netinfo.payload);
    let their_address = control.peer_addr().map(|a| a.ip());
    let reply = build_netinfo(unix_now() as u32, their_address, our_address);
    writer.write_all(&codec.encode(&Cell::new(0, CellCommand::Netinfo, reply))?)?;
    writer.flush()?;

    Ok((codec, version, peer))
}

fn read_cell(reader: &mut Box<dyn Read + Send>, codec: &mut CellCodec) -> Result<Cell> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(cell) = codec.decode()? {
            return Ok(cell);
        }
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TorError::timeout("link handshake"))
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(TorError::HandshakeFailed(
                "guard closed the link during the handshake".into(),
            ));
        }
        codec.feed(&buf[..n]);
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// VERSIONS payload: a list of big-endian u16
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::ProtocolError(format!(
            "VERSIONS payload has odd length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Highest version both sides support; 4 is the minimum we speak
pub fn negotiate_version(ours: &[u16], theirs: &[u16]) -> Result<u16> {
    ours.iter()
        .filter(|v| theirs.contains(v))
        .copied()
        .filter(|&v| v >= 4)
        .max()
        .ok_or_else(|| {
            TorError::ProtocolError(format!(
                "no common link protocol version >= 4 (ours {:?}, theirs {:?})",
                ours, theirs
            ))
        })
}

fn encode_address(out: &mut Vec<u8>, addr: Option<IpAddr>) {
    match addr {
        Some(IpAddr::V4(v4)) => {
            out.push(0x04);
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            out.push(0x06);
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
        None => {
            out.push(0x00);
            out.push(0);
        }
    }
}

/// NETINFO: TIME (4) | OTHERADDR | NMYADDR (1) | MYADDR*
pub fn build_netinfo(timestamp: u32, other: Option<IpAddr>, mine: Option<IpAddr>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    encode_address(&mut payload, other);
    match mine {
        Some(addr) => {
            payload.push(1);
            encode_address(&mut payload, Some(addr));
        }
        None => payload.push(0),
    }
    payload
}

/// The address the guard says it sees us at
fn parse_netinfo_other_address(payload: &[u8]) -> Option<IpAddr> {
    let atype = *payload.get(4)?;
    let alen = *payload.get(5)? as usize;
    let value = payload.get(6..6 + alen)?;
    match (atype, alen) {
        (0x04, 4) => {
            let octets: [u8; 4] = value.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        (0x06, 16) => {
            let octets: [u8; 16] = value.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
