//! In-process Tor network for integration tests.
//!
//! One loopback listener plays the guard. It runs the link handshake with
//! real CERTS, answers CREATE2 with the server side of ntor, and keeps one
//! onion layer per hop, so every further relay in the consensus is
//! simulated inside the guard's connection: EXTEND2 to a "remote" relay is
//! answered locally with that relay's keys. The last hop behaves like an
//! exit with a few canned hosts.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tor_native::channel::build_netinfo;
use tor_native::protocol::{
    derive_circuit_keys, server_handshake, Cell, CellCodec, CellCommand, Consensus, ExitPolicy,
    Relay, RelayCell, RelayCommand, RelayFlags, RelayLayer, StaticDirectorySource,
};
use tor_native::{TcpConnector, TorClient, TorConfig};
use x25519_dalek::{PublicKey, StaticSecret};

/// Served for any request ending in a blank line
pub const HTML_RESPONSE: &str = "HTTP/1.0 200 OK\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><head><title>mock exit</title></head><body><h1>It works</h1></body></html>\n";

/// Exit target that echoes every DATA cell back
pub const ECHO_HOST: &str = "echo.example";
/// Exit target that refuses BEGIN with END (CONNECTREFUSED)
pub const REFUSED_HOST: &str = "refused.example";
/// Exit target that answers BEGIN with `BULK_CELLS` full DATA cells and END
pub const BULK_HOST: &str = "bulk.example";
/// Exit target that never answers BEGIN
pub const SILENT_HOST: &str = "silent.example";
/// BEGIN makes the middle hop cut the circuit with TRUNCATED
pub const TRUNCATE_HOST: &str = "truncate.example";
/// BEGIN makes the guard write a cell with an unknown command
pub const MALFORMED_HOST: &str = "malformed.example";

/// Command byte no link protocol version defines
pub const UNKNOWN_CELL_COMMAND: u8 = 0x77;

pub const BULK_CELLS: usize = 120;

const END_REASON_CONNECTREFUSED: u8 = 3;
const END_REASON_DONE: u8 = 6;
const DESTROY_REASON_NONE: u8 = 0;
const DESTROY_REASON_CONNECTFAILED: u8 = 6;

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Never answer the EXTEND2 that would create this hop (2-based)
    pub stall_extend_to_hop: Option<usize>,
    /// Answer the first EXTEND2 of the session with TRUNCATED
    pub truncate_first_extend: bool,
    /// Never answer the first EXTEND2 of the session
    pub stall_first_extend: bool,
    /// MockExitA only accepts port 7, MockExitB only port 80
    pub split_exit_ports: bool,
}

/// What the mock relays saw, for assertions
#[derive(Debug, Default)]
pub struct MockLog {
    pub circuits_created: AtomicUsize,
    pub destroys: Mutex<Vec<(u32, u8)>>,
    pub extends: Mutex<Vec<String>>,
    pub truncations: AtomicUsize,
    /// EXTEND2 cells left unanswered
    pub stalls: AtomicUsize,
    /// RELAY_TRUNCATE cells from the client
    pub truncates_received: AtomicUsize,
    /// One entry per circuit SENDME: whether its digest matched
    pub circuit_sendmes: Mutex<Vec<bool>>,
    pub stream_sendmes: AtomicUsize,
    pub stream_ends: Mutex<Vec<(u16, u8)>>,
    pub begins: Mutex<Vec<String>>,
}

struct MockRelay {
    relay: Relay,
    identity: [u8; 20],
    secret: StaticSecret,
}

pub struct MockNetwork {
    relays: Arc<Vec<MockRelay>>,
    log: Arc<MockLog>,
    consensus: Consensus,
}

impl MockNetwork {
    pub fn start() -> Self {
        Self::start_with(MockOptions::default())
    }

    pub fn start_with(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock guard");
        let port = listener.local_addr().expect("local addr").port();
        let relays = Arc::new(mock_relays(port, &options));
        let log = Arc::new(MockLog::default());

        let now = unix_now();
        let consensus = Consensus {
            valid_after: now - 60,
            fresh_until: now + 3600,
            valid_until: now + 3 * 3600,
            relays: relays.iter().map(|r| r.relay.clone()).collect(),
            version: 3,
        };

        let accept_relays = relays.clone();
        let accept_log = log.clone();
        thread::spawn(move || {
            for socket in listener.incoming() {
                let Ok(socket) = socket else { break };
                let relays = accept_relays.clone();
                let log = accept_log.clone();
                let options = options.clone();
                thread::spawn(move || {
                    // Link errors just end the session
                    let _ = Session::new(socket, relays, log, options).and_then(Session::run);
                });
            }
        });

        Self {
            relays,
            log,
            consensus,
        }
    }

    pub fn consensus(&self) -> Consensus {
        self.consensus.clone()
    }

    pub fn log(&self) -> &MockLog {
        &self.log
    }

    pub fn guard(&self) -> &Relay {
        &self.relays[0].relay
    }

    /// Client pointed at this network with `config`
    pub fn client_with(&self, config: TorConfig) -> TorClient {
        TorClient::with_connector(config.without_tls(), Arc::new(TcpConnector))
            .expect("client")
            .with_directory_source(Box::new(StaticDirectorySource::new(self.consensus())))
    }

    pub fn client(&self) -> TorClient {
        self.client_with(test_config())
    }

    pub fn destroys(&self) -> Vec<(u32, u8)> {
        self.log.destroys.lock().unwrap().clone()
    }

    /// Poll until a DESTROY for `circuit_id` arrives or `timeout` passes
    pub fn wait_for_destroy(&self, circuit_id: u32, timeout: Duration) -> Option<u8> {
        wait_for(timeout, || {
            self.destroys()
                .iter()
                .find(|(id, _)| *id == circuit_id)
                .map(|(_, reason)| *reason)
        })
    }
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> TorConfig {
    TorConfig::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_hop_timeout(Duration::from_secs(2))
        .with_stream_timeout(Duration::from_secs(5))
        .with_log_target("tor_native::tests")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `f` every 10ms until it yields a value or `timeout` passes
pub fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// The guard listens on loopback; everything else lives in its own /16
fn mock_relays(guard_port: u16, options: &MockOptions) -> Vec<MockRelay> {
    let layout = [
        ("MockGuard", IpAddr::V4(Ipv4Addr::LOCALHOST), guard_port, "Guard Stable Fast Running Valid"),
        ("MockMiddleA", IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)), 9001, "Fast Running Stable Valid"),
        ("MockMiddleB", IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)), 9001, "Fast Running Stable Valid"),
        ("MockExitA", IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1)), 9001, "Exit Fast Running Valid"),
        ("MockExitB", IpAddr::V4(Ipv4Addr::new(10, 4, 0, 1)), 9001, "Exit Fast Running Valid"),
    ];

    layout
        .iter()
        .enumerate()
        .map(|(i, &(nickname, address, or_port, flags))| {
            let identity = [0x20 + i as u8; 20];
            let secret = StaticSecret::from([0x40 + i as u8; 32]);
            let onion_key = PublicKey::from(&secret);
            let exit_policy = match (options.split_exit_ports, nickname) {
                (true, "MockExitA") => ExitPolicy::parse("accept 7").unwrap(),
                (true, "MockExitB") => ExitPolicy::parse("accept 80").unwrap(),
                _ => ExitPolicy::accept_all(),
            };
            let relay = Relay {
                nickname: nickname.to_string(),
                fingerprint: hex::encode_upper(identity),
                address,
                or_port,
                dir_port: None,
                flags: RelayFlags::from_string(flags),
                bandwidth: 1000 * (i as u64 + 1),
                published: unix_now(),
                ntor_onion_key: Some(STANDARD.encode(onion_key.as_bytes())),
                exit_policy,
                family: None,
            };
            MockRelay {
                relay,
                identity,
                secret,
            }
        })
        .collect()
}

struct MockStream {
    host: String,
    request: Vec<u8>,
}

struct MockCircuit {
    /// One layer per hop, guard first
    layers: Vec<RelayLayer>,
    streams: HashMap<u16, MockStream>,
    /// Full backward digest of every DATA cell sent, in order
    data_digests: Vec<[u8; 20]>,
    sendmes_seen: usize,
    /// Set by MALFORMED_HOST; the session writes the bad cell
    send_unknown_cell: bool,
}

struct Session {
    reader: TcpStream,
    writer: TcpStream,
    codec: CellCodec,
    relays: Arc<Vec<MockRelay>>,
    log: Arc<MockLog>,
    options: MockOptions,
    circuits: HashMap<u32, MockCircuit>,
}

impl Session {
    fn new(
        socket: TcpStream,
        relays: Arc<Vec<MockRelay>>,
        log: Arc<MockLog>,
        options: MockOptions,
    ) -> io::Result<Self> {
        Ok(Self {
            writer: socket.try_clone()?,
            reader: socket,
            codec: CellCodec::new(),
            relays,
            log,
            options,
            circuits: HashMap::new(),
        })
    }

    fn run(mut self) -> io::Result<()> {
        self.handshake()?;
        loop {
            let cell = self.next_cell()?;
            match cell.command {
                CellCommand::Create2 => self.on_create2(cell)?,
                CellCommand::Relay | CellCommand::RelayEarly => self.on_relay(cell)?,
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    self.circuits.remove(&cell.circuit_id);
                    self.log
                        .destroys
                        .lock()
                        .unwrap()
                        .push((cell.circuit_id, reason));
                }
                _ => {}
            }
        }
    }

    fn handshake(&mut self) -> io::Result<()> {
        let versions = self.next_cell()?;
        assert_eq!(versions.command, CellCommand::Versions);
        self.send(Cell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]))?;
        self.codec.set_link_version(5);

        self.send(Cell::new(0, CellCommand::Certs, certs_payload()))?;
        let mut challenge = vec![0x5a; 32];
        challenge.extend_from_slice(&[0, 1, 0, 3]);
        self.send(Cell::new(0, CellCommand::AuthChallenge, challenge))?;
        let peer = self.reader.peer_addr().ok().map(|a| a.ip());
        let netinfo = build_netinfo(unix_now() as u32, peer, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        self.send(Cell::new(0, CellCommand::Netinfo, netinfo))?;

        loop {
            let cell = self.next_cell()?;
            if cell.command == CellCommand::Netinfo {
                return Ok(());
            }
        }
    }

    fn next_cell(&mut self) -> io::Result<Cell> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(cell) = self.codec.decode()? {
                return Ok(cell);
            }
            let n = self.reader.read(&mut buf)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.codec.feed(&buf[..n]);
        }
    }

    fn send(&mut self, cell: Cell) -> io::Result<()> {
        let bytes = self.codec.encode(&cell)?;
        self.writer.write_all(&bytes)
    }

    fn on_create2(&mut self, cell: Cell) -> io::Result<()> {
        let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
        let guard = &self.relays[0];
        let (reply, seed) =
            server_handshake(&guard.identity, &guard.secret, &cell.payload[4..4 + hlen])?;
        let keys = derive_circuit_keys(&seed)?;

        self.circuits.insert(
            cell.circuit_id,
            MockCircuit {
                layers: vec![RelayLayer::new(&keys)],
                streams: HashMap::new(),
                data_digests: Vec::new(),
                sendmes_seen: 0,
                send_unknown_cell: false,
            },
        );
        self.log.circuits_created.fetch_add(1, Ordering::SeqCst);

        let mut payload = (reply.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(&reply);
        self.send(Cell::new(cell.circuit_id, CellCommand::Created2, payload))
    }

    fn on_relay(&mut self, cell: Cell) -> io::Result<()> {
        let circ_id = cell.circuit_id;
        let Some(circuit) = self.circuits.get_mut(&circ_id) else {
            return Ok(());
        };

        let mut payload = cell.payload;
        let mut target = None;
        for (hop, layer) in circuit.layers.iter_mut().enumerate() {
            if layer.peel_forward(&mut payload)?.is_some() {
                target = Some(hop);
                break;
            }
        }
        let Some(hop) = target else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "cell not recognized by any hop"));
        };
        let relay_cell = RelayCell::from_bytes(&payload)?;

        let replies = handle_relay(&self.relays, &self.log, &self.options, circuit, hop, relay_cell)?;
        let mut out = Vec::with_capacity(replies.len());
        for (from_hop, reply) in replies {
            out.push(backward(circuit, from_hop, &reply)?);
        }
        let unknown_cell = std::mem::take(&mut circuit.send_unknown_cell);
        for payload in out {
            self.send(Cell::new(circ_id, CellCommand::Relay, payload))?;
        }
        if unknown_cell {
            // CIRCID (4) | COMMAND (1) | PAYLOAD (509), bypassing the encoder
            let mut raw = circ_id.to_be_bytes().to_vec();
            raw.push(UNKNOWN_CELL_COMMAND);
            raw.resize(4 + 1 + 509, 0);
            self.writer.write_all(&raw)?;
        }
        Ok(())
    }
}

/// Originate `cell` at `hop` and add the layers of every hop before it
fn backward(circuit: &mut MockCircuit, hop: usize, cell: &RelayCell) -> io::Result<Vec<u8>> {
    let (mut payload, digest) = circuit.layers[hop].originate_backward(cell)?;
    if cell.command == RelayCommand::Data {
        circuit.data_digests.push(digest);
    }
    for layer in circuit.layers[..hop].iter_mut().rev() {
        layer.wrap_backward(&mut payload)?;
    }
    Ok(payload)
}

fn handle_relay(
    relays: &[MockRelay],
    log: &MockLog,
    options: &MockOptions,
    circuit: &mut MockCircuit,
    hop: usize,
    cell: RelayCell,
) -> io::Result<Vec<(usize, RelayCell)>> {
    let sid = cell.stream_id;
    let mut replies = Vec::new();

    match cell.command {
        RelayCommand::Extend2 => {
            let next_hop = circuit.layers.len() + 1;
            if options.stall_extend_to_hop == Some(next_hop)
                || (options.stall_first_extend && log.stalls.load(Ordering::SeqCst) == 0)
            {
                log.stalls.fetch_add(1, Ordering::SeqCst);
                return Ok(replies);
            }
            if options.truncate_first_extend && log.truncations.load(Ordering::SeqCst) == 0 {
                log.truncations.fetch_add(1, Ordering::SeqCst);
                replies.push((hop, RelayCell::new(RelayCommand::Truncated, 0, vec![DESTROY_REASON_CONNECTFAILED])));
                return Ok(replies);
            }

            let (identity, handshake) = parse_extend2(&cell.data);
            let relay = relays
                .iter()
                .find(|r| r.identity[..] == identity[..])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "EXTEND2 to unknown relay"))?;
            let (reply, seed) = server_handshake(&relay.identity, &relay.secret, &handshake)?;
            circuit.layers.push(RelayLayer::new(&derive_circuit_keys(&seed)?));
            log.extends.lock().unwrap().push(relay.relay.nickname.clone());

            let mut data = (reply.len() as u16).to_be_bytes().to_vec();
            data.extend_from_slice(&reply);
            replies.push((hop, RelayCell::new(RelayCommand::Extended2, 0, data)));
        }
        RelayCommand::Begin => {
            let target = String::from_utf8_lossy(&cell.data)
                .trim_end_matches('\0')
                .to_string();
            log.begins.lock().unwrap().push(target.clone());
            let host = target.rsplit_once(':').map_or(target.as_str(), |(h, _)| h).to_string();

            match host.as_str() {
                REFUSED_HOST => {
                    replies.push((hop, RelayCell::new(RelayCommand::End, sid, vec![END_REASON_CONNECTREFUSED])));
                }
                SILENT_HOST => {}
                TRUNCATE_HOST => {
                    // The middle hop loses its next relay
                    let middle = hop.saturating_sub(1);
                    circuit.layers.truncate(middle + 1);
                    circuit.streams.clear();
                    replies.push((middle, RelayCell::new(RelayCommand::Truncated, 0, vec![DESTROY_REASON_CONNECTFAILED])));
                }
                MALFORMED_HOST => circuit.send_unknown_cell = true,
                _ => {
                    replies.push((hop, RelayCell::new(RelayCommand::Connected, sid, vec![127, 0, 0, 1, 0, 0, 0, 60])));
                    if host == BULK_HOST {
                        for i in 0..BULK_CELLS {
                            let byte = b'a' + (i % 26) as u8;
                            let chunk = vec![byte; RelayCell::MAX_DATA_SIZE];
                            replies.push((hop, RelayCell::new(RelayCommand::Data, sid, chunk)));
                        }
                        replies.push((hop, RelayCell::new(RelayCommand::End, sid, vec![END_REASON_DONE])));
                    } else {
                        circuit.streams.insert(
                            sid,
                            MockStream {
                                host,
                                request: Vec::new(),
                            },
                        );
                    }
                }
            }
        }
        RelayCommand::Data => {
            let Some(stream) = circuit.streams.get_mut(&sid) else {
                return Ok(replies);
            };
            if stream.host == ECHO_HOST {
                replies.push((hop, RelayCell::new(RelayCommand::Data, sid, cell.data)));
                return Ok(replies);
            }
            stream.request.extend_from_slice(&cell.data);
            if stream.request.windows(4).any(|w| w == b"\r\n\r\n") {
                for chunk in HTML_RESPONSE.as_bytes().chunks(RelayCell::MAX_DATA_SIZE) {
                    replies.push((hop, RelayCell::new(RelayCommand::Data, sid, chunk.to_vec())));
                }
                replies.push((hop, RelayCell::new(RelayCommand::End, sid, vec![END_REASON_DONE])));
                circuit.streams.remove(&sid);
            }
        }
        RelayCommand::Truncate => {
            log.truncates_received.fetch_add(1, Ordering::SeqCst);
            circuit.layers.truncate(hop + 1);
            replies.push((hop, RelayCell::new(RelayCommand::Truncated, 0, vec![DESTROY_REASON_NONE])));
        }
        RelayCommand::End => {
            let reason = cell.data.first().copied().unwrap_or(0);
            log.stream_ends.lock().unwrap().push((sid, reason));
            circuit.streams.remove(&sid);
        }
        RelayCommand::Sendme if sid == 0 => {
            circuit.sendmes_seen += 1;
            let expected = circuit.data_digests.get(circuit.sendmes_seen * 100 - 1);
            let ok = cell.data.len() >= 23
                && cell.data[0] == 1
                && cell.data[1..3] == [0, 20]
                && expected.map_or(false, |d| d[..] == cell.data[3..23]);
            log.circuit_sendmes.lock().unwrap().push(ok);
        }
        RelayCommand::Sendme => {
            log.stream_sendmes.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }
    Ok(replies)
}

/// Returns the legacy identity and the handshake data
fn parse_extend2(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let nspec = data[0] as usize;
    let mut offset = 1;
    let mut identity = Vec::new();
    for _ in 0..nspec {
        let lstype = data[offset];
        let lslen = data[offset + 1] as usize;
        if lstype == 0x02 {
            identity = data[offset + 2..offset + 2 + lslen].to_vec();
        }
        offset += 2 + lslen;
    }
    let hlen = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
    let handshake = data[offset + 4..offset + 4 + hlen].to_vec();
    (identity, handshake)
}

/// CERTS with a valid identity -> signing key certificate (type 4)
fn certs_payload() -> Vec<u8> {
    let identity = SigningKey::from_bytes(&[7u8; 32]);
    let signing = SigningKey::from_bytes(&[8u8; 32]);
    let expires = (unix_now() / 3600) as u32 + 24;

    let mut body = vec![1, 4];
    body.extend_from_slice(&expires.to_be_bytes());
    body.push(1);
    body.extend_from_slice(signing.verifying_key().as_bytes());
    body.push(1);
    body.extend_from_slice(&32u16.to_be_bytes());
    body.push(4);
    body.push(0);
    body.extend_from_slice(identity.verifying_key().as_bytes());
    let signature = identity.sign(&body);
    body.extend_from_slice(&signature.to_bytes());

    let mut payload = vec![1, 4];
    payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
    payload.extend_from_slice(&body);
    payload
}
