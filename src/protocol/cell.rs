//! Tor cell protocol
//!
//! Implements the Tor cell format for communication with relays.
//! Cells are the basic unit of communication in the Tor protocol.
//!
//! Fixed-length cells carry a 509 byte payload. VERSIONS and every command
//! numbered 128 or higher are variable-length and carry a 2 byte length
//! after the command byte. Circuit IDs are 2 bytes wide until link
//! protocol 4 or newer has been negotiated, 4 bytes afterwards.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (deprecated)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (deprecated)
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can be sent early
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// VERSIONS and all commands >= 128 use the variable-length format
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes for v4+ protocol, 2 bytes before negotiation)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload (exactly 509 bytes for fixed-length cells)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell. Fixed-length payloads are zero padded to 509 bytes.
    pub fn new(circuit_id: u32, command: CellCommand, mut payload: Vec<u8>) -> Self {
        if !command.is_variable_length() && payload.len() < Self::PAYLOAD_SIZE {
            payload.resize(Self::PAYLOAD_SIZE, 0);
        }
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Create a DESTROY cell with the given reason
    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason])
    }

    /// Serialize with 4-byte circuit ID (link protocol v4+)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        CellCodec::with_link_version(4).encode(self)
    }

    /// Parse a complete cell with 4-byte circuit ID (link protocol v4+)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut codec = CellCodec::with_link_version(4);
        codec.feed(data);
        codec
            .decode()?
            .ok_or_else(|| TorError::MalformedCell("Cell too short".into()))
    }
}

/// Streaming encoder/decoder for cells on a link.
///
/// Bytes read from the connection are appended with [`CellCodec::feed`] and
/// complete cells are pulled with [`CellCodec::decode`]. The decoder never
/// consumes a partial frame, so any split of the input produces the same
/// sequence of cells.
#[derive(Debug)]
pub struct CellCodec {
    buf: Vec<u8>,
    pos: usize,
    link_version: Option<u16>,
}

impl Default for CellCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CellCodec {
    /// Compact the buffer once this many consumed bytes have accumulated
    const COMPACT_THRESHOLD: usize = 16 * 1024;

    /// Codec for a link that has not negotiated a version yet (2-byte IDs)
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            link_version: None,
        }
    }

    pub fn with_link_version(version: u16) -> Self {
        let mut codec = Self::new();
        codec.set_link_version(version);
        codec
    }

    /// Record the negotiated link protocol version
    pub fn set_link_version(&mut self, version: u16) {
        self.link_version = Some(version);
    }

    pub fn link_version(&self) -> Option<u16> {
        self.link_version
    }

    fn circ_id_len(&self, command: Option<CellCommand>) -> usize {
        if command == Some(CellCommand::Versions) {
            return 2;
        }
        match self.link_version {
            Some(v) if v >= 4 => 4,
            _ => 2,
        }
    }

    /// Encode a cell into its wire representation
    pub fn encode(&self, cell: &Cell) -> Result<Vec<u8>> {
        let id_len = self.circ_id_len(Some(cell.command));
        let mut buf = Vec::with_capacity(id_len + 3 + cell.payload.len().max(Cell::PAYLOAD_SIZE));

        if id_len == 2 {
            let id = u16::try_from(cell.circuit_id).map_err(|_| {
                TorError::MalformedCell(format!(
                    "circuit id {:#x} does not fit a 2-byte link",
                    cell.circuit_id
                ))
            })?;
            buf.extend_from_slice(&id.to_be_bytes());
        } else {
            buf.extend_from_slice(&cell.circuit_id.to_be_bytes());
        }
        buf.push(cell.command as u8);

        if cell.command.is_variable_length() {
            let len = u16::try_from(cell.payload.len()).map_err(|_| {
                TorError::MalformedCell(format!(
                    "variable cell payload too long: {}",
                    cell.payload.len()
                ))
            })?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&cell.payload);
        } else {
            if cell.payload.len() > Cell::PAYLOAD_SIZE {
                return Err(TorError::MalformedCell(format!(
                    "fixed cell payload too long: {}",
                    cell.payload.len()
                )));
            }
            buf.extend_from_slice(&cell.payload);
            buf.resize(id_len + 1 + Cell::PAYLOAD_SIZE, 0);
        }

        Ok(buf)
    }

    /// Append bytes received from the link
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos >= Self::COMPACT_THRESHOLD && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next complete cell.
    ///
    /// Returns `Ok(None)` when more data is needed and `MalformedCell` for
    /// unknown commands.
    pub fn decode(&mut self) -> Result<Option<Cell>> {
        let avail = &self.buf[self.pos..];
        // Peek at the command assuming the current width; VERSIONS is only
        // legal before negotiation, where the width is 2 anyway.
        let id_len = self.circ_id_len(None);
        if avail.len() < id_len + 1 {
            return Ok(None);
        }

        let cmd_byte = avail[id_len];
        let command = CellCommand::from_u8(cmd_byte)
            .ok_or_else(|| TorError::MalformedCell(format!("Unknown command: {}", cmd_byte)))?;

        let circuit_id = if id_len == 2 {
            u16::from_be_bytes([avail[0], avail[1]]) as u32
        } else {
            u32::from_be_bytes([avail[0], avail[1], avail[2], avail[3]])
        };

        let (payload_start, payload_len) = if command.is_variable_length() {
            if avail.len() < id_len + 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([avail[id_len + 1], avail[id_len + 2]]) as usize;
            (id_len + 3, len)
        } else {
            (id_len + 1, Cell::PAYLOAD_SIZE)
        };

        let frame_len = payload_start + payload_len;
        if avail.len() < frame_len {
            return Ok(None);
        }

        let payload = avail[payload_start..frame_len].to_vec();
        self.pos += frame_len;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }

        Ok(Some(Cell {
            circuit_id,
            command,
            payload,
        }))
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }

    /// Commands addressed to the circuit rather than a stream (stream id 0)
    pub fn is_circuit_level(self) -> bool {
        matches!(
            self,
            RelayCommand::Extend
                | RelayCommand::Extended
                | RelayCommand::Extend2
                | RelayCommand::Extended2
                | RelayCommand::Truncate
                | RelayCommand::Truncated
                | RelayCommand::Drop
        )
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for outgoing)
    pub recognized: u16,

    /// Stream ID
    pub stream_id: u16,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = 498;

    /// Size of the relay header (command, recognized, stream id, digest, length)
    pub const HEADER_SIZE: usize = 11;

    /// Offset of the digest field inside the relay payload
    pub const DIGEST_OFFSET: usize = 5;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        }
    }

    /// Serialize relay cell to exactly 509 bytes (for inclusion in Cell payload)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::MalformedCell(format!(
                "relay data too long: {}",
                self.data.len()
            )));
        }

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);

        Ok(buf)
    }

    /// Parse relay cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::MalformedCell("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::MalformedCell(format!("Unknown relay command: {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]);

        if length as usize > Self::MAX_DATA_SIZE {
            return Err(TorError::MalformedCell(format!(
                "Relay length {} exceeds maximum",
                length
            )));
        }

        let data_end = Self::HEADER_SIZE + length as usize;
        if data_end > data.len() {
            return Err(TorError::MalformedCell("Relay cell data truncated".into()));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: data[Self::HEADER_SIZE..data_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::new(0x8000_3039, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::SIZE);

        let parsed = Cell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.payload.len(), Cell::PAYLOAD_SIZE);
    }

    #[test]
    fn test_versions_uses_short_circuit_id() {
        let codec = CellCodec::new();
        let cell = Cell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]);
        let bytes = codec.encode(&cell).unwrap();
        assert_eq!(bytes, vec![0, 0, 7, 0, 4, 0, 4, 0, 5]);

        // still 2 bytes after negotiation
        let wide = CellCodec::with_link_version(5);
        assert_eq!(wide.encode(&cell).unwrap().len(), 9);
    }

    #[test]
    fn test_variable_cell_roundtrip() {
        let mut codec = CellCodec::with_link_version(4);
        let cell = Cell::new(0, CellCommand::Certs, vec![9; 700]);
        let bytes = codec.encode(&cell).unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 2 + 700);

        codec.feed(&bytes);
        assert_eq!(codec.decode().unwrap(), Some(cell));
        assert_eq!(codec.decode().unwrap(), None);
    }

    #[test]
    fn test_decoder_handles_split_reads() {
        let encoder = CellCodec::with_link_version(4);
        let cells = vec![
            Cell::new(0x8000_0001, CellCommand::Relay, vec![1; 20]),
            Cell::new(0, CellCommand::Vpadding, vec![0; 3]),
            Cell::destroy(0x8000_0002, 9),
        ];
        let mut wire = Vec::new();
        for cell in &cells {
            wire.extend(encoder.encode(cell).unwrap());
        }

        // One byte at a time, then in odd-sized chunks
        for chunk in [1usize, 7, 513] {
            let mut decoder = CellCodec::with_link_version(4);
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.feed(piece);
                while let Some(cell) = decoder.decode().unwrap() {
                    out.push(cell);
                }
            }
            assert_eq!(out, cells);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_unknown_command_is_malformed() {
        let mut codec = CellCodec::with_link_version(4);
        codec.feed(&[0, 0, 0, 1, 77]);
        assert!(matches!(codec.decode(), Err(TorError::MalformedCell(_))));
    }

    #[test]
    fn test_oversized_fixed_payload_rejected() {
        let cell = Cell {
            circuit_id: 1,
            command: CellCommand::Relay,
            payload: vec![0; Cell::PAYLOAD_SIZE + 1],
        };
        assert!(cell.to_bytes().is_err());
    }

    #[test]
    fn test_relay_cell_serialization() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);

        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, relay);
    }

    #[test]
    fn test_relay_cell_rejects_bad_length() {
        let mut bytes = RelayCell::new(RelayCommand::Data, 1, vec![1]).to_bytes().unwrap();
        bytes[9] = 0x02;
        bytes[10] = 0x00;
        assert!(RelayCell::from_bytes(&bytes).is_err());
    }
}
