//! Tor protocol implementation
//!
//! This module implements the actual Tor protocol, including:
//! - Directory consensus fetching and parsing
//! - Circuit building (ntor handshake, hop-by-hop extension)
//! - Onion layering and flow control
//! - Streams
//! - Cell protocol
//! - Certificate verification

pub mod cell;
pub mod certs;
pub mod circuit;
pub mod circuit_builder;
pub mod consensus;
pub mod crypto;
pub mod directory;
pub mod flow_control;
pub mod ntor;
pub mod relay;
pub mod stream;

pub use cell::{Cell, CellCodec, CellCommand, RelayCell, RelayCommand};
pub use certs::{CertsCell, Ed25519Certificate, VerifiedRelay};
pub use circuit::{Circuit, CircuitState};
pub use circuit_builder::CircuitBuilder;
pub use consensus::{Consensus, ConsensusParser, DescriptorInfo, DescriptorParser};
pub use crypto::{CircuitKeys, HopCrypto, OnionCrypto, RelayLayer};
pub use directory::{DirectoryClient, DirectorySource, HttpDirectorySource, StaticDirectorySource};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use ntor::{derive_circuit_keys, server_handshake, NtorHandshake};
pub use relay::{ExitPolicy, Relay, RelayFilter, RelayFlags, RelayRole, RelaySelector};
pub use stream::{StreamSource, StreamState, TorStream};
