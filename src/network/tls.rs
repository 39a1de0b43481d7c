//! TLS support using rustls
//!
//! Real TLS implementation using rustls with the ring crypto provider.
//! Handles the TLS handshake and record encryption for relay connections.
//!
//! Uses a permissive certificate verifier because Tor relays use self-signed
//! certificates. Tor's security comes from its own onion encryption (ntor
//! handshake + AES-CTR) and the CERTS cell, not TLS certificate validation.
//!
//! After the handshake the connection is split into a reader and a writer
//! half. Both halves share the rustls state machine behind a mutex; the
//! reader never holds the lock while blocked on the socket.

use super::{Connector, Link, LinkControl};
use crate::error::{Result, TorError};
use crate::protocol::Relay;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Buffer size for TLS records (max TLS record = 16KB)
const TLS_BUFFER_SIZE: usize = 16384;

/// SNI sent to relays; relays ignore it
const RELAY_SNI: &str = "www.example.com";

/// Certificate verifier that accepts all certificates.
///
/// Tor relays use self-signed certificates; relay identity is checked
/// through the CERTS cell and the ntor handshake instead.
#[derive(Debug)]
struct TorRelayVerifier;

impl ServerCertVerifier for TorRelayVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls_err(context: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("TLS {}: {}", context, e))
}

fn lock(tls: &Mutex<ClientConnection>) -> io::Result<MutexGuard<'_, ClientConnection>> {
    tls.lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "TLS state poisoned"))
}

/// Connects to relays over TLS
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new() -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TorError::Internal(format!("TLS config: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TorRelayVerifier))
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Run the TLS handshake over an already connected socket
    pub fn wrap(&self, mut socket: TcpStream, timeout: Duration) -> Result<Link> {
        let server_name: ServerName<'static> = RELAY_SNI
            .try_into()
            .map_err(|e| TorError::Internal(format!("bad SNI: {}", e)))?;
        let mut tls = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|e| TorError::HandshakeFailed(format!("TLS init failed: {}", e)))?;

        socket.set_read_timeout(Some(timeout))?;
        while tls.is_handshaking() {
            tls.complete_io(&mut socket).map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    TorError::timeout("TLS handshake")
                }
                _ => TorError::HandshakeFailed(format!("TLS handshake: {}", e)),
            })?;
        }
        socket.set_read_timeout(None)?;

        log::debug!(
            "TLS handshake complete (protocol: {:?})",
            tls.protocol_version()
        );

        let tls = Arc::new(Mutex::new(tls));
        let control = LinkControl::new(socket.try_clone()?);
        Ok(Link {
            reader: Box::new(TlsReader {
                socket: socket.try_clone()?,
                tls: tls.clone(),
                scratch: vec![0u8; TLS_BUFFER_SIZE],
            }),
            writer: Box::new(TlsWriter { socket, tls }),
            control,
        })
    }
}

impl Connector for TlsConnector {
    fn connect(&self, relay: &Relay, timeout: Duration) -> Result<Link> {
        let socket = TcpStream::connect_timeout(&relay.socket_addr(), timeout)?;
        socket.set_nodelay(true)?;
        self.wrap(socket, timeout)
    }
}

/// Reader half: pulls records from the socket and returns plaintext
struct TlsReader {
    socket: TcpStream,
    tls: Arc<Mutex<ClientConnection>>,
    scratch: Vec<u8>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut tls = lock(&self.tls)?;
                match tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            let n = self.socket.read(&mut self.scratch)?;
            let mut tls = lock(&self.tls)?;
            if n == 0 {
                // Peer closed without close_notify; surface remaining plaintext first
                return match tls.reader().read(buf) {
                    Ok(n) => Ok(n),
                    Err(_) => Ok(0),
                };
            }
            let mut incoming = &self.scratch[..n];
            while !incoming.is_empty() {
                tls.read_tls(&mut incoming).map_err(|e| tls_err("read_tls", e))?;
                tls.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS: {}", e)))?;
            }
            while tls.wants_write() {
                tls.write_tls(&mut self.socket)?;
            }
        }
    }
}

/// Writer half: encrypts and flushes records immediately
struct TlsWriter {
    socket: TcpStream,
    tls: Arc<Mutex<ClientConnection>>,
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tls = lock(&self.tls)?;
        tls.writer().write_all(buf)?;
        while tls.wants_write() {
            tls.write_tls(&mut self.socket)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut tls = lock(&self.tls)?;
        while tls.wants_write() {
            tls.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }
}
