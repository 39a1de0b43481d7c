//! TLS links against a loopback rustls server with a self-signed relay
//! certificate

mod common;

use common::init_logging;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tor_native::TlsConnector;

/// Self-signed P-256 certificate, like the link certificates relays present
const RELAY_CERT: &[u8] = include_bytes!("data/relay_cert.der");
const RELAY_KEY: &[u8] = include_bytes!("data/relay_key.der");

fn server_config() -> Arc<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(RELAY_CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(RELAY_KEY.to_vec())),
        )
        .unwrap();
    Arc::new(config)
}

/// One-connection TLS echo server; returns what it echoed once the client leaves
fn echo_server() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = server_config();
    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        let conn = ServerConnection::new(config).unwrap();
        let mut tls = StreamOwned::new(conn, socket);
        let mut echoed = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tls.read(&mut buf) {
                Ok(0) | Err(_) => return echoed,
                Ok(n) => {
                    echoed.extend_from_slice(&buf[..n]);
                    if tls.write_all(&buf[..n]).and_then(|_| tls.flush()).is_err() {
                        return echoed;
                    }
                }
            }
        }
    });
    (addr, handle)
}

#[test]
fn test_tls_link_round_trip() {
    init_logging();
    let (addr, server) = echo_server();
    let connector = TlsConnector::new().unwrap();
    let socket = TcpStream::connect(addr).unwrap();
    let mut link = connector.wrap(socket, Duration::from_secs(5)).unwrap();
    assert_eq!(link.control.peer_addr(), Some(addr));

    // Larger than one TLS record
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
    let writer = {
        let mut half = link.writer;
        let data = payload.clone();
        thread::spawn(move || {
            half.write_all(&data).unwrap();
            half.flush().unwrap();
            half
        })
    };

    let mut echoed = vec![0u8; payload.len()];
    link.reader.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);

    let _writer = writer.join().unwrap();
    link.control.shutdown();
    assert_eq!(server.join().unwrap(), payload);
}

#[test]
fn test_tls_handshake_times_out_on_silent_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(1));
        drop(socket);
    });

    let connector = TlsConnector::new().unwrap();
    let socket = TcpStream::connect(addr).unwrap();
    let err = match connector.wrap(socket, Duration::from_millis(200)) {
        Err(e) => e,
        Ok(_) => panic!("handshake with a silent peer succeeded"),
    };
    assert!(err.is_timeout(), "{:?}", err);
    silent.join().unwrap();
}
