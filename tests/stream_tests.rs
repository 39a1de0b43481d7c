//! Streams over a full circuit: BEGIN/CONNECTED, data in both directions,
//! END handling and SENDME flow control

mod common;

use common::*;
use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tor_native::{CircuitPool, Dialer, StreamState, TorError};

fn read_to_end(stream: &tor_native::TorStream) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let chunk = stream.recv(4096).unwrap();
        if chunk.is_empty() {
            return body;
        }
        body.extend_from_slice(&chunk);
    }
}

#[test]
fn test_http_get_through_three_hops() {
    init_logging();
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();

    let stream = circuit.create_stream(("example.com", 80)).unwrap();
    assert_eq!(stream.state(), StreamState::Open);
    assert_eq!(stream.target(), "example.com:80");
    assert_eq!(stream.circuit_id(), circuit.id());

    stream
        .send(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")
        .unwrap();
    let body = read_to_end(&stream);
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("HTTP/1.0 200 OK"));
    assert!(text.contains("<html>"));
    assert_eq!(text, HTML_RESPONSE);

    assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    assert_eq!(net.log().begins.lock().unwrap().as_slice(), ["example.com:80"]);
}

#[test]
fn test_echo_preserves_order_across_cells() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();
    let stream = circuit.create_stream((ECHO_HOST, 7)).unwrap();

    // Several cells' worth; the client splits at 498 bytes
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    stream.send(&payload).unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let chunk = stream.recv(1000).unwrap();
        assert!(!chunk.is_empty(), "echo stream closed early");
        assert!(chunk.len() <= 1000);
        echoed.extend_from_slice(&chunk);
    }
    assert_eq!(echoed, payload);

    let stats = circuit.stream_stats();
    assert_eq!(stats.active_streams, 1);
    assert_eq!(stats.total_bytes_sent, 3000);
    assert_eq!(stats.total_bytes_received, 3000);
}

#[test]
fn test_streams_are_independent() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();

    let a = circuit.create_stream((ECHO_HOST, 7)).unwrap();
    let b = circuit.create_stream((ECHO_HOST, 7)).unwrap();
    assert_ne!(a.id(), b.id());

    b.send(b"second").unwrap();
    a.send(b"first").unwrap();
    assert_eq!(a.recv(64).unwrap(), b"first");
    assert_eq!(b.recv(64).unwrap(), b"second");

    drop(a);
    b.send(b"still here").unwrap();
    assert_eq!(b.recv(64).unwrap(), b"still here");
}

#[test]
fn test_refused_begin_reports_end_reason() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();

    let err = circuit.create_stream((REFUSED_HOST, 443)).unwrap_err();
    match err {
        TorError::StreamClosed(msg) => assert!(msg.contains("CONNECTREFUSED"), "{}", msg),
        other => panic!("expected StreamClosed, got {:?}", other),
    }
    assert!(circuit.is_open());
    assert_eq!(circuit.stream_stats().stream_failures, 1);
}

#[test]
fn test_connect_timeout_sends_end() {
    let net = MockNetwork::start();
    let mut config = test_config();
    config.stream_connect_timeout_ms = 300;
    let client = net.client_with(config);
    let circuit = client.create_circuit(3).unwrap();

    let err = circuit.create_stream((SILENT_HOST, 80)).unwrap_err();
    assert!(err.is_timeout(), "{:?}", err);

    let ended = wait_for(Duration::from_secs(2), || {
        net.log().stream_ends.lock().unwrap().first().copied()
    });
    let (_, reason) = ended.expect("no END after connect timeout");
    assert_eq!(reason, 1);
}

#[test]
fn test_local_close_sends_end_done() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();

    let stream = circuit.create_stream((ECHO_HOST, 7)).unwrap();
    let id = stream.id();
    stream.close().unwrap();
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    assert!(stream.send(b"too late").is_err());

    let ended = wait_for(Duration::from_secs(2), || {
        net.log().stream_ends.lock().unwrap().first().copied()
    });
    assert_eq!(ended, Some((id, 6)));
}

#[test]
fn test_bulk_download_sends_authenticated_sendmes() {
    init_logging();
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();

    let stream = circuit.create_stream((BULK_HOST, 80)).unwrap();
    let body = read_to_end(&stream);
    assert_eq!(body.len(), BULK_CELLS * 498);
    assert!(body[..498].iter().all(|&b| b == b'a'));
    assert!(body[498..996].iter().all(|&b| b == b'b'));

    // One circuit SENDME after 100 cells, stream SENDMEs after 50 and 100
    let sendmes = wait_for(Duration::from_secs(2), || {
        let seen = net.log().circuit_sendmes.lock().unwrap().clone();
        (!seen.is_empty()).then_some(seen)
    });
    assert_eq!(sendmes, Some(vec![true]));
    let streams = wait_for(Duration::from_secs(2), || {
        (net.log().stream_sendmes.load(Ordering::SeqCst) == 2).then_some(())
    });
    assert!(streams.is_some());

    let (_, recv_window) = circuit.windows();
    assert_eq!(recv_window, 1000 - BULK_CELLS as u16 + 100);
}

#[test]
fn test_read_write_traits() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();
    let mut stream = circuit.create_stream(("example.com", 80)).unwrap();

    stream
        .write_all(b"GET /index.html HTTP/1.0\r\nHost: example.com\r\n\r\n")
        .unwrap();
    stream.flush().unwrap();
    let mut text = String::new();
    stream.read_to_string(&mut text).unwrap();
    assert_eq!(text, HTML_RESPONSE);
}

#[test]
fn test_circuit_pool_dials_and_reuses() {
    let net = MockNetwork::start();
    let client = net.client();
    let pool: CircuitPool = client.circuit_pool(1).unwrap();

    let first = pool.dial(ECHO_HOST, 7).unwrap();
    first.send(b"ping").unwrap();
    assert_eq!(first.recv(16).unwrap(), b"ping");

    let second = pool.dial(ECHO_HOST, 7).unwrap();
    assert_eq!(first.circuit_id(), second.circuit_id());

    let stats = pool.stats();
    assert_eq!(stats.circuits_built, 1);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.pool_misses, 1);
    assert_eq!(pool.open_circuits(), 1);
}

#[test]
fn test_stream_fails_when_circuit_destroyed() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();
    let stream = circuit.create_stream((ECHO_HOST, 7)).unwrap();

    circuit.close();
    assert!(stream.send(b"x").is_err());
    assert!(stream.recv(16).is_err());
}

#[test]
fn test_pool_retires_busy_circuit_on_port_change() {
    init_logging();
    let net = MockNetwork::start_with(MockOptions {
        split_exit_ports: true,
        ..Default::default()
    });
    let client = net.client();
    let pool = client.circuit_pool(1).unwrap();

    let echo = pool.dial(ECHO_HOST, 7).unwrap();
    let echo_circuit = echo.circuit_id();
    let web = pool.dial("example.com", 80).unwrap();
    assert_ne!(web.circuit_id(), echo_circuit);

    // The echo circuit left the slot but keeps serving its stream
    echo.send(b"still routed").unwrap();
    assert_eq!(echo.recv(64).unwrap(), b"still routed");
    assert_eq!(pool.stats().circuits_replaced, 1);
    assert_eq!(pool.retired_circuits(), 1);
    assert_eq!(pool.open_circuits(), 1);
    assert!(net.destroys().is_empty());

    drop(echo);
    drop(web);
    let again = pool.dial("example.com", 80).unwrap();
    assert_eq!(pool.stats().pool_hits, 1);
    assert_eq!(pool.retired_circuits(), 0);
    assert_eq!(net.wait_for_destroy(echo_circuit, Duration::from_secs(2)), Some(0));
    assert_ne!(again.circuit_id(), echo_circuit);
}

#[test]
fn test_recv_needs_room() {
    let net = MockNetwork::start();
    let client = net.client();
    let circuit = client.create_circuit(3).unwrap();
    let mut stream = circuit.create_stream((ECHO_HOST, 7)).unwrap();

    stream.send(b"buffered").unwrap();
    let mut nothing = [0u8; 0];
    assert_eq!(stream.read(&mut nothing).unwrap(), 0);
    assert!(matches!(stream.recv(0), Err(TorError::Stream(_))));

    // Nothing was consumed
    assert_eq!(stream.recv(64).unwrap(), b"buffered");
}
