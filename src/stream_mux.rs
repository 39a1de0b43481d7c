//! Stream Multiplexing
//!
//! The per-circuit stream table. Each circuit owns one
//! [`StreamMultiplexer`] under its lock; it allocates stream IDs, buffers
//! inbound DATA per stream in arrival order, and keeps the counters.
//!
//! - Stream IDs are never 0 and never reused while a stream holds them
//! - The number of open streams per circuit is capped
//! - A failing stream is removed without disturbing the others

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, TorError};
use crate::protocol::flow_control::StreamFlowControl;
use crate::protocol::stream::StreamState;
use crate::reactor::Waker;

/// State of a single stream
#[derive(Debug)]
pub struct StreamEntry {
    /// Target host:port
    pub target: String,
    pub state: StreamState,
    /// Bytes received and not yet read, in arrival order
    pub recv_buf: VecDeque<u8>,
    pub flow: StreamFlowControl,
    /// Reason byte of the END that closed the stream remotely
    pub end_reason: Option<u8>,
    /// Set while the stream is registered with a reactor
    pub waker: Option<Waker>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StreamEntry {
    fn new(stream_id: u16, target: String) -> Self {
        Self {
            target,
            state: StreamState::Connecting,
            recv_buf: VecDeque::new(),
            flow: StreamFlowControl::new(stream_id),
            end_reason: None,
            waker: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }

    /// Whether more inbound data can still arrive
    pub fn remote_open(&self) -> bool {
        matches!(self.state, StreamState::Connecting | StreamState::Open)
    }
}

/// Statistics about stream multiplexing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMuxStats {
    /// Total streams opened
    pub streams_opened: u64,
    /// Total streams closed
    pub streams_closed: u64,
    /// Current active streams
    pub active_streams: usize,
    /// Total bytes sent across all streams
    pub total_bytes_sent: u64,
    /// Total bytes received across all streams
    pub total_bytes_received: u64,
    /// Streams that failed to connect or were torn down by an error
    pub stream_failures: u64,
}

/// Manages the streams of one circuit
#[derive(Debug)]
pub struct StreamMultiplexer {
    streams: HashMap<u16, StreamEntry>,
    next_stream_id: u16,
    max_streams: usize,
    stats: StreamMuxStats,
}

impl StreamMultiplexer {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1, // Stream IDs start at 1
            max_streams,
            stats: StreamMuxStats::default(),
        }
    }

    /// Reserve an ID for a new stream to `target`, in `Connecting` state
    pub fn open(&mut self, target: &str) -> Result<u16> {
        if self.streams.len() >= self.max_streams {
            return Err(TorError::ResourceExhausted(format!(
                "Too many streams (max {})",
                self.max_streams
            )));
        }

        let stream_id = self.allocate_stream_id()?;
        self.streams
            .insert(stream_id, StreamEntry::new(stream_id, target.to_string()));
        self.stats.streams_opened += 1;
        log::debug!("Stream {} allocated for {}", stream_id, target);
        Ok(stream_id)
    }

    pub fn get(&self, stream_id: u16) -> Option<&StreamEntry> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u16) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&stream_id)
    }

    /// Drop a stream from the table
    pub fn remove(&mut self, stream_id: u16) -> Option<StreamEntry> {
        let entry = self.streams.remove(&stream_id)?;
        self.stats.streams_closed += 1;
        Some(entry)
    }

    /// Handle a stream failure
    pub fn fail(&mut self, stream_id: u16, error: &str) {
        if self.remove(stream_id).is_some() {
            log::warn!("Stream {} failed: {}", stream_id, error);
            self.stats.stream_failures += 1;
        }
    }

    /// Append inbound DATA to a stream's buffer.
    ///
    /// Returns `Ok(true)` when a stream-level SENDME is due. Data for
    /// unknown streams (already closed locally) is dropped.
    pub fn route_data(&mut self, stream_id: u16, data: &[u8]) -> Result<bool> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            log::debug!("Data for closed stream {}, ignoring", stream_id);
            return Ok(false);
        };

        match stream.state {
            StreamState::Open => {}
            // END already sent; cells still in flight are dropped
            StreamState::HalfClosedLocal | StreamState::Closed => return Ok(false),
            StreamState::Connecting | StreamState::HalfClosedRemote => {
                return Err(TorError::ProtocolError(format!(
                    "DATA on stream {} in state {:?}",
                    stream_id, stream.state
                )))
            }
        }

        let sendme = stream.flow.on_receive_data()?;
        stream.recv_buf.extend(data);
        stream.bytes_received += data.len() as u64;
        self.stats.total_bytes_received += data.len() as u64;
        stream.wake();
        Ok(sendme)
    }

    pub fn record_sent(&mut self, stream_id: u16, bytes: usize) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.bytes_sent += bytes as u64;
            self.stats.total_bytes_sent += bytes as u64;
        }
    }

    /// Close all streams; their wakers fire so reactor callbacks see the close
    pub fn close_all(&mut self) {
        let count = self.streams.len();
        for (_, stream) in self.streams.drain() {
            stream.wake();
        }
        self.stats.streams_closed += count as u64;
        if count > 0 {
            log::debug!("Closed all {} streams", count);
        }
    }

    /// Get statistics
    pub fn stats(&self) -> StreamMuxStats {
        StreamMuxStats {
            active_streams: self.streams.len(),
            ..self.stats.clone()
        }
    }

    /// Get number of active streams
    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    /// Allocate the next stream ID
    fn allocate_stream_id(&mut self) -> Result<u16> {
        let start = self.next_stream_id;
        loop {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1; // Skip 0
            }

            if !self.streams.contains_key(&id) {
                return Ok(id);
            }

            // If we've wrapped around completely, we're out of IDs
            if self.next_stream_id == start {
                return Err(TorError::ResourceExhausted(
                    "No stream IDs available".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_stream(mux: &mut StreamMultiplexer, target: &str) -> u16 {
        let id = mux.open(target).unwrap();
        mux.get_mut(id).unwrap().state = StreamState::Open;
        id
    }

    #[test]
    fn test_ids_are_nonzero_and_unique() {
        let mut mux = StreamMultiplexer::new(10);
        let a = mux.open("example.com:80").unwrap();
        let b = mux.open("example.com:443").unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);

        mux.remove(a);
        let c = mux.open("example.com:8080").unwrap();
        assert_ne!(c, b);
    }

    #[test]
    fn test_wraparound_skips_zero_and_used_ids() {
        let mut mux = StreamMultiplexer::new(10);
        mux.next_stream_id = u16::MAX;
        let last = mux.open("a:1").unwrap();
        assert_eq!(last, u16::MAX);
        let first = mux.open("a:2").unwrap();
        assert_eq!(first, 1);

        mux.next_stream_id = u16::MAX;
        let next = mux.open("a:3").unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_stream_limit() {
        let mut mux = StreamMultiplexer::new(2);
        mux.open("a:1").unwrap();
        mux.open("a:2").unwrap();
        assert!(matches!(
            mux.open("a:3"),
            Err(TorError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_route_data_keeps_order_and_counts() {
        let mut mux = StreamMultiplexer::new(4);
        let id = open_stream(&mut mux, "example.com:80");

        assert!(!mux.route_data(id, b"first ").unwrap());
        assert!(!mux.route_data(id, b"second").unwrap());

        let stream = mux.get(id).unwrap();
        let bytes: Vec<u8> = stream.recv_buf.iter().copied().collect();
        assert_eq!(bytes, b"first second");
        assert_eq!(mux.stats().total_bytes_received, 12);

        // Unknown stream: dropped quietly
        assert!(!mux.route_data(999, b"late").unwrap());
    }

    #[test]
    fn test_route_data_signals_sendme() {
        let mut mux = StreamMultiplexer::new(4);
        let id = open_stream(&mut mux, "example.com:80");
        let due: Vec<bool> = (0..StreamFlowControl::WINDOW_INCREMENT)
            .map(|_| mux.route_data(id, b"x").unwrap())
            .collect();
        assert_eq!(due.iter().filter(|&&d| d).count(), 1);
        assert!(due[due.len() - 1]);
    }

    #[test]
    fn test_data_before_connected_is_rejected() {
        let mut mux = StreamMultiplexer::new(4);
        let id = mux.open("example.com:80").unwrap();
        assert!(mux.route_data(id, b"early").is_err());
    }

    #[test]
    fn test_failure_and_close_all() {
        let mut mux = StreamMultiplexer::new(4);
        let a = open_stream(&mut mux, "a:1");
        open_stream(&mut mux, "a:2");
        open_stream(&mut mux, "a:3");

        mux.fail(a, "connect refused");
        assert_eq!(mux.active_count(), 2);
        assert_eq!(mux.stats().stream_failures, 1);

        mux.close_all();
        let stats = mux.stats();
        assert_eq!(stats.active_streams, 0);
        assert_eq!(stats.streams_opened, 3);
        assert_eq!(stats.streams_closed, 3);
    }
}
