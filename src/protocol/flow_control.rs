//! Tor SENDME Flow Control
//!
//! Implements Tor's window-based flow control.
//!
//! ## How It Works:
//!
//! 1. **Windows:** Each stream and circuit has a send (package) window and a
//!    receive (deliver) window
//! 2. **Decrement:** The send window drops on each DATA cell sent, the
//!    receive window on each DATA cell received
//! 3. **SENDME:** Once a full increment has been received we send a SENDME
//!    and re-open our receive window by one increment
//! 4. **Increment:** Receiving a SENDME re-opens the send window
//!
//! ## Window Values (from Tor spec):
//!
//! - **Initial window:** 1000 cells (circuit), 500 cells (stream)
//! - **Increment:** 100 cells per SENDME (circuit), 50 cells (stream)

use crate::error::{Result, TorError};

/// Shared window arithmetic for circuits and streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    send: u16,
    recv: u16,
    initial: u16,
    increment: u16,
}

impl Window {
    const fn new(initial: u16, increment: u16) -> Self {
        Self {
            send: initial,
            recv: initial,
            initial,
            increment,
        }
    }

    fn take_send(&mut self) -> bool {
        if self.send == 0 {
            return false;
        }
        self.send -= 1;
        true
    }

    /// A SENDME that would push the window above its initial size is a
    /// protocol violation.
    fn sendme_received(&mut self) -> bool {
        if self.send + self.increment > self.initial {
            return false;
        }
        self.send += self.increment;
        true
    }

    /// Returns true when a SENDME should be sent back
    fn data_received(&mut self) -> Result<bool> {
        if self.recv == 0 {
            return Err(TorError::ProtocolError(
                "peer sent DATA past the receive window".into(),
            ));
        }
        self.recv -= 1;
        if self.recv <= self.initial - self.increment {
            self.recv += self.increment;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Circuit-level flow control
///
/// Manages SENDME windows for an entire circuit, independent of streams.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    window: Window,
}

impl CircuitFlowControl {
    /// Initial circuit window size (Tor spec: 1000 cells)
    pub const INITIAL_WINDOW: u16 = 1000;

    /// Window increment per SENDME (Tor spec: 100 cells)
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            window: Window::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
        }
    }

    pub fn send_window(&self) -> u16 {
        self.window.send
    }

    pub fn recv_window(&self) -> u16 {
        self.window.recv
    }

    /// Check if we can send a DATA cell
    pub fn can_send(&self) -> bool {
        self.window.send > 0
    }

    /// Decrement send window when sending a DATA cell
    pub fn on_send(&mut self) -> Result<()> {
        if !self.window.take_send() {
            return Err(TorError::ResourceExhausted(
                "circuit send window exhausted".into(),
            ));
        }
        Ok(())
    }

    /// Increment send window when receiving a circuit SENDME
    pub fn on_sendme_received(&mut self) -> Result<()> {
        if !self.window.sendme_received() {
            return Err(TorError::ProtocolError(
                "unexpected circuit SENDME".into(),
            ));
        }
        log::trace!("Circuit send window: {}", self.window.send);
        Ok(())
    }

    /// Account for a received DATA cell
    ///
    /// Returns `true` if a circuit SENDME should be sent back.
    pub fn on_receive(&mut self) -> Result<bool> {
        let sendme = self.window.data_received()?;
        if sendme {
            log::trace!("Circuit recv window reached threshold, SENDME due");
        }
        Ok(sendme)
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
///
/// Manages SENDME windows for a single stream within a circuit.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    window: Window,

    /// Stream ID this flow control belongs to
    pub stream_id: u16,
}

impl StreamFlowControl {
    /// Initial stream window size (Tor spec: 500 cells)
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per SENDME (Tor spec: 50 cells)
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            window: Window::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
            stream_id,
        }
    }

    pub fn send_window(&self) -> u16 {
        self.window.send
    }

    pub fn recv_window(&self) -> u16 {
        self.window.recv
    }

    /// Check if we can send a DATA cell
    pub fn can_send(&self) -> bool {
        self.window.send > 0
    }

    /// Decrement send window when sending a DATA cell
    pub fn on_send(&mut self) -> Result<()> {
        if !self.window.take_send() {
            return Err(TorError::ResourceExhausted(format!(
                "stream {} send window exhausted",
                self.stream_id
            )));
        }
        Ok(())
    }

    /// Increment send window when receiving a stream SENDME
    pub fn on_sendme_received(&mut self) -> Result<()> {
        if !self.window.sendme_received() {
            return Err(TorError::ProtocolError(format!(
                "unexpected SENDME on stream {}",
                self.stream_id
            )));
        }
        log::trace!(
            "Stream {} send window: {}",
            self.stream_id,
            self.window.send
        );
        Ok(())
    }

    /// Account for a received DATA cell
    ///
    /// Returns `true` if a stream SENDME should be sent back.
    pub fn on_receive_data(&mut self) -> Result<bool> {
        self.window.data_received()
    }

    /// Check if stream is blocked (can't send more data)
    pub fn is_blocked(&self) -> bool {
        self.window.send == 0
    }
}
