//! # tor-native
//!
//! A Tor client for ordinary (blocking) Rust programs.
//!
//! ## Architecture
//!
//! ```text
//! TorClient
//!   ↓ get_guard()
//! GuardHandle ── Reactor thread (callbacks for registered sources)
//!   ↓ create_circuit(n)
//! Channel (link to the guard, one reader thread)
//!   ↓
//! Circuit (ntor per hop, onion layers, SENDME windows)
//!   ↓ create_stream((host, port))
//! TorStream (send / recv, Read / Write)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tor_native::{TorClient, TorConfig};
//!
//! let client = TorClient::new(TorConfig::default())?;
//! let circuit = client.create_circuit(3)?;
//! let stream = circuit.create_stream(("example.com", 80))?;
//! stream.send(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")?;
//! let reply = stream.recv(1024)?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! # Ok::<(), tor_native::TorError>(())
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod circuit_pool;
pub mod config;
pub mod context;
mod error;
pub mod guards;
pub mod network;
pub mod protocol;
pub mod reactor;
pub mod stream_mux;

pub use channel::Channel;
pub use circuit_pool::{CircuitPool, CircuitPoolStats, Dialer};
pub use config::{DirectoryAuthority, TorConfig};
pub use context::TorContext;
pub use error::{destroy_reason_name, ErrorCode, Result, TorError};
pub use guards::{FailureInfo, GuardHandle, GuardState};
pub use network::{Connector, Link, TcpConnector, TlsConnector};
pub use protocol::{
    Circuit, CircuitState, Consensus, DirectoryClient, DirectorySource, Relay, RelayFilter,
    StreamState, TorStream,
};
pub use reactor::{Event, Interest, ReadSource, Reactor, ReactorThread, Readiness, Registry, Token};
pub use stream_mux::StreamMuxStats;

/// Entry point: owns the directory, the guard sample and the current guard
pub struct TorClient {
    ctx: TorContext,
    directory: Arc<DirectoryClient>,
    connector: Arc<dyn Connector>,
    guard: Mutex<Option<Arc<GuardHandle>>>,
    guard_state: Mutex<GuardState>,
}

impl TorClient {
    /// Client using the configured authorities and TLS setting
    pub fn new(config: TorConfig) -> Result<Self> {
        let connector: Arc<dyn Connector> = if config.use_tls {
            Arc::new(TlsConnector::new()?)
        } else {
            Arc::new(TcpConnector)
        };
        Self::with_connector(config, connector)
    }

    /// Client with a custom link layer
    pub fn with_connector(config: TorConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let ctx = TorContext::new(config);
        let directory = Arc::new(DirectoryClient::new(ctx.clone()));
        log::info!(target: ctx.log_target(), "Tor client created");
        Ok(Self {
            ctx,
            directory,
            connector,
            guard: Mutex::new(None),
            guard_state: Mutex::new(GuardState::new()),
        })
    }

    /// Replace the directory, e.g. with one serving a fixed consensus
    pub fn with_directory(mut self, directory: DirectoryClient) -> Self {
        self.directory = Arc::new(directory);
        self
    }

    /// Replace the directory source, keeping this client's context
    pub fn with_directory_source(self, source: Box<dyn DirectorySource>) -> Self {
        let directory = DirectoryClient::with_source(self.ctx.clone(), source);
        self.with_directory(directory)
    }

    pub fn context(&self) -> &TorContext {
        &self.ctx
    }

    pub fn config(&self) -> &TorConfig {
        self.ctx.config()
    }

    pub fn directory(&self) -> &Arc<DirectoryClient> {
        &self.directory
    }

    /// Snapshot of the guard sample and failure record
    pub fn guard_state(&self) -> GuardState {
        self.lock_guard_state().clone()
    }

    /// Restore a guard sample saved with [`GuardState::to_json`]
    pub fn set_guard_state(&self, state: GuardState) {
        *self.lock_guard_state() = state;
    }

    fn lock_guard_state(&self) -> MutexGuard<'_, GuardState> {
        self.guard_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open guard connection, connecting to a sampled guard if needed.
    ///
    /// Guards are tried in sample order, up to `max_guard_attempts`.
    pub fn get_guard(&self) -> Result<Arc<GuardHandle>> {
        let mut current = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(guard) = current.as_ref() {
            if guard.is_open() {
                return Ok(guard.clone());
            }
            log::info!(
                target: self.ctx.log_target(),
                "Guard {} connection lost; reconnecting",
                guard.relay().nickname
            );
        }
        *current = None;

        let config = self.ctx.config();
        let mut state = self.lock_guard_state();
        state.cleanup();
        if state.needs_refresh() {
            let candidates = self
                .directory
                .guard_candidates(config.guard_sample_size, &config.preferred_guards)?;
            state.sample(&candidates);
        }

        let eligible = self.directory.get_relays(&RelayFilter::guard())?;
        let order: Vec<String> = state.usable_guards().into_iter().cloned().collect();
        let mut last_error = None;

        for fingerprint in order.iter().take(config.max_guard_attempts) {
            let Some(relay) = eligible.iter().find(|r| &r.fingerprint == fingerprint) else {
                state.record_failure(fingerprint, "no longer a usable guard");
                continue;
            };

            match Channel::connect(&self.ctx, relay, self.connector.as_ref()) {
                Ok(channel) => {
                    state.record_success(fingerprint);
                    let handle = Arc::new(GuardHandle::new(
                        self.ctx.clone(),
                        channel,
                        self.directory.clone(),
                    )?);
                    *current = Some(handle.clone());
                    return Ok(handle);
                }
                Err(e) => {
                    state.record_failure(fingerprint, &e.to_string());
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => e,
            None => TorError::NoRelaysAvailable("no usable guard in the sample".into()),
        })
    }

    /// Build a circuit of `hops` hops through the current guard
    pub fn create_circuit(&self, hops: usize) -> Result<Circuit> {
        self.get_guard()?.create_circuit(hops)
    }

    /// Circuit pool over the current guard, for use through [`Dialer`]
    pub fn circuit_pool(&self, size: usize) -> Result<CircuitPool> {
        CircuitPool::new(self.get_guard()?, size)
    }

    /// Drop the current guard connection; every circuit on it closes
    pub fn disconnect(&self) {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(guard) = guard {
            guard.channel().shutdown();
        }
    }
}

impl std::fmt::Debug for TorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorClient")
            .field("log_target", &self.ctx.log_target())
            .finish()
    }
}
