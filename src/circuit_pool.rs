//! Circuit pool behind the dialer interface
//!
//! HTTP adapters and similar consumers only need "a stream to host:port".
//! [`CircuitPool`] answers that over a fixed number of circuit slots on one
//! guard: circuits are built lazily on first use, streams are spread over
//! the slots round-robin, and a slot whose circuit has died (or whose exit
//! cannot reach the requested port) is rebuilt.
//!
//! A replaced circuit that still carries streams is retired rather than
//! destroyed: it leaves its slot but stays up until its last stream is
//! dropped, and is closed on a later dial.
//!
//! Security considerations:
//! - Limited pool size (prevents fingerprinting)
//! - Circuit expiration (long-lived idle circuits are retired)

use crate::error::{Result, TorError};
use crate::guards::GuardHandle;
use crate::protocol::{Circuit, TorStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Opens streams; implemented by [`CircuitPool`]
pub trait Dialer: Send + Sync {
    fn dial(&self, host: &str, port: u16) -> Result<TorStream>;
}

/// Idle circuits older than this are rebuilt before reuse
pub const DEFAULT_MAX_CIRCUIT_AGE: Duration = Duration::from_secs(10 * 60);

struct PooledCircuit {
    circuit: Circuit,
    created_at: Instant,
}

impl PooledCircuit {
    fn is_busy(&self) -> bool {
        self.circuit.is_open() && self.circuit.stream_stats().active_streams > 0
    }

    fn usable_for(&self, port: u16, max_age: Duration) -> bool {
        if !self.circuit.is_open() {
            return false;
        }
        let idle = self.circuit.stream_stats().active_streams == 0;
        if idle && self.created_at.elapsed() > max_age {
            return false;
        }
        self.circuit
            .exit_relay()
            .map_or(false, |exit| exit.allows_exit_port(port))
    }
}

/// Statistics about circuit pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitPoolStats {
    /// Total circuits built
    pub circuits_built: u64,
    /// Streams served by an existing circuit
    pub pool_hits: u64,
    /// Streams that needed a new circuit
    pub pool_misses: u64,
    /// Circuits replaced because they closed, aged out or lacked the port
    pub circuits_replaced: u64,
}

/// A fixed-size set of circuits on one guard
pub struct CircuitPool {
    guard: Arc<GuardHandle>,
    slots: Vec<Mutex<Option<PooledCircuit>>>,
    /// Out of rotation, kept alive for their open streams
    retired: Mutex<Vec<PooledCircuit>>,
    next: AtomicUsize,
    hops: usize,
    max_age: Duration,
    stats: Mutex<CircuitPoolStats>,
}

impl CircuitPool {
    /// Pool of `size` circuits with the configured hop count
    pub fn new(guard: Arc<GuardHandle>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(TorError::Config("circuit pool size must be at least 1".into()));
        }
        let hops = guard.channel().context().config().default_hops;
        Ok(Self {
            guard,
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            retired: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            hops,
            max_age: DEFAULT_MAX_CIRCUIT_AGE,
            stats: Mutex::new(CircuitPoolStats::default()),
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn guard(&self) -> &Arc<GuardHandle> {
        &self.guard
    }

    /// Circuits currently built and open
    pub fn open_circuits(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map_or(false, |p| p.circuit.is_open())
            })
            .count()
    }

    /// Replaced circuits still waiting for their streams to finish
    pub fn retired_circuits(&self) -> usize {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> CircuitPoolStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut CircuitPoolStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Take a circuit out of rotation. Busy ones wait in `retired`; the
    /// rest are dropped, which destroys them.
    fn retire(&self, pooled: PooledCircuit) {
        if pooled.is_busy() {
            log::debug!(
                "Retiring circuit {:#010x} with {} open stream(s)",
                pooled.circuit.id(),
                pooled.circuit.stream_stats().active_streams
            );
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(pooled);
        }
    }

    /// Close retired circuits whose streams have all finished
    fn prune_retired(&self) {
        let finished: Vec<PooledCircuit> = {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            let (busy, finished) = retired.drain(..).partition(PooledCircuit::is_busy);
            *retired = busy;
            finished
        };
        for pooled in &finished {
            log::debug!("Closing retired circuit {:#010x}", pooled.circuit.id());
        }
    }
}

impl Dialer for CircuitPool {
    fn dial(&self, host: &str, port: u16) -> Result<TorStream> {
        self.prune_retired();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let reusable = slot
            .as_ref()
            .map_or(false, |p| p.usable_for(port, self.max_age));
        if reusable {
            if let Some(pooled) = slot.as_ref() {
                match pooled.circuit.create_stream((host, port)) {
                    Ok(stream) => {
                        self.update_stats(|s| s.pool_hits += 1);
                        return Ok(stream);
                    }
                    // A circuit-level failure retires the slot; stream-level ones are the caller's
                    Err(e) if pooled.circuit.is_open() => return Err(e),
                    Err(e) => log::debug!("Pooled circuit died while dialing: {}", e),
                }
            }
        }

        if let Some(old) = slot.take() {
            self.update_stats(|s| s.circuits_replaced += 1);
            self.retire(old);
        }
        let circuit = self.guard.create_circuit_for_port(self.hops, port)?;
        self.update_stats(|s| {
            s.circuits_built += 1;
            s.pool_misses += 1;
        });
        log::debug!("Pool slot {} now holds circuit {:#010x}", index, circuit.id());

        let stream = circuit.create_stream((host, port));
        *slot = Some(PooledCircuit {
            circuit,
            created_at: Instant::now(),
        });
        stream
    }
}

impl std::fmt::Debug for CircuitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPool")
            .field("size", &self.slots.len())
            .field("retired", &self.retired_circuits())
            .field("stats", &self.stats())
            .finish()
    }
}
