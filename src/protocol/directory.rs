//! Directory client
//!
//! Fetches the network consensus and a sample of server descriptors (for
//! ntor keys and family declarations), caches the result until it goes
//! stale, and answers relay lookups for path selection.
//!
//! The fetch itself sits behind [`DirectorySource`] so tests and embedders
//! can supply a consensus without touching the network.

use super::consensus::{Consensus, ConsensusParser, DescriptorParser};
use super::relay::{Relay, RelayFilter, RelaySelector};
use crate::config::DirectoryAuthority;
use crate::context::TorContext;
use crate::error::{Result, TorError};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Descriptors requested per HTTP request
const DESCRIPTOR_BATCH: usize = 32;

/// Upper bound on a single directory response
const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

/// Where consensus documents come from
pub trait DirectorySource: Send + Sync {
    fn fetch_consensus(&self) -> Result<Consensus>;
}

/// Plain HTTP/1.0 to the configured directory authorities
pub struct HttpDirectorySource {
    ctx: TorContext,
}

impl HttpDirectorySource {
    pub fn new(ctx: TorContext) -> Self {
        Self { ctx }
    }

    fn fetch_from(&self, authority: &DirectoryAuthority) -> Result<Consensus> {
        let body = http_get(
            &authority.address,
            "/tor/status-vote/current/consensus",
            self.ctx.config().connect_timeout(),
            self.ctx.config().directory_timeout(),
        )?;
        let mut consensus = ConsensusParser::parse(&body)?;
        log::info!(
            target: self.ctx.log_target(),
            "Consensus from {}: {} relays",
            authority.name,
            consensus.relays.len()
        );

        let sample = descriptor_sample(&consensus, self.ctx.config().descriptor_sample_size);
        let mut applied = 0;
        for batch in sample.chunks(DESCRIPTOR_BATCH) {
            let path = format!("/tor/server/fp/{}", batch.join("+"));
            match http_get(
                &authority.address,
                &path,
                self.ctx.config().connect_timeout(),
                self.ctx.config().directory_timeout(),
            ) {
                Ok(body) => {
                    let text = String::from_utf8_lossy(&body);
                    applied += consensus.apply_descriptors(&DescriptorParser::parse_text(&text));
                }
                Err(e) => log::warn!(
                    target: self.ctx.log_target(),
                    "Descriptor batch from {} failed: {}",
                    authority.name,
                    e
                ),
            }
        }
        log::info!(
            target: self.ctx.log_target(),
            "Learned ntor keys for {} relays",
            applied
        );
        if applied == 0 {
            return Err(TorError::Directory(format!(
                "no usable descriptors from {}",
                authority.name
            )));
        }
        Ok(consensus)
    }
}

impl DirectorySource for HttpDirectorySource {
    fn fetch_consensus(&self) -> Result<Consensus> {
        let mut last_error = None;
        for authority in &self.ctx.config().authorities {
            match self.fetch_from(authority) {
                Ok(consensus) => return Ok(consensus),
                Err(e) => {
                    log::warn!(
                        target: self.ctx.log_target(),
                        "Directory {} failed: {}",
                        authority.name,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(TorError::DirectoryUnavailable(match last_error {
            Some(e) => e.to_string(),
            None => "no directory authorities configured".into(),
        }))
    }
}

/// A fixed consensus, for offline use and tests
pub struct StaticDirectorySource {
    consensus: Consensus,
}

impl StaticDirectorySource {
    pub fn new(consensus: Consensus) -> Self {
        Self { consensus }
    }
}

impl DirectorySource for StaticDirectorySource {
    fn fetch_consensus(&self) -> Result<Consensus> {
        Ok(self.consensus.clone())
    }
}

/// Fingerprints worth fetching descriptors for: a third guards, a third
/// exits, the rest middles, highest bandwidth first
fn descriptor_sample(consensus: &Consensus, size: usize) -> Vec<String> {
    let mut by_bandwidth = consensus.running_relays();
    by_bandwidth.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    let quotas: [(fn(&Relay) -> bool, usize); 3] = [
        (Relay::is_guard, size / 3),
        (Relay::is_exit, size / 3),
        (Relay::is_middle, size),
    ];
    let mut sample: Vec<String> = Vec::with_capacity(size);
    for (pred, quota) in quotas {
        let mut taken = 0;
        for relay in by_bandwidth.iter().filter(|r| pred(r)) {
            if taken == quota || sample.len() == size {
                break;
            }
            if !sample.contains(&relay.fingerprint) {
                sample.push(relay.fingerprint.clone());
                taken += 1;
            }
        }
    }
    sample
}

/// One HTTP/1.0 GET, returning the body of a 200 response
fn http_get(address: &str, path: &str, connect_timeout: Duration, timeout: Duration) -> Result<Vec<u8>> {
    let addr: SocketAddr = address
        .to_socket_addrs()
        .map_err(|e| TorError::Directory(format!("bad directory address {}: {}", address, e)))?
        .next()
        .ok_or_else(|| TorError::Directory(format!("{} did not resolve", address)))?;

    let mut stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: tor-native/{}\r\n\r\n",
        path,
        addr.ip(),
        env!("CARGO_PKG_VERSION")
    );
    stream.write_all(request.as_bytes())?;

    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        if Instant::now() > deadline {
            return Err(TorError::timeout(format!("directory request {}", path)));
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        if response.len() > MAX_RESPONSE_SIZE {
            return Err(TorError::Directory(format!(
                "response to {} exceeds {} bytes",
                path, MAX_RESPONSE_SIZE
            )));
        }
    }

    parse_http_response(&response)
}

/// Parse HTTP response and extract body
fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let response_str = String::from_utf8_lossy(response);

    if !response_str.starts_with("HTTP/") {
        return Err(TorError::Directory("Invalid HTTP response".into()));
    }

    let first_line = response_str.lines().next().unwrap_or("");
    if !first_line.contains(" 200 ") {
        return Err(TorError::Directory(format!("HTTP error: {}", first_line)));
    }

    // Find empty line (end of headers)
    if let Some(body_start) = response.windows(4).position(|w| w == b"\r\n\r\n") {
        Ok(response[body_start + 4..].to_vec())
    } else if let Some(body_start) = response.windows(2).position(|w| w == b"\n\n") {
        Ok(response[body_start + 2..].to_vec())
    } else {
        Ok(Vec::new())
    }
}

struct CachedConsensus {
    selector: RelaySelector,
    valid_until: u64,
    expires_at: Instant,
}

/// Caching relay directory
pub struct DirectoryClient {
    ctx: TorContext,
    source: Box<dyn DirectorySource>,
    cache: Mutex<Option<CachedConsensus>>,
    /// Set while one caller fetches; the others keep the stale copy
    refreshing: AtomicBool,
}

impl DirectoryClient {
    /// Directory backed by the configured authorities
    pub fn new(ctx: TorContext) -> Self {
        let source = Box::new(HttpDirectorySource::new(ctx.clone()));
        Self::with_source(ctx, source)
    }

    pub fn with_source(ctx: TorContext, source: Box<dyn DirectorySource>) -> Self {
        Self {
            ctx,
            source,
            cache: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Directory serving a fixed consensus
    pub fn from_consensus(ctx: TorContext, consensus: Consensus) -> Self {
        Self::with_source(ctx, Box::new(StaticDirectorySource::new(consensus)))
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedConsensus>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current relay set, refreshing the cache when it has expired.
    ///
    /// The fetch runs without the cache lock. While one caller refreshes,
    /// concurrent callers get the expired copy instead of waiting.
    pub fn selector(&self) -> Result<RelaySelector> {
        let stale = {
            let cache = self.cache();
            match cache.as_ref() {
                Some(cached) if Instant::now() < cached.expires_at => {
                    return Ok(cached.selector.clone())
                }
                Some(cached) => Some((cached.selector.clone(), cached.valid_until)),
                None => None,
            }
        };

        let leader = !self.refreshing.swap(true, Ordering::AcqRel);
        if !leader {
            if let Some((selector, _)) = stale {
                log::debug!(
                    target: self.ctx.log_target(),
                    "Consensus refresh in flight; serving cached copy"
                );
                return Ok(selector);
            }
        }
        let fetched = self.source.fetch_consensus();
        if leader {
            self.refreshing.store(false, Ordering::Release);
        }

        match fetched {
            Ok(consensus) => {
                let now = unix_now();
                let until_stale = consensus.fresh_until.saturating_sub(now);
                let ttl = Duration::from_secs(until_stale).min(self.ctx.config().max_consensus_age());
                let fresh = CachedConsensus {
                    selector: RelaySelector::new(consensus.relays),
                    valid_until: consensus.valid_until,
                    expires_at: Instant::now() + ttl,
                };
                log::debug!(
                    target: self.ctx.log_target(),
                    "Directory cache refreshed: {} relays, {}s to live",
                    fresh.selector.count(),
                    ttl.as_secs()
                );
                let selector = fresh.selector.clone();
                *self.cache() = Some(fresh);
                Ok(selector)
            }
            Err(e) => match stale {
                Some((selector, valid_until)) => {
                    log::warn!(
                        target: self.ctx.log_target(),
                        "Consensus refresh failed ({}); using cached consensus{}",
                        e,
                        if valid_until < unix_now() { " past valid-until" } else { "" }
                    );
                    Ok(selector)
                }
                None => Err(match e {
                    TorError::DirectoryUnavailable(_) => e,
                    other => TorError::DirectoryUnavailable(other.to_string()),
                }),
            },
        }
    }

    /// All relays matching `filter`
    pub fn get_relays(&self, filter: &RelayFilter) -> Result<Vec<Relay>> {
        let selector = self.selector()?;
        Ok(selector.filter(filter).into_iter().cloned().collect())
    }

    /// One bandwidth-weighted guard
    pub fn get_guard_candidate(&self) -> Result<Relay> {
        self.select_relay(&RelayFilter::guard(), &[])
    }

    /// Up to `count` guards, `preferred` fingerprints first
    pub fn guard_candidates(&self, count: usize, preferred: &[String]) -> Result<Vec<Relay>> {
        let selector = self.selector()?;
        let guards: Vec<Relay> = selector
            .select_guards(count, preferred)
            .into_iter()
            .cloned()
            .collect();
        if guards.is_empty() {
            return Err(TorError::NoRelaysAvailable("no usable guards".into()));
        }
        Ok(guards)
    }

    /// A relay matching `filter` that may follow `path`
    pub fn select_relay(&self, filter: &RelayFilter, path: &[Relay]) -> Result<Relay> {
        let selector = self.selector()?;
        selector
            .select(filter, path, self.ctx.config().enforce_distinct_subnets)
            .cloned()
            .ok_or_else(|| {
                TorError::NoRelaysAvailable(format!(
                    "no {:?} relay fits after {} hop(s)",
                    filter.role,
                    path.len()
                ))
            })
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
