//! Guard selection and guard connections
//!
//! Keeping hop 1 stable across circuits limits how often a new entry relay
//! gets to observe the client. [`GuardState`] remembers a small sample of
//! guards in preference order and benches guards that keep failing.
//!
//! A [`GuardHandle`] is an open channel to one guard plus the reactor that
//! serves callbacks for resources registered through it. Circuits built
//! from the handle all share its channel.

use crate::channel::Channel;
use crate::context::TorContext;
use crate::error::{Result, TorError};
use crate::protocol::{Circuit, CircuitBuilder, DirectoryClient, Relay};
use crate::reactor::{Event, Interest, ReactorThread, Registry, Source, Token};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How long a sampled guard is kept before the sample is redrawn
pub const GUARD_LIFETIME_SECS: u64 = 60 * 24 * 60 * 60;

/// Number of failed attempts before marking a guard as bad
pub const MAX_FAILURES_BEFORE_BAD: u32 = 3;

/// How long a guard stays in the "bad" list (in seconds)
pub const BAD_GUARD_TIMEOUT_SECS: u64 = 60 * 60;

/// Information about a failed guard attempt
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FailureInfo {
    /// Number of consecutive failures
    pub consecutive_failures: u32,

    /// Timestamp of last failure
    pub last_failure_time: u64,

    /// Last error message
    pub last_error: String,
}

/// Sampled guards and their recent failures
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardState {
    /// Selected guard fingerprints (in order of preference)
    pub guards: Vec<String>,

    /// When the sample was drawn (Unix timestamp)
    pub selected_at: u64,

    /// When to redraw the sample (Unix timestamp)
    pub rotate_after: u64,

    /// Guards that have failed recently (fingerprint -> failure info)
    pub failed_guards: HashMap<String, FailureInfo>,

    /// Guards benched until the given timestamp
    pub bad_guards: HashMap<String, u64>,
}

impl GuardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sample is empty, expired, or fully benched
    pub fn needs_refresh(&self) -> bool {
        if self.guards.is_empty() {
            return true;
        }
        if unix_now() > self.rotate_after {
            log::info!("Guard sample expired");
            return true;
        }
        self.usable_guards().is_empty()
    }

    /// Replace the sample with `candidates`, keeping their order
    pub fn sample(&mut self, candidates: &[Relay]) {
        let now = unix_now();
        self.guards = candidates
            .iter()
            .filter(|r| !self.is_bad_guard(&r.fingerprint))
            .map(|r| r.fingerprint.clone())
            .collect();
        self.selected_at = now;
        self.rotate_after = now + GUARD_LIFETIME_SECS;
        log::info!("Sampled {} guards", self.guards.len());
    }

    /// Usable guard fingerprints in preference order
    pub fn usable_guards(&self) -> Vec<&String> {
        self.guards
            .iter()
            .filter(|fp| !self.is_bad_guard(fp))
            .collect()
    }

    /// Record a guard failure
    pub fn record_failure(&mut self, fingerprint: &str, error: &str) {
        let failure = self
            .failed_guards
            .entry(fingerprint.to_string())
            .or_default();

        failure.consecutive_failures += 1;
        failure.last_failure_time = unix_now();
        failure.last_error = error.to_string();

        log::warn!(
            "Guard {} failed ({} times): {}",
            &fingerprint[..8.min(fingerprint.len())],
            failure.consecutive_failures,
            error
        );

        if failure.consecutive_failures >= MAX_FAILURES_BEFORE_BAD {
            self.mark_bad(fingerprint);
        }
    }

    /// Record a guard success (clears failure count)
    pub fn record_success(&mut self, fingerprint: &str) {
        self.failed_guards.remove(fingerprint);
        self.bad_guards.remove(fingerprint);
    }

    fn mark_bad(&mut self, fingerprint: &str) {
        let bad_until = unix_now() + BAD_GUARD_TIMEOUT_SECS;
        self.bad_guards.insert(fingerprint.to_string(), bad_until);
        log::warn!(
            "Guard {} benched for {}s",
            &fingerprint[..8.min(fingerprint.len())],
            BAD_GUARD_TIMEOUT_SECS
        );
    }

    pub fn is_bad_guard(&self, fingerprint: &str) -> bool {
        self.bad_guards
            .get(fingerprint)
            .map_or(false, |&bad_until| unix_now() < bad_until)
    }

    /// Serialize state to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TorError::ParseError(format!("guard state: {}", e)))
    }

    /// Deserialize state from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TorError::ParseError(format!("guard state: {}", e)))
    }

    /// Drop expired benchings and failures older than a day
    pub fn cleanup(&mut self) {
        let now = unix_now();
        self.bad_guards.retain(|_, &mut bad_until| now < bad_until);
        let one_day_ago = now.saturating_sub(24 * 60 * 60);
        self.failed_guards
            .retain(|_, info| info.last_failure_time > one_day_ago);
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// An open guard connection with its reactor
pub struct GuardHandle {
    ctx: TorContext,
    channel: Arc<Channel>,
    directory: Arc<DirectoryClient>,
    reactor: ReactorThread,
}

impl GuardHandle {
    pub(crate) fn new(
        ctx: TorContext,
        channel: Arc<Channel>,
        directory: Arc<DirectoryClient>,
    ) -> Result<Self> {
        let reactor = ReactorThread::spawn(&format!("tor-reactor-{}", channel.guard().nickname))?;
        Ok(Self {
            ctx,
            channel,
            directory,
            reactor,
        })
    }

    /// The guard relay
    pub fn relay(&self) -> &Relay {
        self.channel.guard()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Build a circuit of `hops` hops starting at this guard
    pub fn create_circuit(&self, hops: usize) -> Result<Circuit> {
        self.builder().build_circuit(hops)
    }

    /// Build a circuit whose exit accepts `port`
    pub fn create_circuit_for_port(&self, hops: usize, port: u16) -> Result<Circuit> {
        self.builder().build_circuit_for_port(hops, port)
    }

    fn builder(&self) -> CircuitBuilder {
        CircuitBuilder::new(self.ctx.clone(), self.channel.clone(), self.directory.clone())
    }

    /// Watch `source` on this guard's reactor. The callback runs on the
    /// reactor thread; a close arrives as an empty `CLOSED` event, after
    /// which the registration is gone.
    pub fn register<S, F>(&self, source: S, interest: Interest, callback: F) -> Result<Token>
    where
        S: Source + 'static,
        F: FnMut(&Event) + Send + 'static,
    {
        self.reactor.registry().register(source, interest, callback)
    }

    /// Remove a registration; unknown tokens are ignored
    pub fn unregister(&self, token: Token) {
        self.reactor.registry().unregister(token);
    }

    /// Registry handle, for use inside callbacks
    pub fn registry(&self) -> Registry {
        self.reactor.registry().clone()
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.reactor.registry().shutdown();
        self.channel.shutdown();
        log::debug!(
            target: self.ctx.log_target(),
            "Guard handle for {} released",
            self.channel.guard().nickname
        );
    }
}

impl std::fmt::Debug for GuardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardHandle")
            .field("guard", &self.channel.guard().nickname)
            .field("open", &self.channel.is_open())
            .field("registrations", &self.reactor.registry().len())
            .finish()
    }
}
