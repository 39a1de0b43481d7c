//! Circuit builder
//!
//! Builds circuits hop by hop over an open channel: CREATE2 to the guard,
//! then EXTEND2 (in RELAY_EARLY) through the circuit for every further hop.
//! Every hop uses the ntor handshake.
//!
//! A hop whose extend is answered with TRUNCATED is retried with another
//! candidate. So is one that times out or answers with a reply that fails
//! the handshake: the circuit is first cut back with RELAY_TRUNCATE to the
//! last good hop. DESTROY aborts the build; an aborted circuit is destroyed
//! and its ID released.

use super::cell::{RelayCell, RelayCommand};
use super::circuit::{Circuit, CircuitCore, CircuitState, ControlMessage, DESTROY_REASON_NONE};
use super::directory::DirectoryClient;
use super::ntor::{
    derive_circuit_keys, parse_created2_payload, NtorHandshake, NTOR_HANDSHAKE_TYPE,
};
use super::relay::{Relay, RelayFilter};
use crate::channel::Channel;
use crate::context::TorContext;
use crate::error::{Result, TorError};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// Link specifier: TLS-over-TCP, IPv4 address and port
const LSTYPE_IPV4: u8 = 0x00;
/// Link specifier: TLS-over-TCP, IPv6 address and port
const LSTYPE_IPV6: u8 = 0x01;
/// Link specifier: legacy RSA identity digest
const LSTYPE_LEGACY_ID: u8 = 0x02;

/// Why one hop failed, and whether another candidate may be tried
enum HopFailure {
    /// The previous hop already dropped the half-built extension
    Truncated(String),
    /// No usable answer; the previous hop must be truncated before retrying
    Retry(String),
    Fatal(TorError),
}

/// Builds circuits over one guard channel
pub struct CircuitBuilder {
    ctx: TorContext,
    channel: Arc<Channel>,
    directory: Arc<DirectoryClient>,
}

impl CircuitBuilder {
    pub fn new(ctx: TorContext, channel: Arc<Channel>, directory: Arc<DirectoryClient>) -> Self {
        Self {
            ctx,
            channel,
            directory,
        }
    }

    /// Build a circuit of `hops` hops whose exit accepts any port
    pub fn build_circuit(&self, hops: usize) -> Result<Circuit> {
        self.build(hops, None)
    }

    /// Build a circuit whose exit policy accepts `port`
    pub fn build_circuit_for_port(&self, hops: usize, port: u16) -> Result<Circuit> {
        self.build(hops, Some(port))
    }

    fn build(&self, hops: usize, port: Option<u16>) -> Result<Circuit> {
        if hops == 0 {
            return Err(TorError::Config("a circuit needs at least one hop".into()));
        }

        let core = self.channel.allocate_circuit()?;
        log::info!(
            target: self.ctx.log_target(),
            "Building {}-hop circuit {:#010x} through {}",
            hops,
            core.id(),
            self.channel.guard().nickname
        );

        match self.build_hops(&core, hops, port) {
            Ok(()) => {
                core.set_state(CircuitState::Ready);
                log::info!(
                    target: self.ctx.log_target(),
                    "Circuit {:#010x} ready",
                    core.id()
                );
                Ok(Circuit::new(core))
            }
            Err((hops_built, cause)) => {
                // Releases the ID even when CREATE2 was never answered
                core.destroy(DESTROY_REASON_NONE);
                log::warn!(
                    target: self.ctx.log_target(),
                    "Circuit {:#010x} failed after {} hop(s): {}",
                    core.id(),
                    hops_built,
                    cause
                );
                Err(TorError::circuit_build(hops_built, cause))
            }
        }
    }

    fn build_hops(
        &self,
        core: &Arc<CircuitCore>,
        hops: usize,
        port: Option<u16>,
    ) -> std::result::Result<(), (usize, TorError)> {
        let guard = self.channel.guard().clone();
        self.create_first_hop(core, &guard).map_err(|e| (0, e))?;

        let mut path = vec![guard];
        for hop in 2..=hops {
            let filter = if hop == hops {
                RelayFilter::exit(port)
            } else {
                RelayFilter::middle()
            };
            let relay = self
                .extend_with_retry(core, hop, &path, filter)
                .map_err(|e| (path.len(), e))?;
            path.push(relay);
        }
        Ok(())
    }

    /// CREATE2 to the guard and wait for CREATED2
    fn create_first_hop(&self, core: &CircuitCore, guard: &Relay) -> Result<()> {
        let hop_error = |reason: String| TorError::CircuitExtend {
            hop: 1,
            relay: guard.nickname.clone(),
            reason,
        };

        let identity = guard.identity_bytes()?;
        let onion_key = guard.ntor_key()?;
        let handshake = NtorHandshake::new()?;
        let data = NtorHandshake::create_handshake_data(
            handshake.client_public_key(),
            &identity,
            &onion_key,
        );

        core.send_create2(NTOR_HANDSHAKE_TYPE, &data)?;
        let reply = match core.wait_control(self.ctx.config().hop_timeout(), "CREATED2") {
            Ok(ControlMessage::Created2(payload)) => payload,
            Ok(other) => return Err(hop_error(format!("expected CREATED2, got {:?}", other))),
            Err(e) => return Err(hop_error(e.to_string())),
        };

        let (server_public, auth) =
            parse_created2_payload(&reply).map_err(|e| hop_error(e.to_string()))?;
        let seed = handshake
            .complete(&identity, &onion_key, &server_public, &auth)
            .map_err(|e| hop_error(e.to_string()))?;
        let keys = derive_circuit_keys(&seed)?;
        core.add_hop(guard.clone(), &keys);

        log::debug!(
            target: self.ctx.log_target(),
            "Circuit {:#010x}: hop 1 is {}",
            core.id(),
            guard.nickname
        );
        Ok(())
    }

    /// Pick candidates for `hop` until one extends or the attempts run out
    fn extend_with_retry(
        &self,
        core: &CircuitCore,
        hop: usize,
        path: &[Relay],
        filter: RelayFilter,
    ) -> Result<Relay> {
        let attempts = self.ctx.config().max_hop_attempts;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_reason = String::from("no candidate");

        for attempt in 1..=attempts {
            let candidate_filter = filter
                .clone()
                .excluding(tried.iter().map(String::as_str));
            let relay = match self.directory.select_relay(&candidate_filter, path) {
                Ok(relay) => relay,
                Err(e) if attempt > 1 => {
                    return Err(TorError::CircuitExtend {
                        hop,
                        relay: "-".into(),
                        reason: format!("{}; {}", last_reason, e),
                    })
                }
                Err(e) => return Err(e),
            };
            tried.insert(relay.fingerprint.clone());

            match self.extend_to(core, hop, &relay) {
                Ok(()) => {
                    log::debug!(
                        target: self.ctx.log_target(),
                        "Circuit {:#010x}: hop {} is {}",
                        core.id(),
                        hop,
                        relay.nickname
                    );
                    return Ok(relay);
                }
                Err(HopFailure::Truncated(reason)) => {
                    log::info!(
                        target: self.ctx.log_target(),
                        "Extend to {} truncated ({}), attempt {}/{}",
                        relay.nickname,
                        reason,
                        attempt,
                        attempts
                    );
                    last_reason = format!("{} truncated: {}", relay.nickname, reason);
                }
                Err(HopFailure::Retry(reason)) => {
                    log::info!(
                        target: self.ctx.log_target(),
                        "Extend to {} failed ({}), attempt {}/{}",
                        relay.nickname,
                        reason,
                        attempt,
                        attempts
                    );
                    last_reason = format!("{}: {}", relay.nickname, reason);
                    if attempt < attempts {
                        self.truncate_after(core, hop)
                            .map_err(|e| TorError::CircuitExtend {
                                hop,
                                relay: relay.nickname.clone(),
                                reason: format!("{}; truncate failed: {}", reason, e),
                            })?;
                    }
                }
                Err(HopFailure::Fatal(e)) => return Err(e),
            }
        }

        Err(TorError::CircuitExtend {
            hop,
            relay: "-".into(),
            reason: format!("gave up after {} attempts ({})", attempts, last_reason),
        })
    }

    /// One EXTEND2 / EXTENDED2 exchange
    fn extend_to(
        &self,
        core: &CircuitCore,
        hop: usize,
        relay: &Relay,
    ) -> std::result::Result<(), HopFailure> {
        let identity = relay.identity_bytes().map_err(HopFailure::Fatal)?;
        let onion_key = relay.ntor_key().map_err(HopFailure::Fatal)?;
        let handshake = NtorHandshake::new().map_err(HopFailure::Fatal)?;
        let data = NtorHandshake::create_handshake_data(
            handshake.client_public_key(),
            &identity,
            &onion_key,
        );
        let payload = extend2_payload(relay, &identity, &data);

        // EXTEND2 goes to the current last hop
        let last_hop = hop - 2;
        core.send_control(last_hop, RelayCell::new(RelayCommand::Extend2, 0, payload), true)
            .map_err(HopFailure::Fatal)?;

        let reply = match core.wait_control(self.ctx.config().hop_timeout(), "EXTENDED2") {
            Ok(ControlMessage::Relay { cell, .. }) => cell,
            Ok(ControlMessage::Created2(_)) => {
                return Err(HopFailure::Retry("unexpected CREATED2 while extending".into()))
            }
            Err(e) if e.is_timeout() => return Err(HopFailure::Retry(e.to_string())),
            Err(e) => {
                return Err(HopFailure::Fatal(TorError::CircuitExtend {
                    hop,
                    relay: relay.nickname.clone(),
                    reason: e.to_string(),
                }))
            }
        };

        match reply.command {
            RelayCommand::Extended2 => {}
            RelayCommand::Truncated => {
                let reason = reply.data.first().copied().unwrap_or(0);
                return Err(HopFailure::Truncated(
                    crate::error::destroy_reason_name(reason).to_string(),
                ));
            }
            other => {
                return Err(HopFailure::Retry(format!("expected EXTENDED2, got {:?}", other)))
            }
        }

        let (server_public, auth) = parse_created2_payload(&reply.data)
            .map_err(|e| HopFailure::Retry(e.to_string()))?;
        let seed = handshake
            .complete(&identity, &onion_key, &server_public, &auth)
            .map_err(|e| HopFailure::Retry(e.to_string()))?;
        let keys = derive_circuit_keys(&seed).map_err(HopFailure::Fatal)?;
        core.add_hop(relay.clone(), &keys);
        Ok(())
    }

    /// RELAY_TRUNCATE to the last good hop, then wait for its TRUNCATED.
    /// Late replies to the abandoned extend are discarded.
    fn truncate_after(&self, core: &CircuitCore, hop: usize) -> Result<()> {
        let last_hop = hop - 2;
        core.send_control(last_hop, RelayCell::new(RelayCommand::Truncate, 0, Vec::new()), false)?;

        let deadline = Instant::now() + self.ctx.config().hop_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match core.wait_control(remaining, "TRUNCATED")? {
                ControlMessage::Relay { cell, .. } if cell.command == RelayCommand::Truncated => {
                    log::debug!(
                        target: self.ctx.log_target(),
                        "Circuit {:#010x} truncated back to hop {}",
                        core.id(),
                        last_hop + 1
                    );
                    return Ok(());
                }
                other => log::debug!(
                    target: self.ctx.log_target(),
                    "Circuit {:#010x}: discarding {:?} while truncating",
                    core.id(),
                    other
                ),
            }
        }
    }
}

/// EXTEND2 body:
///
/// ```text
/// NSPEC (1) | { LSTYPE (1) | LSLEN (1) | LSPEC }* | HTYPE (2) | HLEN (2) | HDATA
/// ```
pub fn extend2_payload(relay: &Relay, identity: &[u8; 20], handshake: &[u8]) -> Vec<u8> {
    let mut specs: Vec<Vec<u8>> = Vec::with_capacity(2);

    let addr = relay.socket_addr();
    let mut spec = match addr.ip() {
        IpAddr::V4(v4) => {
            let mut spec = vec![LSTYPE_IPV4, 6];
            spec.extend_from_slice(&v4.octets());
            spec
        }
        IpAddr::V6(v6) => {
            let mut spec = vec![LSTYPE_IPV6, 18];
            spec.extend_from_slice(&v6.octets());
            spec
        }
    };
    spec.extend_from_slice(&addr.port().to_be_bytes());
    specs.push(spec);

    let mut legacy = vec![LSTYPE_LEGACY_ID, 20];
    legacy.extend_from_slice(identity);
    specs.push(legacy);

    let mut payload = Vec::with_capacity(64 + handshake.len());
    payload.push(specs.len() as u8);
    for spec in specs {
        payload.extend_from_slice(&spec);
    }
    payload.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
    payload.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    payload.extend_from_slice(handshake);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::tests::relay;

    #[test]
    fn test_extend2_payload_layout() {
        let target = relay("middle", 0x42, "10.2.3.4", "Fast Running");
        let identity = target.identity_bytes().unwrap();
        let handshake = [7u8; 84];
        let payload = extend2_payload(&target, &identity, &handshake);

        assert_eq!(payload[0], 2);
        // IPv4 spec
        assert_eq!(&payload[1..3], &[LSTYPE_IPV4, 6]);
        assert_eq!(&payload[3..7], &[10, 2, 3, 4]);
        assert_eq!(&payload[7..9], &9001u16.to_be_bytes());
        // Legacy identity
        assert_eq!(&payload[9..11], &[LSTYPE_LEGACY_ID, 20]);
        assert_eq!(&payload[11..31], &identity);
        // Handshake
        assert_eq!(&payload[31..33], &[0, 2]);
        assert_eq!(&payload[33..35], &84u16.to_be_bytes());
        assert_eq!(&payload[35..], &handshake);
    }
}
