//! Tor relay types and selection logic
//!
//! Defines relay metadata and provides algorithms for selecting
//! guard, middle, and exit nodes based on consensus data.

use crate::error::{Result, TorError};
use base64::Engine;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use x25519_dalek::PublicKey;

/// A Tor relay from the consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Fingerprint (hex-encoded SHA-1 of the RSA identity key, uppercase)
    pub fingerprint: String,

    /// IPv4/IPv6 address
    pub address: IpAddr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Directory port (optional)
    pub dir_port: Option<u16>,

    /// Relay flags
    pub flags: RelayFlags,

    /// Bandwidth weight from the consensus
    pub bandwidth: u64,

    /// Publication time (unix seconds)
    pub published: u64,

    /// ntor onion key, base64 (from the descriptor)
    pub ntor_onion_key: Option<String>,

    /// Exit policy summary (`p` line)
    #[serde(default)]
    pub exit_policy: ExitPolicy,

    /// Family declaration (from descriptor)
    /// Format: "$<fingerprint> $<fingerprint> ..."
    #[serde(default)]
    pub family: Option<String>,
}

impl Relay {
    /// Get the SocketAddr for connecting to this relay
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Check if this relay can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast && self.flags.running
    }

    /// Check if this relay can be used as an exit
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.flags.running
    }

    /// Check if this relay is suitable as a middle relay
    pub fn is_middle(&self) -> bool {
        self.flags.fast && self.flags.running
    }

    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    /// Whether this exit accepts connections to `port`
    pub fn allows_exit_port(&self, port: u16) -> bool {
        self.is_exit() && self.exit_policy.allows_port(port)
    }

    /// Raw 20-byte identity digest
    pub fn identity_bytes(&self) -> Result<[u8; 20]> {
        let raw = hex::decode(&self.fingerprint).map_err(|e| {
            TorError::InvalidRelay(format!("{}: bad fingerprint: {}", self.nickname, e))
        })?;
        raw.try_into().map_err(|_| {
            TorError::InvalidRelay(format!("{}: fingerprint is not 20 bytes", self.nickname))
        })
    }

    /// Decoded curve25519 ntor onion key
    pub fn ntor_key(&self) -> Result<PublicKey> {
        let encoded = self.ntor_onion_key.as_deref().ok_or_else(|| {
            TorError::InvalidRelay(format!("{} has no ntor onion key", self.nickname))
        })?;
        let raw = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .map_err(|e| {
                TorError::InvalidRelay(format!("{}: bad ntor key: {}", self.nickname, e))
            })?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            TorError::InvalidRelay(format!("{}: ntor key is not 32 bytes", self.nickname))
        })?;
        Ok(PublicKey::from(bytes))
    }

    /// Fingerprints (uppercase hex, no `$`) declared in the family line
    pub fn family_members(&self) -> HashSet<String> {
        self.family
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .filter_map(|member| {
                let member = member.trim_start_matches('$');
                let fp = member.split(['~', '=']).next().unwrap_or_default();
                (fp.len() == 40).then(|| fp.to_ascii_uppercase())
            })
            .collect()
    }

    /// /16 network for IPv4, /32 for IPv6
    fn subnet_key(&self) -> Vec<u8> {
        match self.address {
            IpAddr::V4(v4) => v4.octets()[..2].to_vec(),
            IpAddr::V6(v6) => v6.octets()[..4].to_vec(),
        }
    }

    fn display_name(&self) -> String {
        format!(
            "{} (${})",
            self.nickname,
            &self.fingerprint[..8.min(self.fingerprint.len())]
        )
    }
}

impl std::fmt::Display for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Relay flags from consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Authority - directory authority
    pub authority: bool,

    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast relay
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// HSDir - hidden service directory
    pub hs_dir: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable relay
    pub stable: bool,

    /// V2Dir - version 2 directory protocol
    pub v2_dir: bool,

    /// Valid - valid relay descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from an `s` line body
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {}
            }
        }

        relay_flags
    }
}

/// Exit policy summary: `accept 80,443,1000-2000` or `reject 1-65535`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    pub accept: bool,
    pub ranges: Vec<(u16, u16)>,
}

impl ExitPolicy {
    pub fn parse(summary: &str) -> Result<Self> {
        let mut parts = summary.split_whitespace();
        let accept = match parts.next() {
            Some("accept") => true,
            Some("reject") => false,
            other => {
                return Err(TorError::ParseError(format!(
                    "bad exit policy keyword: {:?}",
                    other
                )))
            }
        };

        let list = parts.next().unwrap_or_default();
        let mut ranges = Vec::new();
        for item in list.split(',').filter(|s| !s.is_empty()) {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (lo, hi),
                None => (item, item),
            };
            let lo: u16 = lo
                .parse()
                .map_err(|_| TorError::ParseError(format!("bad port in policy: {}", item)))?;
            let hi: u16 = hi
                .parse()
                .map_err(|_| TorError::ParseError(format!("bad port in policy: {}", item)))?;
            if lo > hi {
                return Err(TorError::ParseError(format!("inverted port range: {}", item)));
            }
            ranges.push((lo, hi));
        }

        Ok(Self { accept, ranges })
    }

    pub fn accept_all() -> Self {
        Self {
            accept: true,
            ranges: vec![(1, 65535)],
        }
    }

    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self.ranges.iter().any(|&(lo, hi)| lo <= port && port <= hi);
        listed == self.accept
    }
}

/// Position a relay is selected for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Guard,
    Middle,
    Exit,
}

/// Criteria for [`RelaySelector::filter`] and directory lookups
#[derive(Debug, Clone, Default)]
pub struct RelayFilter {
    pub role: Option<RelayRole>,
    /// Exit must accept this port
    pub exit_port: Option<u16>,
    /// Fingerprints that must not be returned
    pub exclude: HashSet<String>,
}

impl RelayFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn guard() -> Self {
        Self {
            role: Some(RelayRole::Guard),
            ..Default::default()
        }
    }

    pub fn middle() -> Self {
        Self {
            role: Some(RelayRole::Middle),
            ..Default::default()
        }
    }

    pub fn exit(port: Option<u16>) -> Self {
        Self {
            role: Some(RelayRole::Exit),
            exit_port: port,
            ..Default::default()
        }
    }

    pub fn excluding<'a>(mut self, fingerprints: impl IntoIterator<Item = &'a str>) -> Self {
        self.exclude
            .extend(fingerprints.into_iter().map(str::to_string));
        self
    }

    pub fn matches(&self, relay: &Relay) -> bool {
        if relay.ntor_onion_key.is_none() || self.exclude.contains(&relay.fingerprint) {
            return false;
        }
        match self.role {
            None => relay.is_running(),
            Some(RelayRole::Guard) => relay.is_guard(),
            Some(RelayRole::Middle) => relay.is_middle(),
            Some(RelayRole::Exit) => match self.exit_port {
                Some(port) => relay.allows_exit_port(port),
                None => relay.is_exit(),
            },
        }
    }
}

/// Why a candidate cannot join a partially built path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathConflict {
    SameRelay,
    SameFamily,
    SameSubnet,
}

/// Relays declare family membership both ways; a one-sided claim is ignored.
pub fn relays_share_family(a: &Relay, b: &Relay) -> bool {
    a.family_members().contains(&b.fingerprint.to_ascii_uppercase())
        && b.family_members().contains(&a.fingerprint.to_ascii_uppercase())
}

/// Check a candidate against the relays already on the path
pub fn path_conflict(
    candidate: &Relay,
    path: &[Relay],
    enforce_distinct_subnets: bool,
) -> Option<PathConflict> {
    for hop in path {
        if hop.fingerprint.eq_ignore_ascii_case(&candidate.fingerprint) {
            return Some(PathConflict::SameRelay);
        }
        if relays_share_family(hop, candidate) {
            return Some(PathConflict::SameFamily);
        }
        if enforce_distinct_subnets && hop.subnet_key() == candidate.subnet_key() {
            return Some(PathConflict::SameSubnet);
        }
    }
    None
}

/// Relay selection over one consensus snapshot
#[derive(Clone)]
pub struct RelaySelector {
    relays: Vec<Relay>,
}

impl RelaySelector {
    pub fn new(relays: Vec<Relay>) -> Self {
        Self { relays }
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    /// All relays matching the filter
    pub fn filter(&self, filter: &RelayFilter) -> Vec<&Relay> {
        self.relays.iter().filter(|r| filter.matches(r)).collect()
    }

    /// Bandwidth-weighted choice of a relay that fits after `path`
    pub fn select(
        &self,
        filter: &RelayFilter,
        path: &[Relay],
        enforce_distinct_subnets: bool,
    ) -> Option<&Relay> {
        let candidates: Vec<&Relay> = self
            .relays
            .iter()
            .filter(|r| filter.matches(r))
            .filter(|r| path_conflict(r, path, enforce_distinct_subnets).is_none())
            .collect();

        let mut rng = rand::thread_rng();
        candidates
            .choose_weighted(&mut rng, |r| r.bandwidth.max(1))
            .ok()
            .copied()
    }

    /// Up to `count` distinct guard candidates, preferred fingerprints first
    pub fn select_guards(&self, count: usize, preferred: &[String]) -> Vec<&Relay> {
        let filter = RelayFilter::guard();
        let mut selected: Vec<&Relay> = Vec::new();

        for fp in preferred {
            if selected.len() >= count {
                break;
            }
            match self
                .relays
                .iter()
                .find(|r| r.fingerprint.eq_ignore_ascii_case(fp) && filter.matches(r))
            {
                Some(relay) => selected.push(relay),
                None => log::debug!("Preferred guard {} not usable in consensus", fp),
            }
        }

        let mut rest: Vec<&Relay> = self
            .filter(&filter)
            .into_iter()
            .filter(|r| !selected.iter().any(|s| s.fingerprint == r.fingerprint))
            .collect();
        rest.shuffle(&mut rand::thread_rng());
        // Favour bandwidth while keeping the shuffle order among equals
        rest.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
        let needed = count.saturating_sub(selected.len());
        selected.extend(rest.into_iter().take(needed));
        selected
    }

    pub fn count(&self) -> usize {
        self.relays.len()
    }

    pub fn running_count(&self) -> usize {
        self.relays.iter().filter(|r| r.is_running()).count()
    }
}
