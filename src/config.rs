//! Client configuration
//!
//! `TorConfig` is plain data: it can be built in code with the `with_*`
//! setters or loaded from JSON. Durations are stored in milliseconds so the
//! JSON form stays readable.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A directory authority or fallback directory reachable over plain HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryAuthority {
    pub name: String,
    /// host:port of the directory port
    pub address: String,
    /// v3 identity fingerprint (hex)
    #[serde(default)]
    pub v3ident: String,
}

impl DirectoryAuthority {
    pub fn new(name: &str, address: &str, v3ident: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            v3ident: v3ident.to_string(),
        }
    }
}

/// The public directory authorities
pub fn default_authorities() -> Vec<DirectoryAuthority> {
    vec![
        DirectoryAuthority::new("moria1", "128.31.0.39:9231", "D586D18309DED4CD6D57C18FDB97EFA96D330566"),
        DirectoryAuthority::new("tor26", "217.196.147.77:80", "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4"),
        DirectoryAuthority::new("dizum", "45.66.35.11:80", "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58"),
        DirectoryAuthority::new("gabelmoo", "131.188.40.189:80", "ED03BB616EB2F60BEC80151114BB25CEF515B226"),
        DirectoryAuthority::new("dannenberg", "193.23.244.244:80", "0232AF901C31A04EE9848595AF9BB7620D4C5B2E"),
        DirectoryAuthority::new("maatuska", "171.25.193.9:443", "49015F787433103580E3B66A1707A00E60F2D15B"),
        DirectoryAuthority::new("Faravahar", "216.218.219.41:80", "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97"),
        DirectoryAuthority::new("longclaw", "199.58.81.140:80", "23D15D965BC35114467363C165C4F724B64B4F66"),
        DirectoryAuthority::new("bastet", "204.13.164.118:80", "27102BC123E7AF1D4741AE047E160C91ADC76B21"),
    ]
}

/// Configuration for [`crate::TorClient`] and everything below it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Hops per circuit when the caller does not say otherwise
    pub default_hops: usize,

    /// TCP connect timeout for relays and directories
    pub connect_timeout_ms: u64,

    /// Link handshake (VERSIONS .. NETINFO) timeout
    pub link_handshake_timeout_ms: u64,

    /// Per-hop CREATE2 / EXTEND2 timeout
    pub hop_timeout_ms: u64,

    /// Timeout for a whole directory request
    pub directory_timeout_ms: u64,

    /// Timeout waiting for RELAY_CONNECTED after BEGIN
    pub stream_connect_timeout_ms: u64,

    /// Blocking `recv` / `send` timeout
    pub stream_timeout_ms: u64,

    /// Candidates tried per hop when an extend is refused with TRUNCATED
    pub max_hop_attempts: usize,

    /// Guards tried before `get_guard` gives up
    pub max_guard_attempts: usize,

    /// Number of sampled guards kept in the guard set
    pub guard_sample_size: usize,

    /// Open streams allowed on one circuit
    pub max_streams_per_circuit: usize,

    /// Descriptors fetched per consensus refresh
    pub descriptor_sample_size: usize,

    /// Upper bound on consensus cache age regardless of fresh-until
    pub max_consensus_age_secs: u64,

    /// Refuse two relays from the same /16 in one path
    pub enforce_distinct_subnets: bool,

    /// Wrap relay connections in TLS
    pub use_tls: bool,

    /// Link protocol versions offered in VERSIONS
    pub link_versions: Vec<u16>,

    /// Guard fingerprints to try first
    pub preferred_guards: Vec<String>,

    /// Directory sources, tried in order
    pub authorities: Vec<DirectoryAuthority>,

    /// `log` target used by this client
    pub log_target: String,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            default_hops: 3,
            connect_timeout_ms: 10_000,
            link_handshake_timeout_ms: 15_000,
            hop_timeout_ms: 10_000,
            directory_timeout_ms: 30_000,
            stream_connect_timeout_ms: 30_000,
            stream_timeout_ms: 60_000,
            max_hop_attempts: 3,
            max_guard_attempts: 3,
            guard_sample_size: 3,
            max_streams_per_circuit: 50,
            descriptor_sample_size: 96,
            max_consensus_age_secs: 3 * 60 * 60,
            enforce_distinct_subnets: true,
            use_tls: true,
            link_versions: vec![4, 5],
            preferred_guards: Vec::new(),
            authorities: default_authorities(),
            log_target: "tor_native".to_string(),
        }
    }
}

impl TorConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TorError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: TorConfig =
            serde_json::from_str(text).map_err(|e| TorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TorError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_hops == 0 {
            return Err(TorError::Config("default_hops must be at least 1".into()));
        }
        if self.max_hop_attempts == 0 || self.max_guard_attempts == 0 {
            return Err(TorError::Config("attempt limits must be at least 1".into()));
        }
        if self.max_streams_per_circuit == 0 || self.max_streams_per_circuit > u16::MAX as usize {
            return Err(TorError::Config(format!(
                "max_streams_per_circuit out of range: {}",
                self.max_streams_per_circuit
            )));
        }
        if !self.link_versions.iter().any(|&v| v >= 4) {
            return Err(TorError::Config(
                "link_versions must offer version 4 or newer".into(),
            ));
        }
        Ok(())
    }

    pub fn with_default_hops(mut self, hops: usize) -> Self {
        self.default_hops = hops;
        self
    }

    pub fn with_hop_timeout(mut self, timeout: Duration) -> Self {
        self.hop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_directory_timeout(mut self, timeout: Duration) -> Self {
        self.directory_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_hop_attempts(mut self, attempts: usize) -> Self {
        self.max_hop_attempts = attempts;
        self
    }

    pub fn with_max_streams_per_circuit(mut self, max: usize) -> Self {
        self.max_streams_per_circuit = max;
        self
    }

    pub fn with_authorities(mut self, authorities: Vec<DirectoryAuthority>) -> Self {
        self.authorities = authorities;
        self
    }

    pub fn with_preferred_guards(mut self, guards: Vec<String>) -> Self {
        self.preferred_guards = guards;
        self
    }

    pub fn with_log_target(mut self, target: &str) -> Self {
        self.log_target = target.to_string();
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    pub fn without_subnet_rule(mut self) -> Self {
        self.enforce_distinct_subnets = false;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn link_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.link_handshake_timeout_ms)
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn stream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_connect_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn max_consensus_age(&self) -> Duration {
        Duration::from_secs(self.max_consensus_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_hops, 3);
        assert_eq!(config.authorities.len(), 9);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TorConfig::from_json(r#"{ "default_hops": 2, "use_tls": false }"#).unwrap();
        assert_eq!(config.default_hops, 2);
        assert!(!config.use_tls);
        assert_eq!(config.max_hop_attempts, 3);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = TorConfig::default()
            .with_hop_timeout(Duration::from_millis(250))
            .with_log_target("test");
        let parsed = TorConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.hop_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(TorConfig::from_json(r#"{ "default_hops": 0 }"#).is_err());
        assert!(TorConfig::from_json(r#"{ "link_versions": [3] }"#).is_err());
        assert!(TorConfig::from_json("not json").is_err());
    }
}
