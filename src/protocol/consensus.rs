//! Tor consensus and descriptor parsing
//!
//! Parses the network consensus document from directory authorities,
//! extracting relay entries and metadata, and the server descriptors that
//! carry the ntor onion keys and family declarations.

use super::relay::{ExitPolicy, Relay, RelayFlags};
use crate::error::{Result, TorError};
use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parsed consensus document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    /// Consensus valid-after time (unix seconds)
    pub valid_after: u64,

    /// Consensus fresh-until time
    pub fresh_until: u64,

    /// Consensus valid-until time
    pub valid_until: u64,

    /// All relays in the consensus
    pub relays: Vec<Relay>,

    /// Consensus version
    pub version: u32,
}

impl Consensus {
    /// Check if this consensus is still fresh at `now`
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.fresh_until
    }

    /// Check if this consensus is still valid at `now`
    pub fn is_valid(&self, now: u64) -> bool {
        now < self.valid_until
    }

    pub fn running_relays(&self) -> Vec<&Relay> {
        self.relays.iter().filter(|r| r.is_running()).collect()
    }

    /// Merge descriptor data (ntor keys, families) into the relay list
    pub fn apply_descriptors(&mut self, descriptors: &HashMap<String, DescriptorInfo>) -> usize {
        let mut applied = 0;
        for relay in &mut self.relays {
            if let Some(desc) = descriptors.get(&relay.fingerprint) {
                relay.ntor_onion_key = Some(desc.ntor_onion_key.clone());
                if desc.family.is_some() {
                    relay.family = desc.family.clone();
                }
                applied += 1;
            }
        }
        applied
    }
}

/// Consensus parser
pub struct ConsensusParser;

impl ConsensusParser {
    /// Parse a consensus document
    pub fn parse(data: &[u8]) -> Result<Consensus> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TorError::Directory(format!("Invalid UTF-8 in consensus: {}", e)))?;

        Self::parse_text(text)
    }

    /// Parse consensus from text
    pub fn parse_text(text: &str) -> Result<Consensus> {
        let mut valid_after = 0;
        let mut fresh_until = 0;
        let mut valid_until = 0;
        let mut version = 3;
        let mut relays = Vec::new();

        let mut current_relay: Option<RelayBuilder> = None;

        for line in text.lines() {
            let line = line.trim();
            let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));

            match keyword {
                "network-status-version" => {
                    version = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(3);
                }
                "valid-after" => valid_after = parse_timestamp(rest)?,
                "fresh-until" => fresh_until = parse_timestamp(rest)?,
                "valid-until" => valid_until = parse_timestamp(rest)?,
                "r" => {
                    if let Some(builder) = current_relay.take() {
                        relays.push(builder.build());
                    }
                    match Self::parse_r_line(rest) {
                        Ok(builder) => current_relay = Some(builder),
                        Err(e) => log::debug!("Skipping relay entry: {}", e),
                    }
                }
                "s" => {
                    if let Some(ref mut builder) = current_relay {
                        builder.flags = RelayFlags::from_string(rest);
                    }
                }
                "w" => {
                    if let Some(ref mut builder) = current_relay {
                        if let Some(bw) = Self::parse_bandwidth(rest) {
                            builder.bandwidth = bw;
                        }
                    }
                }
                "p" => {
                    if let Some(ref mut builder) = current_relay {
                        match ExitPolicy::parse(rest) {
                            Ok(policy) => builder.exit_policy = policy,
                            Err(e) => log::debug!("{}: {}", builder.nickname, e),
                        }
                    }
                }
                "directory-footer" => break,
                _ => {}
            }
        }

        if let Some(builder) = current_relay {
            relays.push(builder.build());
        }

        if valid_until == 0 {
            return Err(TorError::Directory("consensus has no valid-until".into()));
        }

        Ok(Consensus {
            valid_after,
            fresh_until,
            valid_until,
            version,
            relays,
        })
    }

    /// Parse the body of an "r" line
    ///
    /// Full consensus: nickname identity digest date time IP ORPort DirPort.
    /// Microdescriptor consensus omits the digest.
    fn parse_r_line(rest: &str) -> Result<RelayBuilder> {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        let base = match parts.len() {
            8 => 3,
            7 => 2,
            _ => return Err(TorError::Directory(format!("Invalid r line: {}", rest))),
        };

        let nickname = parts[0].to_string();
        let fingerprint = identity_to_hex(parts[1])?;
        let published = parse_timestamp(&format!("{} {}", parts[base], parts[base + 1]))?;

        let address: IpAddr = parts[base + 2]
            .parse()
            .map_err(|_| TorError::Directory(format!("Invalid IP address: {}", parts[base + 2])))?;
        let or_port: u16 = parts[base + 3]
            .parse()
            .map_err(|_| TorError::Directory("Invalid OR port".into()))?;
        let dir_port = parts
            .get(base + 4)
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|&p| p != 0);

        Ok(RelayBuilder {
            nickname,
            fingerprint,
            address,
            or_port,
            dir_port,
            flags: RelayFlags::default(),
            bandwidth: 0,
            published,
            exit_policy: ExitPolicy::default(),
        })
    }

    /// Parse bandwidth from a "w" line body: Bandwidth=12345 [Unmeasured=1]
    fn parse_bandwidth(rest: &str) -> Option<u64> {
        rest.split_whitespace()
            .find_map(|part| part.strip_prefix("Bandwidth="))
            .and_then(|bw| bw.parse().ok())
    }
}

/// "YYYY-MM-DD HH:MM:SS" (UTC) to unix seconds
pub fn parse_timestamp(value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|e| TorError::ParseError(format!("bad timestamp {:?}: {}", value, e)))?;
    u64::try_from(parsed.and_utc().timestamp())
        .map_err(|_| TorError::ParseError(format!("timestamp before epoch: {}", value)))
}

/// Base64 identity digest (as found in "r" lines) to uppercase hex
pub fn identity_to_hex(identity: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(identity.trim_end_matches('='))
        .map_err(|e| TorError::Directory(format!("Invalid identity {}: {}", identity, e)))?;
    if raw.len() != 20 {
        return Err(TorError::Directory(format!(
            "identity digest is {} bytes",
            raw.len()
        )));
    }
    Ok(hex::encode_upper(raw))
}

/// Builder for constructing a Relay from consensus data
struct RelayBuilder {
    nickname: String,
    fingerprint: String,
    address: IpAddr,
    or_port: u16,
    dir_port: Option<u16>,
    flags: RelayFlags,
    bandwidth: u64,
    published: u64,
    exit_policy: ExitPolicy,
}

impl RelayBuilder {
    fn build(self) -> Relay {
        Relay {
            nickname: self.nickname,
            fingerprint: self.fingerprint,
            address: self.address,
            or_port: self.or_port,
            dir_port: self.dir_port,
            flags: self.flags,
            bandwidth: self.bandwidth,
            published: self.published,
            ntor_onion_key: None,
            exit_policy: self.exit_policy,
            family: None,
        }
    }
}

/// The parts of a server descriptor the client needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub nickname: String,
    pub ntor_onion_key: String,
    pub family: Option<String>,
}

/// Server descriptor parser
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parse a concatenation of server descriptors, keyed by fingerprint.
    ///
    /// Descriptors without a fingerprint or ntor key are skipped.
    pub fn parse_text(text: &str) -> HashMap<String, DescriptorInfo> {
        let mut out = HashMap::new();
        let mut nickname = String::new();
        let mut fingerprint: Option<String> = None;
        let mut ntor_key: Option<String> = None;
        let mut family: Option<String> = None;

        let mut flush = |nickname: &str,
                         fingerprint: &mut Option<String>,
                         ntor_key: &mut Option<String>,
                         family: &mut Option<String>| {
            if let (Some(fp), Some(key)) = (fingerprint.take(), ntor_key.take()) {
                out.insert(
                    fp,
                    DescriptorInfo {
                        nickname: nickname.to_string(),
                        ntor_onion_key: key,
                        family: family.take(),
                    },
                );
            }
            *fingerprint = None;
            *ntor_key = None;
            *family = None;
        };

        for line in text.lines() {
            let line = line.trim();
            let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
            match keyword {
                "router" => {
                    flush(&nickname, &mut fingerprint, &mut ntor_key, &mut family);
                    nickname = rest.split_whitespace().next().unwrap_or_default().to_string();
                }
                "fingerprint" => {
                    let fp: String = rest.split_whitespace().collect();
                    fingerprint = Some(fp.to_ascii_uppercase());
                }
                "ntor-onion-key" => {
                    ntor_key = rest.split_whitespace().next().map(str::to_string);
                }
                "family" => family = Some(rest.to_string()),
                _ => {}
            }
        }
        flush(&nickname, &mut fingerprint, &mut ntor_key, &mut family);

        log::debug!("Parsed {} descriptors with ntor keys", out.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "network-status-version 3\n\
        valid-after 2024-01-01 00:00:00\n\
        fresh-until 2024-01-01 01:00:00\n\
        valid-until 2024-01-01 03:00:00\n\
        r TestRelay AAECAwQFBgcICQoLDA0ODxAREhM ZGlnZXN0ZGlnZXN0ZGlnZXN0ZGk 2023-12-31 23:10:00 1.2.3.4 9001 9030\n\
        s Fast Guard Running Stable Valid\n\
        w Bandwidth=1000000\n\
        p reject 1-65535\n\
        r ExitRelay FBMSERAPDg0MCwoJCAcGBQQDAgE 2023-12-31 22:00:00 5.6.7.8 443 0\n\
        s Exit Fast Running Valid\n\
        w Bandwidth=2000 Unmeasured=1\n\
        p accept 80,443\n\
        directory-footer\n";

    #[test]
    fn test_parse_consensus_basic() {
        let consensus = ConsensusParser::parse_text(SAMPLE).unwrap();
        assert_eq!(consensus.version, 3);
        assert_eq!(consensus.valid_after, 1_704_067_200);
        assert_eq!(consensus.fresh_until, 1_704_070_800);
        assert_eq!(consensus.valid_until, 1_704_078_000);
        assert_eq!(consensus.relays.len(), 2);

        let relay = &consensus.relays[0];
        assert_eq!(relay.nickname, "TestRelay");
        assert_eq!(relay.fingerprint, "000102030405060708090A0B0C0D0E0F10111213");
        assert_eq!(relay.or_port, 9001);
        assert_eq!(relay.dir_port, Some(9030));
        assert!(relay.flags.fast);
        assert!(relay.flags.guard);
        assert_eq!(relay.bandwidth, 1_000_000);

        let exit = &consensus.relays[1];
        assert_eq!(exit.dir_port, None);
        assert!(exit.exit_policy.allows_port(443));
        assert!(!exit.exit_policy.allows_port(22));
    }

    #[test]
    fn test_freshness() {
        let consensus = ConsensusParser::parse_text(SAMPLE).unwrap();
        assert!(consensus.is_fresh(1_704_067_201));
        assert!(!consensus.is_fresh(1_704_070_800));
        assert!(consensus.is_valid(1_704_070_800));
        assert!(!consensus.is_valid(1_704_078_000));
    }

    #[test]
    fn test_missing_validity_rejected() {
        assert!(ConsensusParser::parse_text("network-status-version 3\n").is_err());
    }

    #[test]
    fn test_descriptor_parsing_and_merge() {
        let descriptors = "router TestRelay 1.2.3.4 9001 0 9030\n\
            fingerprint 0001 0203 0405 0607 0809 0A0B 0C0D 0E0F 1011 1213\n\
            ntor-onion-key AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\n\
            family $FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF\n\
            router-signature\n\
            router NoKey 9.9.9.9 9001 0 0\n\
            fingerprint AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA\n";

        let parsed = DescriptorParser::parse_text(descriptors);
        assert_eq!(parsed.len(), 1);
        let info = &parsed["000102030405060708090A0B0C0D0E0F10111213"];
        assert_eq!(info.nickname, "TestRelay");
        assert!(info.family.is_some());

        let mut consensus = ConsensusParser::parse_text(SAMPLE).unwrap();
        assert_eq!(consensus.apply_descriptors(&parsed), 1);
        assert!(consensus.relays[0].ntor_key().is_ok());
        assert!(consensus.relays[1].ntor_onion_key.is_none());
    }
}
