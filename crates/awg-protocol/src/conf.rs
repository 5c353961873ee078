//! Text-level editing of the tunnel daemon's config file
//!
//! The daemon owns the file format, so edits are line based and leave every
//! byte we do not touch exactly as it was: operator comments, ordering and
//! whitespace survive a round trip.

use ipnet::Ipv4Net;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use crate::error::{ProtocolError, Result};
use crate::params::{ObfuscationParam, ObfuscationParams, ParamValue};

const PEER_HEADER: &str = "[Peer]";

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Address\s*=\s*([0-9]+\.[0-9]+\.[0-9]+\.[0-9]+/[0-9]+)")
        .expect("valid address regex")
});

static LISTEN_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ims)\[Interface\].*?^\s*ListenPort\s*=\s*([0-9]+)")
        .expect("valid listen port regex")
});

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*#?\s*(H[1-4]|I[1-5]|Jc|Jmin|Jmax|S[1-4])\s*=\s*(.+)$")
        .expect("valid obfuscation param regex")
});

static APP_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\s*AppType\s*=\s*(\S+)\s*$").expect("valid app type regex")
});

/// A peer section to append
#[derive(Debug, Clone)]
pub struct PeerEntry<'a> {
    pub public_key: &'a str,
    pub preshared_key: &'a str,
    pub allowed_ips: &'a str,
    pub app_type: &'a str,
}

/// What we can read back from one `[Peer]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    pub public_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub app_type: Option<String>,
}

impl PeerSection {
    /// First IPv4 host in `AllowedIPs`
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.allowed_ips
            .iter()
            .find_map(|ip| ip.split('/').next().and_then(|host| host.parse().ok()))
    }
}

/// Interface subnet from the first `Address = a.b.c.d/n` line
pub fn interface_cidr(config: &str) -> Result<Ipv4Net> {
    let caps = ADDRESS_RE.captures(config).ok_or_else(|| {
        ProtocolError::ConfigFormat("Could not find subnet (Address) in protocol config".into())
    })?;
    let cidr = &caps[1];
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|e| ProtocolError::ConfigFormat(format!("invalid interface CIDR {cidr}: {e}")))?;
    Ok(net.trunc())
}

/// `a.b.c.0` derived from the interface address, as carried in client links
pub fn subnet_address(config: &str) -> Option<String> {
    let caps = ADDRESS_RE.captures(config)?;
    let host = caps[1].split('/').next()?;
    let (base, _) = host.rsplit_once('.')?;
    Some(format!("{base}.0"))
}

/// `ListenPort` of the `[Interface]` section
pub fn listen_port(config: &str) -> Result<u16> {
    let caps = LISTEN_PORT_RE.captures(config).ok_or_else(|| {
        ProtocolError::ConfigFormat("ListenPort not found in protocol config".into())
    })?;
    caps[1]
        .parse()
        .map_err(|e| ProtocolError::ConfigFormat(format!("invalid ListenPort {}: {e}", &caps[1])))
}

/// Obfuscation parameters found in the file, falling back to `defaults`.
///
/// Commented assignments (`# Jc = 4`) count too; the first occurrence of a
/// name wins.
pub fn extract_obfuscation_params(config: &str, defaults: &ObfuscationParams) -> ObfuscationParams {
    let mut params = defaults.clone();
    let mut seen = Vec::new();
    for caps in PARAM_RE.captures_iter(config) {
        let Ok(param) = caps[1].parse::<ObfuscationParam>() else {
            continue;
        };
        if seen.contains(&param) {
            continue;
        }
        seen.push(param);
        params.set(param, ParamValue::Text(caps[2].trim().to_string()));
    }
    params
}

/// Append a peer section.
///
/// A newline is added first if the text does not already end with one, and
/// the section is preceded by a blank separator line.
pub fn append_peer(config: &str, peer: &PeerEntry<'_>) -> String {
    let mut out = String::with_capacity(config.len() + 256);
    out.push_str(config);
    if !config.is_empty() && !config.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!(
        "\n{PEER_HEADER}\n# AppType = {}\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = {}\n",
        peer.app_type, peer.public_key, peer.preshared_key, peer.allowed_ips
    ));
    out
}

/// Remove every `[Peer]` section whose `PublicKey` equals `public_key`.
///
/// Returns the new text and the number of sections removed. Blank lines
/// directly in front of a removed section go with it; all other bytes are
/// kept in order. With nothing removed the text is returned unchanged.
pub fn remove_peer(config: &str, public_key: &str) -> (String, usize) {
    let lines: Vec<&str> = config.split_inclusive('\n').collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut removed = 0;

    for block in segment(&lines) {
        match block {
            Segment::Line(line) => kept.push(line),
            Segment::Peer(section) => {
                if section_key(section) == Some(public_key) {
                    while kept.last().is_some_and(|l| l.trim().is_empty()) {
                        kept.pop();
                    }
                    removed += 1;
                } else {
                    kept.extend_from_slice(section);
                }
            }
        }
    }

    if removed == 0 {
        return (config.to_string(), 0);
    }
    (kept.concat(), removed)
}

/// All `[Peer]` sections in file order
pub fn peer_sections(config: &str) -> Vec<PeerSection> {
    let lines: Vec<&str> = config.split_inclusive('\n').collect();
    segment(&lines)
        .into_iter()
        .filter_map(|block| match block {
            Segment::Peer(section) => Some(parse_section(section)),
            Segment::Line(_) => None,
        })
        .collect()
}

enum Segment<'a, 'b> {
    Line(&'a str),
    Peer(&'b [&'a str]),
}

fn is_header(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('[') && trimmed.ends_with(']')
}

/// Split lines into loose lines and peer blocks.
///
/// A peer block runs from a `[Peer]` header to just before the next header
/// or EOF, minus any trailing blank lines.
fn segment<'a, 'b>(lines: &'b [&'a str]) -> Vec<Segment<'a, 'b>> {
    let mut segments = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].trim() != PEER_HEADER {
            segments.push(Segment::Line(lines[i]));
            i += 1;
            continue;
        }

        let mut end = i + 1;
        while end < lines.len() && !is_header(lines[end]) {
            end += 1;
        }
        let mut body_end = end;
        while body_end > i + 1 && lines[body_end - 1].trim().is_empty() {
            body_end -= 1;
        }

        segments.push(Segment::Peer(&lines[i..body_end]));
        i = body_end;
    }

    segments
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn section_key<'a>(section: &[&'a str]) -> Option<&'a str> {
    section.iter().find_map(|line| match key_value(line) {
        Some(("PublicKey", value)) => Some(value),
        _ => None,
    })
}

fn parse_section(section: &[&str]) -> PeerSection {
    let mut parsed = PeerSection {
        public_key: section_key(section).map(str::to_string),
        allowed_ips: Vec::new(),
        app_type: None,
    };

    for line in section {
        if let Some(caps) = APP_TYPE_RE.captures(line) {
            if parsed.app_type.is_none() {
                parsed.app_type = Some(caps[1].to_string());
            }
            continue;
        }
        if let Some(("AllowedIPs", value)) = key_value(line) {
            parsed.allowed_ips.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string),
            );
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "[Interface]\n\
        PrivateKey = c2VydmVyLXByaXZhdGU=\n\
        Address = 10.8.1.1/24\n\
        ListenPort = 51820\n\
        Jc = 3\n\
        # H1 = 99\n\
        H1 = 12345\n";

    fn entry<'a>(key: &'a str, ip: &'a str) -> PeerEntry<'a> {
        PeerEntry {
            public_key: key,
            preshared_key: "cHNr",
            allowed_ips: ip,
            app_type: "amnezia_wg",
        }
    }

    #[test]
    fn test_interface_cidr_truncates_host_bits() {
        let net = interface_cidr(BASE).unwrap();
        assert_eq!(net.to_string(), "10.8.1.0/24");
    }

    #[test]
    fn test_missing_address_and_port_are_format_errors() {
        let config = "[Interface]\nPrivateKey = x\n";
        assert!(matches!(
            interface_cidr(config),
            Err(ProtocolError::ConfigFormat(_))
        ));
        assert!(matches!(listen_port(config), Err(ProtocolError::ConfigFormat(_))));
        assert_eq!(subnet_address(config), None);
    }

    #[test]
    fn test_listen_port_and_subnet_address() {
        assert_eq!(listen_port(BASE).unwrap(), 51820);
        assert_eq!(subnet_address(BASE).as_deref(), Some("10.8.1.0"));
    }

    #[test]
    fn test_extract_params_first_match_wins_and_defaults_fill() {
        let params = extract_obfuscation_params(BASE, &ObfuscationParams::builtin_defaults());
        assert_eq!(params.render(ObfuscationParam::Jc), "3");
        assert_eq!(params.render(ObfuscationParam::H1), "99");
        assert_eq!(params.get(ObfuscationParam::Jmax), Some(&ParamValue::Int(1000)));
    }

    #[test]
    fn test_append_peer_format() {
        let config = append_peer(BASE, &entry("K1", "10.8.1.2/32"));
        assert!(config.ends_with(
            "H1 = 12345\n\n[Peer]\n# AppType = amnezia_wg\nPublicKey = K1\nPresharedKey = cHNr\nAllowedIPs = 10.8.1.2/32\n"
        ));
    }

    #[test]
    fn test_append_without_trailing_newline() {
        let config = append_peer("[Interface]\nAddress = 10.8.0.1/24", &entry("K1", "10.8.0.2/32"));
        assert!(config.starts_with("[Interface]\nAddress = 10.8.0.1/24\n\n[Peer]\n"));
    }

    #[test]
    fn test_append_then_remove_restores_text() {
        let appended = append_peer(BASE, &entry("K1", "10.8.1.2/32"));
        let (restored, removed) = remove_peer(&appended, "K1");
        assert_eq!(removed, 1);
        assert_eq!(restored, BASE);
    }

    #[test]
    fn test_remove_absent_key_is_identity() {
        let config = append_peer(BASE, &entry("K1", "10.8.1.2/32"));
        let (out, removed) = remove_peer(&config, "K2");
        assert_eq!(removed, 0);
        assert_eq!(out, config);
    }

    #[test]
    fn test_remove_key_prefix_does_not_match() {
        let config = append_peer(BASE, &entry("K1abc", "10.8.1.2/32"));
        let (_, removed) = remove_peer(&config, "K1");
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_remove_all_duplicates_and_keep_others_in_order() {
        let mut config = BASE.to_string();
        config = append_peer(&config, &entry("K1", "10.8.1.2/32"));
        config = append_peer(&config, &entry("K2", "10.8.1.3/32"));
        config = append_peer(&config, &entry("K1", "10.8.1.4/32"));
        config = append_peer(&config, &entry("K3", "10.8.1.5/32"));

        let (out, removed) = remove_peer(&config, "K1");
        assert_eq!(removed, 2);

        let mut expected = BASE.to_string();
        expected = append_peer(&expected, &entry("K2", "10.8.1.3/32"));
        expected = append_peer(&expected, &entry("K3", "10.8.1.5/32"));
        assert_eq!(out, expected);
    }

    #[test]
    fn test_remove_keeps_trailing_comments_of_other_sections() {
        let config = "[Interface]\nAddress = 10.8.0.1/24\n\n\
            [Peer]\nPublicKey = K1\nAllowedIPs = 10.8.0.2/32\n\n\
            [Peer]\nPublicKey = K2\nAllowedIPs = 10.8.0.3/32\n# keep me\n";
        let (out, removed) = remove_peer(config, "K1");
        assert_eq!(removed, 1);
        assert_eq!(
            out,
            "[Interface]\nAddress = 10.8.0.1/24\n\n[Peer]\nPublicKey = K2\nAllowedIPs = 10.8.0.3/32\n# keep me\n"
        );
    }

    #[test]
    fn test_remove_only_peer_leaves_no_peer_sections() {
        let config = "[Interface]\nAddress = 10.8.0.1/24\nListenPort = 51820\n\n[Peer]\nPublicKey = K1\nAllowedIPs = 10.8.0.2/32\n";
        let (out, removed) = remove_peer(config, "K1");
        assert_eq!(removed, 1);
        assert!(!out.contains("[Peer]"));
        assert!(peer_sections(&out).is_empty());
    }

    #[test]
    fn test_peer_sections_reads_annotations() {
        let mut config = BASE.to_string();
        config = append_peer(&config, &entry("K1", "10.8.1.2/32"));
        config.push_str("\n[Peer]\nPublicKey = K2\nAllowedIPs = 10.8.1.3/32, fd00::3/128\n");

        let sections = peer_sections(&config);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].public_key.as_deref(), Some("K1"));
        assert_eq!(sections[0].app_type.as_deref(), Some("amnezia_wg"));
        assert_eq!(sections[1].app_type, None);
        assert_eq!(sections[1].allowed_ips, vec!["10.8.1.3/32", "fd00::3/128"]);
        assert_eq!(sections[1].first_ipv4(), Some(Ipv4Addr::new(10, 8, 1, 3)));
    }

    #[test]
    fn test_crlf_lines_are_handled() {
        let config = "[Interface]\r\nAddress = 10.8.0.1/24\r\n\r\n[Peer]\r\nPublicKey = K1\r\nAllowedIPs = 10.8.0.2/32\r\n";
        let (out, removed) = remove_peer(config, "K1");
        assert_eq!(removed, 1);
        assert_eq!(out, "[Interface]\r\nAddress = 10.8.0.1/24\r\n");
    }
}
