//! Discovery announcement types and the unwanted-device policy.
//!
//! The UDP/broadcast listener that produces announcements is an external
//! collaborator; this module owns only the announcement record, the
//! composite identity the connection state machine keys on, and the policy
//! table for devices that should never be connected to.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Software identification carried in a discovery announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Software {
    pub name: String,
    pub version: String,
}

/// One discovered remote endpoint instance.
///
/// Not unique across reboots by token alone; see [`ConnectionInfo::identity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub address: IpAddr,
    pub port: u16,
    /// 16-byte token embedded in the announcement.
    pub token: [u8; 16],
    /// Source identity of the announcing process.
    pub source: String,
    pub software: Software,
}

impl ConnectionInfo {
    /// Composite identity used by the connection state machine.
    ///
    /// address:port is stable only until the next reboot while the token
    /// survives reboots; keying on the endpoint tuple re-detects a rebooted
    /// device as new instead of silently resuming a stale identity.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}/{}/{}",
            self.address, self.port, self.source, self.software.name
        )
    }
}

/// Software names that do not speak the protocol usefully.
const DENIED_NAMES: &[&str] = &["OfflineAnalyzer", "JM08", "SSS0"];

/// Case-insensitive product-name prefixes to skip.
const DENIED_PREFIXES: &[&str] = &["soundswitch", "resolume"];

/// Returns true if the announcement must never trigger a connection attempt:
/// our own reflection, or a product on the deny table.
pub(crate) fn is_unwanted(info: &ConnectionInfo, own_source: &str) -> bool {
    if info.source == own_source {
        return true;
    }
    let name = info.software.name.as_str();
    if DENIED_NAMES.contains(&name) {
        return true;
    }
    let lower = name.to_lowercase();
    DENIED_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(software_name: &str, source: &str) -> ConnectionInfo {
        ConnectionInfo {
            address: "10.0.0.5".parse().unwrap(),
            port: 50010,
            token: [7; 16],
            source: source.to_string(),
            software: Software {
                name: software_name.to_string(),
                version: "2.3.0".to_string(),
            },
        }
    }

    #[test]
    fn identity_is_the_endpoint_tuple() {
        let info = announcement("Prime4", "player");
        assert_eq!(info.identity(), "10.0.0.5:50010/player/Prime4");

        // Same token, different port: a different identity.
        let mut rebooted = info.clone();
        rebooted.port = 50011;
        assert_ne!(info.identity(), rebooted.identity());
    }

    #[test]
    fn denied_products_are_unwanted() {
        for name in ["OfflineAnalyzer", "JM08", "SSS0"] {
            assert!(is_unwanted(&announcement(name, "player"), "me"), "{name}");
        }
    }

    #[test]
    fn denied_prefixes_match_case_insensitively() {
        for name in ["SoundSwitchXYZ", "soundswitch", "ResolumeArena", "RESOLUME"] {
            assert!(is_unwanted(&announcement(name, "player"), "me"), "{name}");
        }
    }

    #[test]
    fn own_source_is_unwanted() {
        assert!(is_unwanted(&announcement("Prime4", "me"), "me"));
    }

    #[test]
    fn ordinary_players_are_wanted() {
        assert!(!is_unwanted(&announcement("Prime4", "player"), "me"));
        // Prefix rules only match at the start of the name.
        assert!(!is_unwanted(&announcement("NotResolume", "player"), "me"));
    }
}
