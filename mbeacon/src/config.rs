//! Beacon identity and runtime configuration.

use crate::addr::Address;
use crate::protocol::flag;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Default multicast hop limit, also announced as the original hop limit in
/// reports.
pub const DEFAULT_TTL: u8 = 127;
/// Starting beacon interval in seconds; adapts to observed traffic at
/// runtime.
pub const DEFAULT_BEACON_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_DUMP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_DUMP_FILE: &str = "dump.xml";
pub const DEFAULT_IPV4_SSM_CHANNEL: &str = "232.2.3.2";
pub const DEFAULT_IPV6_SSM_CHANNEL: &str = "ff3e::beac";

/// Longest accepted beacon name; the wire length field is one byte.
pub const MAX_NAME_LEN: usize = 254;

/// Everything the daemon is told at startup. The engine treats this as
/// read-only for the life of the process.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Beacon name announced in every report.
    pub name: String,
    /// Administrative contact (mail address) announced in every report.
    pub admin_contact: String,
    /// Optional two-letter country code.
    pub country: String,
    /// Announced websites, keyed by website-category wire tag.
    pub websites: BTreeMap<u8, String>,
    /// ASM group probes are sent to and received from.
    pub probe_group: Option<Address>,
    /// SSM channel, when source-specific probing is enabled.
    pub ssm_group: Option<Address>,
    /// Extra unicast/multicast destinations reports are redistributed to.
    pub redistribute: Vec<Address>,
    /// Local addresses to listen on for reports from other beacons.
    pub listen: Vec<Address>,
    /// Our own unicast endpoint; discovered at bind time when unset.
    pub unicast: Address,
    /// Interface index for multicast joins, 0 for the default interface.
    pub mcast_interface: u32,
    pub ttl: u8,
    pub dump_file: Option<PathBuf>,
    pub dump_interval_secs: u64,
    /// Program to launch after each dump, with the dump path as argument.
    pub launch_after_dump: Option<String>,
    /// Print periodic bandwidth usage reports.
    pub bandwidth_report: bool,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            admin_contact: String::new(),
            country: String::new(),
            websites: BTreeMap::new(),
            probe_group: None,
            ssm_group: None,
            redistribute: Vec::new(),
            listen: Vec::new(),
            unicast: Address::unspecified(),
            mcast_interface: 0,
            ttl: DEFAULT_TTL,
            dump_file: None,
            dump_interval_secs: DEFAULT_DUMP_INTERVAL_SECS,
            launch_after_dump: None,
            bandwidth_report: false,
        }
    }
}

impl BeaconConfig {
    /// Checks the invariants the protocol and the engine rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ConfigError::NameTooLong);
        }
        if self.probe_group.is_some() {
            if self.admin_contact.is_empty() {
                return Err(ConfigError::MissingContact);
            }
            if !self.admin_contact.contains('@') {
                return Err(ConfigError::InvalidContact);
            }
        }
        for group in self.probe_group.iter().chain(self.ssm_group.iter()) {
            if !group.is_multicast() {
                return Err(ConfigError::NotMulticast(*group));
            }
        }
        if !self.country.is_empty() && self.country.len() != 2 {
            return Err(ConfigError::InvalidCountry);
        }
        if self.dump_file.is_some() && self.dump_interval_secs < DEFAULT_DUMP_INTERVAL_SECS {
            return Err(ConfigError::DumpIntervalTooShort);
        }
        if self.probe_group.is_none() && self.listen.is_empty() {
            return Err(ConfigError::NothingToDo);
        }
        Ok(())
    }

    /// Capability flags announced on the wire.
    pub fn capability_flags(&self) -> u32 {
        if self.ssm_group.is_some() {
            flag::SSM_CAPABLE
        } else {
            0
        }
    }
}

/// Configuration rejected by [`BeaconConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingName,
    NameTooLong,
    MissingContact,
    InvalidContact,
    NotMulticast(Address),
    InvalidCountry,
    DumpIntervalTooShort,
    NothingToDo,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingName => write!(f, "no beacon name supplied"),
            ConfigError::NameTooLong => {
                write!(f, "beacon name longer than {} bytes", MAX_NAME_LEN)
            }
            ConfigError::MissingContact => write!(f, "no administration contact supplied"),
            ConfigError::InvalidContact => write!(f, "administration contact is not a mail address"),
            ConfigError::NotMulticast(addr) => {
                write!(f, "{} is not a multicast group address", addr)
            }
            ConfigError::InvalidCountry => write!(f, "country code must be two letters"),
            ConfigError::DumpIntervalTooShort => write!(
                f,
                "dump interval shorter than {} seconds",
                DEFAULT_DUMP_INTERVAL_SECS
            ),
            ConfigError::NothingToDo => {
                write!(f, "neither a beacon group nor a listen address configured")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn probing_config() -> BeaconConfig {
        BeaconConfig {
            name: "test-beacon".into(),
            admin_contact: "op@example.net".into(),
            probe_group: Some("224.0.23.10/10000".parse().unwrap()),
            ..BeaconConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert_eq!(probing_config().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_missing_identity() {
        let mut cfg = probing_config();
        cfg.name.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::MissingName));

        let mut cfg = probing_config();
        cfg.admin_contact = "not-a-mail".into();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidContact));
    }

    #[test]
    fn test_rejects_unicast_group() {
        let mut cfg = probing_config();
        cfg.probe_group = Some("10.0.0.1/10000".parse().unwrap());
        assert!(matches!(cfg.validate(), Err(ConfigError::NotMulticast(_))));
    }

    #[test]
    fn test_listen_only_config_is_valid() {
        let cfg = BeaconConfig {
            name: "observer".into(),
            listen: vec!["0.0.0.0/10000".parse().unwrap()],
            ..BeaconConfig::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_ssm_sets_capability_flag() {
        let mut cfg = probing_config();
        assert_eq!(cfg.capability_flags(), 0);
        cfg.ssm_group = Some("232.2.3.2/10000".parse().unwrap());
        assert_eq!(cfg.capability_flags(), flag::SSM_CAPABLE);
    }
}
