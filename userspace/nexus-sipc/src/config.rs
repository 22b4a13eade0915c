// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TOML description of the links a processor brings up
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 unit tests
//!
//! ```toml
//! [hwmutex]
//! spin_budget_ms = 100
//!
//! [[link]]
//! name = "modem"
//! dest = 5
//! tx = { base = 0, size = 640 }
//! rx = { base = 640, size = 640 }
//! tx_lock = 2
//! channels = 32
//! queue_depth = 64
//! poll_interval_ms = 50
//! ```
//!
//! Sizes are bytes; each must hold a power-of-two number of 20-byte slots.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::error::ConfigError;
use crate::layout::{LinkLayout, RingGeometry};
use crate::registry::{LinkOptions, MAX_PROCESSORS};

const DEFAULT_SPIN_BUDGET_MS: u64 = 100;
const DEFAULT_CHANNELS: usize = 32;
const DEFAULT_QUEUE_DEPTH: usize = 64;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Errors produced while loading a configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// The file could not be read.
    #[error("failed to read sipc config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML or has the wrong shape.
    #[error("failed to parse sipc config: {source}")]
    Parse {
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// The document parsed but describes an impossible setup.
    #[error("invalid sipc config: {0}")]
    Invalid(#[from] ConfigError),
}

/// Hardware lock settings shared by every link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HwMutexConfig {
    /// How long a sender may spin on the TX lock before the link faults.
    #[serde(default = "default_spin_budget_ms")]
    pub spin_budget_ms: u64,
}

impl Default for HwMutexConfig {
    fn default() -> Self {
        Self { spin_budget_ms: DEFAULT_SPIN_BUDGET_MS }
    }
}

/// One `[[link]]` table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Link name; names the pump thread.
    pub name: String,
    /// Destination processor id.
    pub dest: u8,
    /// Ring this processor writes.
    pub tx: RingGeometry,
    /// Ring this processor reads.
    pub rx: RingGeometry,
    /// HwMutex id serialising local senders.
    #[serde(default)]
    pub tx_lock: usize,
    /// Number of logical channels.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Receive queue depth per channel.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Pump poll interval when no doorbell arrives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl LinkConfig {
    /// Resolved ring layout.
    pub fn layout(&self) -> Result<LinkLayout, ConfigError> {
        LinkLayout::new(self.tx, self.rx)
    }

    /// Link options with the shared spin budget applied.
    pub fn options(&self, spin_budget: Duration) -> LinkOptions {
        LinkOptions {
            tx_lock: self.tx_lock,
            channel_count: self.channels,
            queue_depth: self.queue_depth,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            spin_budget,
        }
    }
}

/// Whole configuration document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SipcConfig {
    /// Lock settings.
    #[serde(default)]
    pub hwmutex: HwMutexConfig,
    /// Links in declaration order.
    #[serde(rename = "link", default)]
    pub links: Vec<LinkConfig>,
}

impl SipcConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(input).map_err(|source| Error::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .map_err(|source| Error::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&input)
    }

    /// TX lock spin budget.
    pub fn spin_budget(&self) -> Duration {
        Duration::from_millis(self.hwmutex.spin_budget_ms)
    }

    /// Checks every link on its own and against the others.
    ///
    /// Region size is checked at registration, once the region exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut dests = BTreeSet::new();
        let mut names = BTreeSet::new();
        for link in &self.links {
            if usize::from(link.dest) >= MAX_PROCESSORS {
                return Err(ConfigError::ProcessorOutOfRange(link.dest));
            }
            if !dests.insert(link.dest) {
                return Err(ConfigError::DuplicateLink(link.dest));
            }
            if !names.insert(link.name.as_str()) {
                return Err(ConfigError::DuplicateName(link.name.clone()));
            }
            link.layout()?;
            link.options(self.spin_budget()).validate()?;
        }
        Ok(())
    }
}

fn default_spin_budget_ms() -> u64 {
    DEFAULT_SPIN_BUDGET_MS
}

fn default_channels() -> usize {
    DEFAULT_CHANNELS
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_LINKS: &str = r#"
        [hwmutex]
        spin_budget_ms = 20

        [[link]]
        name = "modem"
        dest = 5
        tx = { base = 0, size = 640 }
        rx = { base = 640, size = 640 }
        tx_lock = 2

        [[link]]
        name = "wcn"
        dest = 3
        tx = { base = 0, size = 160 }
        rx = { base = 160, size = 320 }
        channels = 8
        queue_depth = 4
        poll_interval_ms = 10
    "#;

    #[test]
    fn parses_links_with_defaults() {
        let config = SipcConfig::from_toml_str(TWO_LINKS).unwrap();
        assert_eq!(config.spin_budget(), Duration::from_millis(20));
        assert_eq!(config.links.len(), 2);
        let modem = &config.links[0];
        assert_eq!(modem.channels, DEFAULT_CHANNELS);
        assert_eq!(modem.layout().unwrap().tx.slot_count, 32);
        let wcn = config.links[1].options(config.spin_budget());
        assert_eq!(wcn.channel_count, 8);
        assert_eq!(wcn.poll_interval, Duration::from_millis(10));
        assert_eq!(wcn.tx_lock, 0);
    }

    #[test]
    fn empty_document_is_valid() {
        let config = SipcConfig::from_toml_str("").unwrap();
        assert!(config.links.is_empty());
        assert_eq!(config.hwmutex, HwMutexConfig::default());
    }

    #[test]
    fn duplicate_dest_rejected() {
        let doc = TWO_LINKS.replace("dest = 3", "dest = 5");
        assert!(matches!(
            SipcConfig::from_toml_str(&doc),
            Err(Error::Invalid(ConfigError::DuplicateLink(5)))
        ));
    }

    #[test]
    fn bad_geometry_rejected() {
        let doc = TWO_LINKS.replace("size = 320", "size = 300");
        assert!(matches!(
            SipcConfig::from_toml_str(&doc),
            Err(Error::Invalid(ConfigError::SlotCount { ring: "rx", slots: 15 }))
        ));
        let doc = TWO_LINKS.replace("dest = 3", "dest = 16");
        assert!(matches!(
            SipcConfig::from_toml_str(&doc),
            Err(Error::Invalid(ConfigError::ProcessorOutOfRange(16)))
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let doc = format!("{TWO_LINKS}\n[extra]\nkey = 1\n");
        assert!(matches!(SipcConfig::from_toml_str(&doc), Err(Error::Parse { .. })));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_LINKS.as_bytes()).unwrap();
        let config = SipcConfig::load(file.path()).unwrap();
        assert_eq!(config.links[0].name, "modem");

        let missing = file.path().with_extension("missing");
        assert!(matches!(SipcConfig::load(&missing), Err(Error::Read { .. })));
    }
}
