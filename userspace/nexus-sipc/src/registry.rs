// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide table of links keyed by destination processor id
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 unit tests + tests/registry.rs, tests/global.rs
//!
//! PUBLIC API:
//!   - ProcessorRegistry::register_link(): validate, build, start the pump
//!   - ProcessorRegistry::lookup(): O(1) by destination id
//!   - ProcessorRegistry::unregister()/shutdown(): stop pumps
//!   - ProcessorRegistry::init_global()/global(): process-wide instance
//!   - ProcessorRegistry::register_from_config(): links described by SipcConfig
//!
//! INVARIANTS:
//!   - Every configuration problem surfaces here, never later at runtime
//!   - At most one link per destination id and per name

use std::sync::Arc;
use std::time::Duration;

use log::info;
use nexus_hal::{Doorbell, SharedRegion};
use nexus_hwmutex::{HwMutex, HWMUTEX_MAX_LOCKS};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::config::{LinkConfig, SipcConfig};
use crate::error::{ConfigError, HardwareFault, SipcError};
use crate::layout::{LinkLayout, RingGeometry};
use crate::mux::{Link, LinkHandle};
use crate::Result;

/// Size of the destination id table.
pub const MAX_PROCESSORS: usize = 16;
/// Upper bound on channels per link.
pub const MAX_CHANNELS: usize = 256;

static GLOBAL: OnceCell<ProcessorRegistry> = OnceCell::new();

/// Tunables of one link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkOptions {
    /// HwMutex id guarding the TX push.
    pub tx_lock: usize,
    /// Number of logical channels.
    pub channel_count: usize,
    /// Receive queue depth per channel.
    pub queue_depth: usize,
    /// Pump wake-up interval without a doorbell.
    pub poll_interval: Duration,
    /// How long a sender spins on the TX lock before the link faults.
    pub spin_budget: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            tx_lock: 0,
            channel_count: 32,
            queue_depth: 64,
            poll_interval: Duration::from_millis(50),
            spin_budget: Duration::from_millis(100),
        }
    }
}

impl LinkOptions {
    /// Rejects counts and ids the link cannot be built with.
    pub fn validate(&self) -> core::result::Result<(), ConfigError> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(ConfigError::ChannelCount(self.channel_count));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::QueueDepth);
        }
        if self.tx_lock >= HWMUTEX_MAX_LOCKS {
            return Err(ConfigError::LockId(self.tx_lock));
        }
        Ok(())
    }
}

/// Everything needed to bring up one link.
pub struct LinkParams {
    /// Link name.
    pub name: String,
    /// Destination processor id.
    pub dest: u8,
    /// Ring this side writes.
    pub tx: RingGeometry,
    /// Ring this side reads.
    pub rx: RingGeometry,
    /// Memory shared with the remote.
    pub region: Arc<SharedRegion>,
    /// Interrupt plumbing to and from the remote.
    pub doorbell: Arc<dyn Doorbell>,
    /// Tunables.
    pub options: LinkOptions,
}

impl LinkParams {
    /// Parameters with default options.
    pub fn new(
        name: impl Into<String>,
        dest: u8,
        tx: RingGeometry,
        rx: RingGeometry,
        region: Arc<SharedRegion>,
        doorbell: Arc<dyn Doorbell>,
    ) -> Self {
        Self { name: name.into(), dest, tx, rx, region, doorbell, options: LinkOptions::default() }
    }

    /// Replaces the options.
    pub fn with_options(mut self, options: LinkOptions) -> Self {
        self.options = options;
        self
    }
}

/// Platform hook handing out the shared memory and doorbell of a configured link.
pub trait LinkResources {
    /// Shared region backing `link`.
    fn region(&self, link: &LinkConfig) -> nexus_hal::Result<Arc<SharedRegion>>;
    /// Doorbell of `link`.
    fn doorbell(&self, link: &LinkConfig) -> nexus_hal::Result<Arc<dyn Doorbell>>;
}

/// Table of links, one slot per destination processor.
pub struct ProcessorRegistry {
    hwmutex: Arc<HwMutex>,
    links: RwLock<[Option<LinkHandle>; MAX_PROCESSORS]>,
}

impl ProcessorRegistry {
    /// Empty registry whose links share `hwmutex`.
    pub fn new(hwmutex: Arc<HwMutex>) -> Self {
        Self { hwmutex, links: RwLock::new(std::array::from_fn(|_| None)) }
    }

    /// Installs the process-wide registry. Fails when called twice.
    pub fn init_global(hwmutex: Arc<HwMutex>) -> Result<&'static Self> {
        GLOBAL
            .set(Self::new(hwmutex))
            .map_err(|_| ConfigError::RegistryInitialised)?;
        Self::global()
    }

    /// The process-wide registry.
    pub fn global() -> Result<&'static Self> {
        GLOBAL.get().ok_or_else(|| ConfigError::RegistryUninitialised.into())
    }

    /// Lock bank shared by the links.
    pub fn hwmutex(&self) -> &Arc<HwMutex> {
        &self.hwmutex
    }

    fn slot(dest: u8) -> core::result::Result<usize, ConfigError> {
        let slot = usize::from(dest);
        if slot >= MAX_PROCESSORS {
            return Err(ConfigError::ProcessorOutOfRange(dest));
        }
        Ok(slot)
    }

    /// Validates `params`, builds the link and starts its pump.
    pub fn register_link(&self, params: LinkParams) -> Result<LinkHandle> {
        let LinkParams { name, dest, tx, rx, region, doorbell, options } = params;
        let slot = Self::slot(dest)?;
        options.validate()?;
        let layout = LinkLayout::new(tx, rx)?;
        layout.check_region(region.len())?;

        let mut links = self.links.write();
        if links[slot].is_some() {
            return Err(ConfigError::DuplicateLink(dest).into());
        }
        if links.iter().flatten().any(|link| link.name() == name) {
            return Err(ConfigError::DuplicateName(name).into());
        }
        let link = Link::start(name, dest, layout, region, doorbell, Arc::clone(&self.hwmutex), options)?;
        info!(
            "sipc: link {} -> dest {dest}: {} tx / {} rx slots, {} channels",
            link.name(),
            layout.tx.slot_count,
            layout.rx.slot_count,
            options.channel_count
        );
        links[slot] = Some(Arc::clone(&link));
        Ok(link)
    }

    /// Link registered for `dest`.
    pub fn lookup(&self, dest: u8) -> Result<LinkHandle> {
        let slot = Self::slot(dest)?;
        self.links.read()[slot].clone().ok_or_else(|| ConfigError::UnknownLink(dest).into())
    }

    /// Removes and shuts down the link for `dest`.
    pub fn unregister(&self, dest: u8) -> Result<LinkHandle> {
        let slot = Self::slot(dest)?;
        let link = self.links.write()[slot].take().ok_or(ConfigError::UnknownLink(dest))?;
        link.shutdown();
        Ok(link)
    }

    /// Every registered link, by destination id.
    pub fn links(&self) -> Vec<LinkHandle> {
        self.links.read().iter().flatten().cloned().collect()
    }

    /// Shuts down and removes every link.
    pub fn shutdown(&self) {
        let removed: Vec<LinkHandle> = self.links.write().iter_mut().filter_map(Option::take).collect();
        for link in &removed {
            link.shutdown();
        }
        if !removed.is_empty() {
            info!("sipc: registry shut down {} links", removed.len());
        }
    }

    /// Registers every link in `config`. Nothing stays registered on failure.
    pub fn register_from_config(
        &self,
        config: &SipcConfig,
        resources: &dyn LinkResources,
    ) -> Result<Vec<LinkHandle>> {
        config.validate()?;
        let mut registered = Vec::with_capacity(config.links.len());
        for link in &config.links {
            match self.register_configured(config, link, resources) {
                Ok(handle) => registered.push(handle),
                Err(err) => {
                    for handle in &registered {
                        // Registered by this call a moment ago.
                        let _ = self.unregister(handle.dest());
                    }
                    return Err(err);
                }
            }
        }
        Ok(registered)
    }

    fn register_configured(
        &self,
        config: &SipcConfig,
        link: &LinkConfig,
        resources: &dyn LinkResources,
    ) -> Result<LinkHandle> {
        let region = resources.region(link).map_err(|err| SipcError::from(HardwareFault::Region(err)))?;
        let doorbell = resources.doorbell(link).map_err(|err| SipcError::from(HardwareFault::from(err)))?;
        let params = LinkParams::new(link.name.clone(), link.dest, link.tx, link.rx, region, doorbell)
            .with_options(link.options(config.spin_budget()));
        self.register_link(params)
    }
}

impl Drop for ProcessorRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
