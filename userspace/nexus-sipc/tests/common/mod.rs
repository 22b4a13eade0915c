//! Shared fixtures for the link integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nexus_hal::HostDoorbell;
use nexus_hwmutex::HwMutex;
use nexus_sipc::host::{loopback, RemotePeer};
use nexus_sipc::{LinkHandle, LinkOptions, ProcessorRegistry};
use nexus_sync::{spin_until, Deadline};

pub const DEST: u8 = 5;

pub struct Fixture {
    pub registry: ProcessorRegistry,
    pub link: LinkHandle,
    pub peer: RemotePeer,
    pub doorbell: Arc<HostDoorbell>,
}

pub fn options() -> LinkOptions {
    LinkOptions {
        channel_count: 8,
        queue_depth: 16,
        poll_interval: Duration::from_millis(10),
        spin_budget: Duration::from_millis(50),
        ..LinkOptions::default()
    }
}

pub fn fixture(slots: usize, options: LinkOptions) -> Fixture {
    let registry = ProcessorRegistry::new(Arc::new(HwMutex::emulated(0xa).unwrap()));
    let lb = loopback("modem", DEST, slots, slots).unwrap();
    let link = registry.register_link(lb.params.with_options(options)).unwrap();
    Fixture { registry, link, peer: lb.peer, doorbell: lb.doorbell }
}

/// Polls `cond` for up to five seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    spin_until(Deadline::after(Duration::from_secs(5)), || cond().then_some(())).is_some()
}
