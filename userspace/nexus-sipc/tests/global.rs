//! CONTEXT: Process-wide registry and the millisecond-timeout entry points
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 1 integration test
//!
//! The global registry is per process, so everything lives in one test.
//!
//! TEST_SCENARIOS:
//!   - global_lifecycle(): uninitialised errors, init once, free functions, teardown
//!
//! DEPENDENCIES:
//!   - nexus_sipc::{open_channel, close_channel, send, receive, ProcessorRegistry}
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_hwmutex::{HwMutex, SimulatedHwMutexBlock, Version};
use nexus_sipc::host::{loopback, PeerBehavior};
use nexus_sipc::{ConfigError, LinkOptions, Message, ProcessorRegistry, SipcError};

#[test]
fn global_lifecycle() {
    assert_eq!(
        nexus_sipc::open_channel(2, 0, 100).unwrap_err(),
        SipcError::Config(ConfigError::RegistryUninitialised)
    );

    let block = SimulatedHwMutexBlock::new(Version::V1, 16);
    let bank = Arc::new(HwMutex::probe(Arc::new(block.port(0xa)), 0xa).unwrap());
    let registry = ProcessorRegistry::init_global(Arc::clone(&bank)).unwrap();
    assert!(matches!(
        ProcessorRegistry::init_global(bank),
        Err(SipcError::Config(ConfigError::RegistryInitialised))
    ));

    let lb = loopback("wcn", 2, 8, 8).unwrap();
    let options = LinkOptions { tx_lock: 3, poll_interval: Duration::from_millis(10), ..LinkOptions::default() };
    registry.register_link(lb.params.with_options(options)).unwrap();
    let responder = lb.peer.spawn_responder(PeerBehavior::Echo);

    assert_eq!(
        nexus_sipc::send(2, 4, Message::data(0x22, [0; 4]), 0).unwrap_err(),
        SipcError::InvalidState { channel: 4, state: nexus_sipc::ChannelState::Unused }
    );
    nexus_sipc::open_channel(2, 4, -1).unwrap();
    nexus_sipc::send(2, 4, Message::data(0x22, [5, 6, 7, 8]), 1000).unwrap();
    let echoed = nexus_sipc::receive(2, 4, 1000).unwrap();
    assert_eq!((echoed.command, echoed.channel, echoed.params), (0x22, 4, [5, 6, 7, 8]));
    assert_eq!(nexus_sipc::receive(2, 4, 0).unwrap_err(), SipcError::WouldBlock);

    let start = Instant::now();
    assert_eq!(nexus_sipc::receive(2, 4, 30).unwrap_err(), SipcError::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(30));

    nexus_sipc::close_channel(2, 4, 1000).unwrap();
    assert_eq!(block.holder(3), None);
    assert!(bank_used(registry));

    drop(responder);
    registry.shutdown();
    assert_eq!(
        nexus_sipc::open_channel(2, 4, 0).unwrap_err(),
        SipcError::Config(ConfigError::UnknownLink(2))
    );
}

fn bank_used(registry: &ProcessorRegistry) -> bool {
    registry.hwmutex().owner_snapshot(3).map(|snap| snap.acquisitions > 0 && snap.hardware).unwrap_or(false)
}
