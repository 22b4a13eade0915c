//! CONTEXT: Several local senders sharing one link
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 1 integration test
//!
//! Every send takes the link's TX lock; this is the contended local path.
//!
//! TEST_SCENARIOS:
//!   - parallel_senders_keep_per_channel_order(): N threads x M messages against an echo peer
//!
//! DEPENDENCIES:
//!   - nexus_sipc::host::PeerBehavior
//!   - tests/common: fixture
mod common;

use std::thread;
use std::time::Duration;

use common::{fixture, options};
use nexus_sipc::host::PeerBehavior;
use nexus_sipc::{LinkOptions, Message, Wait};

const SENDERS: u16 = 4;
const PER_SENDER: u32 = 50;
const SHORT: Wait = Wait::Timeout(Duration::from_secs(5));

#[test]
fn parallel_senders_keep_per_channel_order() {
    let f = fixture(16, LinkOptions { queue_depth: 64, ..options() });
    let responder = f.peer.spawn_responder(PeerBehavior::Echo);
    let link = &f.link;

    thread::scope(|s| {
        let workers: Vec<_> = (1..=SENDERS)
            .map(|channel| {
                s.spawn(move || {
                    link.open_channel(channel, SHORT).unwrap();
                    for n in 0..PER_SENDER {
                        link.send(channel, Message::data(0x60, [n, u32::from(channel), 0, 0]), SHORT).unwrap();
                    }
                    let echoed: Vec<u32> = (0..PER_SENDER)
                        .map(|_| {
                            let msg = link.receive(channel, SHORT).unwrap();
                            assert_eq!((msg.channel, msg.params[1]), (channel, u32::from(channel)));
                            msg.params[0]
                        })
                        .collect();
                    assert_eq!(echoed, (0..PER_SENDER).collect::<Vec<_>>());
                    link.close_channel(channel, SHORT).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    });

    let mut sent = 0;
    for channel in 1..=SENDERS {
        let stats = link.channel_stats(channel).unwrap();
        assert_eq!((stats.sent, stats.received, stats.dropped), (u64::from(PER_SENDER), u64::from(PER_SENDER), 0));
        sent += stats.sent;
    }
    assert_eq!(sent, u64::from(SENDERS) * u64::from(PER_SENDER));

    let data_seen = responder.seen().iter().filter(|m| m.command == 0x60).count();
    assert_eq!(data_seen, usize::from(SENDERS) * PER_SENDER as usize);
    assert_eq!(link.stats().violations, 0);
}
