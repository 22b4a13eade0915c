//! CONTEXT: Property tests for the shared-memory ring
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 property tests
//!
//! TEST_SCENARIOS:
//!   - ring_is_fifo_and_bounded(): random push/pop sequences against a VecDeque model
//!   - refill_after_drain(): push until Full, pop all, push again succeeds
//!   - producer_and_consumer_threads_agree(): concurrent ends see the same sequence
//!
//! DEPENDENCIES:
//!   - nexus_sipc::{RingChannel, LinkLayout, Message}
//!   - nexus_hal::SharedRegion
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use nexus_hal::SharedRegion;
use nexus_sipc::{LinkLayout, Message, RingChannel, RingError};
use proptest::prelude::*;

fn ends(slots: usize) -> (RingChannel, RingChannel) {
    let layout = LinkLayout::contiguous(slots, 2).unwrap();
    let region = Arc::new(SharedRegion::new(layout.footprint).unwrap());
    let producer = RingChannel::new(Arc::clone(&region), layout.tx).unwrap();
    let consumer = RingChannel::new(region, layout.mirrored().rx).unwrap();
    (producer, consumer)
}

fn msg(n: u32) -> Message {
    Message::new(0x100, (n % 7) as u16, [n, !n, n.rotate_left(7), 0])
}

fn slot_counts() -> impl Strategy<Value = usize> {
    (1u32..7).prop_map(|shift| 1usize << shift)
}

proptest! {
    #[test]
    fn ring_is_fifo_and_bounded(slots in slot_counts(), ops in proptest::collection::vec(any::<bool>(), 1..400)) {
        let (tx, rx) = ends(slots);
        let mut model = VecDeque::new();
        let mut next = 0u32;
        for push in ops {
            if push {
                match tx.try_push(&msg(next)) {
                    Ok(()) => {
                        prop_assert!(model.len() < slots - 1);
                        model.push_back(next);
                        next += 1;
                    }
                    Err(err) => {
                        prop_assert_eq!(err, RingError::Full);
                        prop_assert_eq!(model.len(), slots - 1);
                    }
                }
            } else {
                match rx.try_pop() {
                    Ok(got) => prop_assert_eq!(Some(got), model.pop_front().map(msg)),
                    Err(err) => {
                        prop_assert_eq!(err, RingError::Empty);
                        prop_assert!(model.is_empty());
                    }
                }
            }
            prop_assert!(tx.len().unwrap() <= slots - 1);
            prop_assert_eq!(tx.len().unwrap(), model.len());
        }
    }

    #[test]
    fn refill_after_drain(slots in slot_counts(), rounds in 1usize..5) {
        let (tx, rx) = ends(slots);
        let mut next = 0u32;
        for _ in 0..rounds {
            let mut pushed = 0;
            while tx.try_push(&msg(next)).is_ok() {
                next += 1;
                pushed += 1;
            }
            prop_assert_eq!(pushed, slots - 1);
            let first = next - pushed as u32;
            for n in first..next {
                prop_assert_eq!(rx.try_pop().unwrap(), msg(n));
            }
            prop_assert_eq!(rx.try_pop(), Err(RingError::Empty));
            prop_assert!(tx.try_push(&msg(next)).is_ok());
            prop_assert_eq!(rx.try_pop().unwrap(), msg(next));
            next += 1;
        }
    }
}

#[test]
fn producer_and_consumer_threads_agree() {
    const COUNT: u32 = 20_000;
    let (tx, rx) = ends(16);
    let producer = thread::spawn(move || {
        let mut n = 0;
        while n < COUNT {
            match tx.try_push(&msg(n)) {
                Ok(()) => n += 1,
                Err(RingError::Full) => thread::yield_now(),
                Err(err) => panic!("producer: {err}"),
            }
        }
    });
    let mut expected = 0;
    while expected < COUNT {
        match rx.try_pop() {
            Ok(got) => {
                assert_eq!(got, msg(expected));
                expected += 1;
            }
            Err(RingError::Empty) => thread::yield_now(),
            Err(err) => panic!("consumer: {err}"),
        }
    }
    producer.join().unwrap();
}
