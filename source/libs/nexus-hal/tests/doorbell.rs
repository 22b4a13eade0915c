//! CONTEXT: Tests for HAL doorbell and interrupt line across threads
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCENARIOS:
//!   - trigger_wakes_waiting_thread(): a blocked waiter is released by the peer's trigger
//!   - wait_times_out_without_trigger(): a silent peer leaves the waiter to time out
//!   - doorbell_is_object_safe(): Doorbell works behind Arc<dyn Doorbell>
//!
//! DEPENDENCIES:
//!   - nexus_hal::{Doorbell, HostDoorbell}: doorbell contract and host pair
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexus_hal::{Doorbell, HostDoorbell};

#[test]
fn trigger_wakes_waiting_thread() {
    let (ap, cp) = HostDoorbell::pair();
    let cp = Arc::new(cp);
    let waiter = {
        let cp = Arc::clone(&cp);
        thread::spawn(move || cp.irq().wait_timeout(Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(20));
    ap.trigger().unwrap();
    assert!(waiter.join().unwrap());
    assert!(cp.pending().unwrap());
}

#[test]
fn wait_times_out_without_trigger() {
    let (_ap, cp) = HostDoorbell::pair();
    let start = Instant::now();
    assert!(!cp.irq().wait_timeout(Duration::from_millis(30)));
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn doorbell_is_object_safe() {
    let (ap, cp) = HostDoorbell::pair();
    let ap: Arc<dyn Doorbell> = Arc::new(ap);
    ap.trigger().unwrap();
    ap.trigger().unwrap();
    assert!(cp.pending().unwrap());
    cp.clear().unwrap();
    assert!(!cp.pending().unwrap());
}
