// SPDX-License-Identifier: Apache-2.0

//! End-to-end request lifecycle: admission through application to expiry.

mod support;

use pretty_assertions::assert_eq;
use restune_common::{Mode, RequestPriority};
use restune_engine::error::Error;
use restune_engine::requests::RequestBucket;
use std::time::Duration;
use support::{DEFAULT_VALUE, HIB, KNOB_A, TestDaemon, THIRD_PARTY_PID_BASE};

const SYS_PID: i32 = 100;
const SYS_TID: i32 = 101;
const TP_PID: i32 = THIRD_PARTY_PID_BASE + 1;
const TP_TID: i32 = THIRD_PARTY_PID_BASE + 2;

#[test]
fn single_tune_applies_and_expires() {
    let mut daemon = TestDaemon::start();

    let handle = daemon
        .tune(
            SYS_PID,
            SYS_TID,
            HIB,
            3000,
            200,
            RequestPriority::High,
            Mode::RESUME,
        )
        .unwrap();
    assert_eq!(handle, 1);
    daemon.drain();
    assert_eq!(daemon.node("hib"), "3000");
    assert_eq!(daemon.dispatcher.timer_count(), 1);

    // Expiry fires a synthesized untune at transfer priority.
    std::thread::sleep(Duration::from_millis(400));
    daemon.drain();
    assert_eq!(daemon.node("hib"), DEFAULT_VALUE);
    assert!(!daemon.core.requests.verify(handle));
    assert_eq!(daemon.dispatcher.timer_count(), 0);
    assert!(daemon.dispatcher.table().is_pristine());
}

#[test]
fn higher_priority_level_wins_regardless_of_value() {
    let mut daemon = TestDaemon::start();

    let low = daemon
        .tune(SYS_PID, SYS_TID, HIB, 2000, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();
    assert_eq!(daemon.node("hib"), "2000");

    let high = daemon
        .tune(SYS_PID, SYS_TID, HIB, 1500, -1, RequestPriority::High, Mode::RESUME)
        .unwrap();
    daemon.drain();
    assert_eq!(daemon.node("hib"), "1500");

    daemon.untune(low, SYS_PID, SYS_TID).unwrap();
    daemon.drain();
    assert_eq!(daemon.node("hib"), "1500");

    daemon.untune(high, SYS_PID, SYS_TID).unwrap();
    daemon.drain();
    assert_eq!(daemon.node("hib"), DEFAULT_VALUE);
}

#[test]
fn retune_extends_the_duration() {
    let mut daemon = TestDaemon::start();

    let handle = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 42, 150, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();
    assert_eq!(daemon.node("knob_a"), "42");

    daemon.retune(handle, 600, SYS_PID, SYS_TID).unwrap();
    daemon.drain();

    // Past the original deadline the request must still be applied.
    std::thread::sleep(Duration::from_millis(300));
    daemon.drain();
    assert_eq!(daemon.node("knob_a"), "42");
    assert!(daemon.core.requests.verify(handle));

    // And past the extended deadline it is gone.
    std::thread::sleep(Duration::from_millis(500));
    daemon.drain();
    assert_eq!(daemon.node("knob_a"), DEFAULT_VALUE);
    assert!(!daemon.core.requests.verify(handle));
}

#[test]
fn tune_retune_untune_equals_tune_untune() {
    let mut daemon = TestDaemon::start();

    let handle = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 7, 10_000, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();
    daemon.retune(handle, 20_000, SYS_PID, SYS_TID).unwrap();
    daemon.drain();
    daemon.retune(handle, 30_000, SYS_PID, SYS_TID).unwrap();
    daemon.drain();
    daemon.untune(handle, SYS_PID, SYS_TID).unwrap();
    daemon.drain();

    assert_eq!(daemon.node("knob_a"), DEFAULT_VALUE);
    assert!(daemon.dispatcher.table().is_pristine());
    assert_eq!(daemon.dispatcher.timer_count(), 0);
    assert!(!daemon.core.requests.verify(handle));
}

#[test]
fn infinite_duration_installs_no_timer() {
    let mut daemon = TestDaemon::start();
    let handle = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 9, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();
    assert_eq!(daemon.dispatcher.timer_count(), 0);
    assert_eq!(daemon.node("knob_a"), "9");

    daemon.untune(handle, SYS_PID, SYS_TID).unwrap();
    daemon.drain();
    assert_eq!(daemon.node("knob_a"), DEFAULT_VALUE);
}

#[test]
fn duplicate_tune_is_dropped_without_side_effects() {
    let mut daemon = TestDaemon::start();
    let first = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 11, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();

    let duplicate = daemon.tune(
        SYS_PID,
        SYS_TID,
        KNOB_A,
        11,
        -1,
        RequestPriority::Low,
        Mode::RESUME,
    );
    assert!(matches!(duplicate, Err(Error::Duplicate { .. })));
    daemon.drain();
    assert_eq!(daemon.core.requests.active_count(), 1);

    // A different value from the same thread is not a duplicate.
    let second = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 12, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    assert!(second > first);
}

#[test]
fn untune_of_foreign_handle_is_rejected() {
    let mut daemon = TestDaemon::start();
    let handle = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 5, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    daemon.drain();

    // A different client cannot withdraw it.
    let _ = daemon
        .tune(TP_PID, TP_TID, KNOB_A, 6, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    assert!(matches!(
        daemon.untune(handle, TP_PID, TP_TID),
        Err(Error::ForeignHandle { .. })
    ));
    daemon.drain();
    assert!(daemon.core.requests.verify(handle));
}

#[test]
fn third_party_cannot_touch_system_resources() {
    let daemon = TestDaemon::start();
    let result = daemon.tune(
        TP_PID,
        TP_TID,
        support::PRIVILEGED,
        5,
        -1,
        RequestPriority::Low,
        Mode::RESUME,
    );
    assert!(matches!(result, Err(Error::InsufficientPermission { .. })));
}

#[test]
fn out_of_threshold_and_bad_duration_are_rejected() {
    let daemon = TestDaemon::start();
    assert!(matches!(
        daemon.tune(SYS_PID, SYS_TID, HIB, 5000, -1, RequestPriority::Low, Mode::RESUME),
        Err(Error::ValueOutOfBounds { .. })
    ));
    assert!(matches!(
        daemon.tune(SYS_PID, SYS_TID, HIB, 100, 0, RequestPriority::Low, Mode::RESUME),
        Err(Error::MalformedRequest { .. })
    ));
    assert!(matches!(
        daemon.tune(SYS_PID, SYS_TID, HIB, 100, -2, RequestPriority::Low, Mode::RESUME),
        Err(Error::MalformedRequest { .. })
    ));
}

#[test]
fn untune_racing_its_tune_cancels_it() {
    let mut daemon = TestDaemon::start();
    let handle = daemon
        .tune(SYS_PID, SYS_TID, KNOB_A, 21, -1, RequestPriority::Low, Mode::RESUME)
        .unwrap();
    // The untune is admitted before the dispatcher ever ran; the sticky
    // cancel bit must keep the tune from applying.
    daemon.untune(handle, SYS_PID, SYS_TID).unwrap();
    daemon.drain();

    assert_eq!(daemon.node("knob_a"), DEFAULT_VALUE);
    assert!(!daemon.core.requests.verify(handle));
    assert!(daemon.dispatcher.table().is_pristine());
    assert!(
        daemon
            .core
            .requests
            .bucket_handles(RequestBucket::ActiveTune)
            .is_empty()
    );
}

#[test]
fn handles_are_strictly_monotonic() {
    let daemon = TestDaemon::start();
    let mut last = 0;
    for value in 1..=5 {
        let handle = daemon
            .tune(SYS_PID, SYS_TID, KNOB_A, value, -1, RequestPriority::Low, Mode::RESUME)
            .unwrap();
        assert!(handle > last);
        last = handle;
    }
}
