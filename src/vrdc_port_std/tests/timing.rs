//! Drives the timing worker through the simulated register bank
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use vrdc::{regs, Options, RegisterBank, WaitError, WorkerState, NUM_DISPLAYS, VSYNC_STALE_US};

mod common;
use common::{fixture, wait_until, Fixture};

const NOMINAL_PERIOD_US: u32 = 1_000_000 / 90;

fn running() -> Fixture {
    let f = fixture(Options::new());
    f.display.init().unwrap();
    f.display.enable().unwrap();
    f
}

/// Raise one vsync of display `i` and wait until the worker has counted it.
fn vsync(f: &Fixture, i: usize) {
    let expected = f.display.frame_count(i).unwrap() + 1;
    f.regs.raise_vsync(i);
    wait_until(|| f.display.frame_count(i).unwrap() == expected);
}

#[test]
fn frame_counter_is_per_display() {
    let f = running();
    for _ in 0..7 {
        f.clock.advance(11_000);
        vsync(&f, 0);
    }
    assert_eq!(f.display.frame_count(0), Ok(7));
    assert_eq!(f.display.frame_count(1), Ok(0));
    assert_eq!(f.display.show("frame_count").unwrap(), "7 0");
}

#[test]
fn vsync_period_tracks_events() {
    let f = running();
    assert_eq!(f.display.get_vsync_period(0), Ok(NOMINAL_PERIOD_US));

    for _ in 0..10 {
        f.clock.advance(11_100);
        vsync(&f, 0);
    }
    let period = f.display.get_vsync_period(0).unwrap();
    assert!((10_000..=12_000).contains(&period), "{period}");

    let stats = f.display.stats(0).unwrap();
    assert_eq!(stats.frame_counter, 10);
    assert_eq!(stats.vsync_period_us, period);
    assert_eq!(stats.last_vsync_us, Some(1_000_000 + 11_100 * 10));
    assert_eq!(stats.last_commit_us, None);
}

#[test]
fn commit_interval_tracks_events() {
    let f = running();
    f.regs.raise_commit(1);
    wait_until(|| f.display.stats(1).unwrap().last_commit_us.is_some());
    assert_eq!(f.display.get_commit_latency(1), Ok(0));

    f.clock.advance(8_000);
    f.regs.raise_commit(1);
    wait_until(|| f.display.get_commit_latency(1) == Ok(1_000));
    assert_eq!(f.display.get_commit_latency(0), Ok(0));
}

#[test]
fn stale_vsync_resets_period() {
    let f = running();
    vsync(&f, 1);
    f.clock.advance(4_000);
    vsync(&f, 1);
    assert_ne!(f.display.get_vsync_period(1), Ok(NOMINAL_PERIOD_US));

    f.clock.advance(VSYNC_STALE_US + 1);
    wait_until(|| f.display.get_vsync_period(1) == Ok(NOMINAL_PERIOD_US));
}

#[test]
fn interrupts_are_acknowledged() {
    let f = running();
    vsync(&f, 0);
    wait_until(|| f.regs.read32(regs::INTR_STATUS) == 0);
    assert!(f.regs.write_count(regs::INTR_CLEAR) >= 1);
}

#[test]
fn failed_acknowledgement_is_tolerated() {
    let f = running();
    f.regs.set_fail_clear(true);
    f.regs.raise_vsync(0);

    // The bit stays set, so every poll sees another vsync
    wait_until(|| f.display.frame_count(0).unwrap() >= 3);

    f.regs.set_fail_clear(false);
    wait_until(|| f.regs.read32(regs::INTR_STATUS) == 0);
}

#[test]
fn inactive_worker_ignores_interrupts() {
    let f = fixture(Options::new());
    f.display.init().unwrap();
    assert_eq!(f.display.worker_state(), WorkerState::Inactive);

    f.regs.raise_vsync(0);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(f.display.frame_count(0), Ok(0));

    f.display.enable().unwrap();
    wait_until(|| f.display.frame_count(0) == Ok(1));
}

#[test]
fn wait_for_vsync_is_released_by_vsync() {
    let f = running();
    let regs = f.regs.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let raiser = thread::spawn(move || {
        while !done2.load(Ordering::Relaxed) {
            regs.raise_vsync(0);
            thread::sleep(Duration::from_millis(2));
        }
    });

    let result = f.display.wait_for_vsync(0, Duration::from_millis(100));
    done.store(true, Ordering::Relaxed);
    raiser.join().unwrap();
    assert_eq!(result, Ok(()));
}

#[test]
fn wait_for_commit_is_released_by_commit() {
    let f = running();
    let regs = f.regs.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let raiser = thread::spawn(move || {
        while !done2.load(Ordering::Relaxed) {
            regs.raise_commit(1);
            thread::sleep(Duration::from_millis(2));
        }
    });

    let result = f.display.wait_for_commit(1, Duration::from_millis(100));
    done.store(true, Ordering::Relaxed);
    raiser.join().unwrap();
    assert_eq!(result, Ok(()));
    assert!(f.display.stats(1).unwrap().last_commit_us.is_some());
    assert_eq!(f.display.stats(0).unwrap().last_commit_us, None);
}

#[test]
fn wait_for_vsync_times_out() {
    let f = running();
    assert_eq!(
        f.display.wait_for_vsync(0, Duration::from_millis(50)),
        Err(WaitError::Timeout)
    );
    assert_eq!(
        f.display.wait_for_commit(1, Duration::from_millis(10)),
        Err(WaitError::Timeout)
    );
}

#[test]
fn vsync_of_other_display_does_not_release_waiter() {
    let f = running();
    let regs = f.regs.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let raiser = thread::spawn(move || {
        while !done2.load(Ordering::Relaxed) {
            regs.raise_vsync(0);
            thread::sleep(Duration::from_millis(1));
        }
    });

    let result = f.display.wait_for_vsync(1, Duration::from_millis(200));
    done.store(true, Ordering::Relaxed);
    raiser.join().unwrap();

    assert_eq!(result, Err(WaitError::Timeout));
    assert!(f.display.frame_count(0).unwrap() > 0);
    assert_eq!(f.display.frame_count(1), Ok(0));
}

#[test]
fn bad_display_index() {
    let f = running();
    assert!(f.display.get_vsync_period(NUM_DISPLAYS).is_err());
    assert!(f.display.stats(NUM_DISPLAYS).is_err());
    assert_eq!(
        f.display.wait_for_commit(NUM_DISPLAYS, Duration::ZERO),
        Err(WaitError::InvalidArgument)
    );
}
