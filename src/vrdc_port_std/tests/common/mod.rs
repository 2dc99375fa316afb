//! Shared test fixtures
#![allow(dead_code)]
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use vrdc::{Options, VrDisplay};
use vrdc_port_std::{sim_display, HeapMemory, ManualClock, SimRegisterBank};

pub struct Fixture {
    pub display: VrDisplay,
    pub regs: Arc<SimRegisterBank>,
    pub mem: Arc<HeapMemory>,
    pub clock: Arc<ManualClock>,
}

pub fn fixture(options: Options) -> Fixture {
    vrdc_port_std::init_logger();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let (display, regs, mem) = sim_display(options, clock.clone());
    Fixture {
        display,
        regs,
        mem,
        clock,
    }
}

/// Spin until `cond` holds. Panics after a generous deadline.
#[track_caller]
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not met in time"
        );
        thread::sleep(Duration::from_micros(200));
    }
}
