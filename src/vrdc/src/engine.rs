//! The event/timing engine
//!
//! A dedicated worker thread polls [`INTR_STATUS`], acknowledges the pending
//! bits, and turns vsync and commit-done events into per-display statistics.
//! Threads blocked in [`Engine::wait_for_vsync`] and
//! [`Engine::wait_for_commit`] are released on every event.
//!
//! ```text
//!            spawn              activate
//!  Stopped ─────────▶ Inactive ─────────▶ Active
//!     ▲                 │   ◀─────────       │
//!     │                 │    deactivate      │
//!     └─────────────────┴────────────────────┘
//!                      stop
//! ```
//!
//! The statistics of each display have a single writer (the worker) and are
//! stored in word-sized atomics. A snapshot read sees each field
//! individually; there is no consistency across fields.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    regs::{IntrStatus, INTR_CLEAR, INTR_STATUS},
    wait::{WaitQueue, WaitTimeout},
    Clock, InitError, QueryError, RegisterBank, WaitError, NUM_DISPLAYS,
};

/// A display whose last vsync is older than this has its vsync period reset
/// to the nominal value.
pub const VSYNC_STALE_US: u64 = 1_000_000;

/// The default timeout of a wait operation.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// `last_vsync_ts` and `last_commit_ts` hold this value until the first event.
const NO_TIMESTAMP: u64 = u64::MAX;

/// Update an exponential moving average with weights 7/8 (history) and 1/8
/// (sample).
#[inline]
pub fn ema(average: u32, sample_us: u64) -> u32 {
    let next = (average as u64 * 7).saturating_add(sample_us) / 8;
    next.min(u32::MAX as u64) as u32
}

/// The state of the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker thread exists.
    Stopped,
    /// The worker is blocked waiting for activation.
    Inactive,
    /// The worker is polling the interrupt status.
    Active,
}

/// A snapshot of a display's timing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayStats {
    pub frame_counter: u64,
    pub vsync_period_us: u32,
    pub commit_latency_us: u32,
    /// The timestamp of the last vsync, or `None` if none has arrived yet.
    pub last_vsync_us: Option<u64>,
    /// The timestamp of the last commit, or `None` if none has arrived yet.
    pub last_commit_us: Option<u64>,
}

/// Per-display timing state.
#[derive(Debug)]
struct DisplayTiming {
    frame_counter: AtomicU64,
    last_vsync_ts: AtomicU64,
    last_commit_ts: AtomicU64,
    vsync_period_us: AtomicU32,
    commit_latency_us: AtomicU32,
    vsync_wait: WaitQueue,
    commit_wait: WaitQueue,
}

impl DisplayTiming {
    fn new(nominal_period_us: u32) -> Self {
        Self {
            frame_counter: AtomicU64::new(0),
            last_vsync_ts: AtomicU64::new(NO_TIMESTAMP),
            last_commit_ts: AtomicU64::new(NO_TIMESTAMP),
            vsync_period_us: AtomicU32::new(nominal_period_us),
            commit_latency_us: AtomicU32::new(0),
            vsync_wait: WaitQueue::new(),
            commit_wait: WaitQueue::new(),
        }
    }
}

/// Fold the interval since `*last_ts` into `average` and advance `*last_ts`.
fn record_event(last_ts: &AtomicU64, average: &AtomicU32, now: u64) {
    let last = last_ts.load(Ordering::Relaxed);
    if last != NO_TIMESTAMP {
        let delta = now.saturating_sub(last);
        average.store(ema(average.load(Ordering::Relaxed), delta), Ordering::Relaxed);
    }
    last_ts.store(now, Ordering::Relaxed);
}

fn timestamp(x: &AtomicU64) -> Option<u64> {
    Some(x.load(Ordering::Relaxed)).filter(|&ts| ts != NO_TIMESTAMP)
}

/// The timing engine. Shared between the worker thread and callers.
pub struct Engine {
    regs: Arc<dyn RegisterBank>,
    clock: Arc<dyn Clock>,
    displays: [DisplayTiming; NUM_DISPLAYS],
    nominal_period_us: u32,
    poll_interval: Duration,
}

/// The control flags of one worker thread. Each spawned worker gets its own
/// set, so a worker that's being stopped can't disturb its successor.
#[derive(Debug)]
struct WorkerControl {
    /// Set by `activate`/`deactivate` from any thread.
    activation: AtomicBool,
    /// Set when the worker is spawned, cleared by the worker when it exits.
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl Engine {
    pub fn new(
        regs: Arc<dyn RegisterBank>,
        clock: Arc<dyn Clock>,
        nominal_period_us: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            regs,
            clock,
            displays: [(); NUM_DISPLAYS].map(|()| DisplayTiming::new(nominal_period_us)),
            nominal_period_us,
            poll_interval,
        }
    }

    fn display(&self, i: usize) -> Result<&DisplayTiming, QueryError> {
        self.displays.get(i).ok_or(QueryError::InvalidArgument)
    }

    /// Spawn the worker thread. The worker starts in the Inactive state.
    pub fn spawn_worker(self: &Arc<Self>) -> Result<Worker, InitError> {
        let (wake_send, wake_recv) = mpsc::channel();

        let control = Arc::new(WorkerControl {
            activation: AtomicBool::new(false),
            // The worker clears this when it exits
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
        });

        log::trace!("starting the timing worker");
        let engine = Arc::clone(self);
        let worker_control = Arc::clone(&control);
        let join_handle = thread::Builder::new()
            .name("vrdc-timing".into())
            .spawn(move || engine.run(&worker_control, wake_recv))
            .map_err(|e| {
                log::warn!("failed to spawn the timing worker: {e}");
                InitError::OutOfMemory
            })?;

        Ok(Worker {
            control,
            join_handle,
            wake_send,
        })
    }

    fn run(&self, control: &WorkerControl, wake_recv: mpsc::Receiver<()>) {
        log::debug!("timing worker is running");

        loop {
            if control.stop_requested.load(Ordering::Acquire) {
                break;
            }

            if !control.activation.load(Ordering::Acquire) {
                // Block until `activate`, `deactivate`, or `stop` sends a
                // wake-up token. There's no timeout.
                log::trace!("timing worker is inactive");
                match wake_recv.recv() {
                    Ok(()) => continue,
                    Err(mpsc::RecvError) => break,
                }
            }

            self.poll_once();

            // Sleep until the next poll. A wake-up token cuts the sleep short
            // so that a state change is observed promptly.
            match wake_recv.recv_timeout(self.poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        control.running.store(false, Ordering::Release);
        log::debug!("timing worker exited");
    }

    /// Process the pending interrupts once and refresh stale statistics.
    pub(crate) fn poll_once(&self) {
        let status = self.regs.read32(INTR_STATUS);

        if status != 0 {
            // The acknowledgement is best-effort. An uncleared bit is simply
            // observed again by the next poll.
            if let Err(e) = self.regs.write32(INTR_CLEAR, status) {
                log::warn!("failed to clear interrupt status {status:#010x}: {e}");
            }

            let status = IntrStatus::from_bits_retain(status);
            for i in 0..NUM_DISPLAYS {
                if status.contains(IntrStatus::vsync(i)) {
                    self.handle_vsync(i);
                }
                if status.contains(IntrStatus::commit(i)) {
                    self.handle_commit(i);
                }
            }
        }

        let now = self.clock.now_us();
        for (i, display) in self.displays.iter().enumerate() {
            match timestamp(&display.last_vsync_ts) {
                Some(last) if now.saturating_sub(last) > VSYNC_STALE_US => {
                    if display.vsync_period_us.load(Ordering::Relaxed) != self.nominal_period_us {
                        log::debug!("display {i}: vsync is stale, resetting its period");
                    }
                    display
                        .vsync_period_us
                        .store(self.nominal_period_us, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn handle_vsync(&self, i: usize) {
        let display = &self.displays[i];
        let now = self.clock.now_us();

        display.frame_counter.fetch_add(1, Ordering::Relaxed);
        record_event(&display.last_vsync_ts, &display.vsync_period_us, now);
        display.vsync_wait.wake_all();
    }

    pub(crate) fn handle_commit(&self, i: usize) {
        let display = &self.displays[i];
        let now = self.clock.now_us();

        record_event(&display.last_commit_ts, &display.commit_latency_us, now);
        display.commit_wait.wake_all();
    }

    /// Block until the next vsync of display `i` or until `timeout` elapses.
    pub fn wait_for_vsync(&self, i: usize, timeout: Duration) -> Result<(), WaitError> {
        let display = self.display(i)?;
        display
            .vsync_wait
            .wait_timeout(timeout)
            .map_err(|WaitTimeout| WaitError::Timeout)
    }

    /// Block until the next commit-done event of display `i` or until
    /// `timeout` elapses.
    pub fn wait_for_commit(&self, i: usize, timeout: Duration) -> Result<(), WaitError> {
        let display = self.display(i)?;
        display
            .commit_wait
            .wait_timeout(timeout)
            .map_err(|WaitTimeout| WaitError::Timeout)
    }

    pub fn vsync_period(&self, i: usize) -> Result<u32, QueryError> {
        Ok(self.display(i)?.vsync_period_us.load(Ordering::Relaxed))
    }

    pub fn commit_latency(&self, i: usize) -> Result<u32, QueryError> {
        Ok(self.display(i)?.commit_latency_us.load(Ordering::Relaxed))
    }

    pub fn frame_count(&self, i: usize) -> Result<u64, QueryError> {
        Ok(self.display(i)?.frame_counter.load(Ordering::Relaxed))
    }

    pub fn stats(&self, i: usize) -> Result<DisplayStats, QueryError> {
        let display = self.display(i)?;
        Ok(DisplayStats {
            frame_counter: display.frame_counter.load(Ordering::Relaxed),
            vsync_period_us: display.vsync_period_us.load(Ordering::Relaxed),
            commit_latency_us: display.commit_latency_us.load(Ordering::Relaxed),
            last_vsync_us: timestamp(&display.last_vsync_ts),
            last_commit_us: timestamp(&display.last_commit_ts),
        })
    }
}

/// The handle of a running worker thread.
///
/// Dropping a `Worker` without calling [`Worker::stop`] detaches the thread;
/// it exits on its own when it observes that the handle is gone.
#[derive(Debug)]
pub struct Worker {
    control: Arc<WorkerControl>,
    join_handle: thread::JoinHandle<()>,
    wake_send: mpsc::Sender<()>,
}

impl Worker {
    fn wake(&self) {
        // Fails only if the worker has already exited
        let _ = self.wake_send.send(());
    }

    /// Make the worker start polling.
    pub fn activate(&self) {
        log::debug!("activating the timing worker");
        self.control.activation.store(true, Ordering::Release);
        self.wake();
    }

    /// Make the worker stop polling and block.
    pub fn deactivate(&self) {
        log::debug!("deactivating the timing worker");
        self.control.activation.store(false, Ordering::Release);
        self.wake();
    }

    pub fn state(&self) -> WorkerState {
        if !self.control.running.load(Ordering::Acquire) {
            WorkerState::Stopped
        } else if self.control.activation.load(Ordering::Acquire) {
            WorkerState::Active
        } else {
            WorkerState::Inactive
        }
    }

    /// Request the worker to exit and wait until it does.
    pub fn stop(self) {
        log::trace!("stopping the timing worker");
        let Self {
            control,
            join_handle,
            wake_send,
        } = self;

        control.stop_requested.store(true, Ordering::Release);
        // Hanging up also ends the loop, whichever wait the worker is in
        let _ = wake_send.send(());
        drop(wake_send);

        if join_handle.join().is_err() {
            log::warn!("the timing worker panicked");
        }
        log::trace!("stopped the timing worker");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("displays", &self.displays)
            .field("nominal_period_us", &self.nominal_period_us)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegisterAccessError;
    use quickcheck_macros::quickcheck;
    use std::time::Instant;

    #[derive(Default)]
    struct TestRegs {
        status: AtomicU32,
        clears: AtomicU32,
        fail_clear: AtomicBool,
    }

    impl RegisterBank for TestRegs {
        fn read32(&self, offset: u32) -> u32 {
            assert_eq!(offset, INTR_STATUS);
            self.status.load(Ordering::Relaxed)
        }

        fn write32(&self, offset: u32, value: u32) -> Result<(), RegisterAccessError> {
            assert_eq!(offset, INTR_CLEAR);
            self.clears.fetch_add(1, Ordering::Relaxed);
            if self.fail_clear.load(Ordering::Relaxed) {
                return Err(RegisterAccessError::Io);
            }
            self.status.fetch_and(!value, Ordering::Relaxed);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestClock(AtomicU64);

    impl Clock for TestClock {
        fn now_us(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn init_logger() {
        let _ = env_logger::try_init();
    }

    fn engine() -> (Arc<Engine>, Arc<TestRegs>, Arc<TestClock>) {
        init_logger();
        let regs = Arc::new(TestRegs::default());
        let clock = Arc::new(TestClock::default());
        clock.0.store(5_000_000, Ordering::Relaxed);
        let engine = Arc::new(Engine::new(
            regs.clone(),
            clock.clone(),
            11_111,
            Duration::from_millis(1),
        ));
        (engine, regs, clock)
    }

    #[test]
    fn ema_weights() {
        assert_eq!(ema(800, 0), 700);
        assert_eq!(ema(0, 800), 100);
        assert_eq!(ema(11_100, 11_100), 11_100);
        assert_eq!(ema(u32::MAX, u64::MAX), u32::MAX);
    }

    #[quickcheck]
    fn qc_ema_stays_between_average_and_sample(average: u32, sample: u32) {
        let next = ema(average, sample as u64);
        let (lo, hi) = if average < sample {
            (average, sample)
        } else {
            (sample, average)
        };
        // Truncation may undershoot the lower bound by one
        assert!(next >= lo.saturating_sub(1) && next <= hi, "{next} ∉ [{lo}, {hi}]");
    }

    #[test]
    fn vsync_counts_per_display() {
        let (engine, _, clock) = engine();
        for _ in 0..5 {
            clock.0.fetch_add(11_000, Ordering::Relaxed);
            engine.handle_vsync(0);
        }
        assert_eq!(engine.frame_count(0), Ok(5));
        assert_eq!(engine.frame_count(1), Ok(0));
    }

    #[test]
    fn vsync_period_converges() {
        let (engine, _, clock) = engine();
        for _ in 0..10 {
            clock.0.fetch_add(11_100, Ordering::Relaxed);
            engine.handle_vsync(0);
        }
        let period = engine.vsync_period(0).unwrap();
        assert!((10_000..=12_000).contains(&period), "{period}");
    }

    #[test]
    fn first_event_only_records_timestamp() {
        let (engine, _, clock) = engine();
        engine.handle_commit(1);
        let stats = engine.stats(1).unwrap();
        assert_eq!(stats.commit_latency_us, 0);
        assert_eq!(stats.last_commit_us, Some(5_000_000));
        assert_eq!(stats.last_vsync_us, None);

        clock.0.fetch_add(8_000, Ordering::Relaxed);
        engine.handle_commit(1);
        assert_eq!(engine.commit_latency(1), Ok(1_000));
        assert_eq!(engine.commit_latency(0), Ok(0));
    }

    #[test]
    fn poll_dispatches_and_clears() {
        let (engine, regs, _) = engine();
        regs.status.store(
            (IntrStatus::VSYNC1 | IntrStatus::COMMIT0).bits(),
            Ordering::Relaxed,
        );
        engine.poll_once();

        assert_eq!(regs.status.load(Ordering::Relaxed), 0);
        assert_eq!(regs.clears.load(Ordering::Relaxed), 1);
        assert_eq!(engine.frame_count(0), Ok(0));
        assert_eq!(engine.frame_count(1), Ok(1));
        assert!(engine.stats(0).unwrap().last_commit_us.is_some());

        // Nothing pending, nothing written
        engine.poll_once();
        assert_eq!(regs.clears.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_clear_still_dispatches() {
        let (engine, regs, _) = engine();
        regs.fail_clear.store(true, Ordering::Relaxed);
        regs.status.store(IntrStatus::VSYNC0.bits(), Ordering::Relaxed);

        engine.poll_once();
        assert_eq!(engine.frame_count(0), Ok(1));

        // The bit is still set, so the next poll sees it again
        engine.poll_once();
        assert_eq!(engine.frame_count(0), Ok(2));
    }

    #[test]
    fn stale_vsync_resets_period() {
        let (engine, _, clock) = engine();
        engine.handle_vsync(0);
        clock.0.fetch_add(4_000, Ordering::Relaxed);
        engine.handle_vsync(0);
        assert_ne!(engine.vsync_period(0), Ok(11_111));

        clock.0.fetch_add(VSYNC_STALE_US, Ordering::Relaxed);
        engine.poll_once();
        assert_ne!(engine.vsync_period(0), Ok(11_111), "exactly 1 s is not stale");

        clock.0.fetch_add(1, Ordering::Relaxed);
        engine.poll_once();
        assert_eq!(engine.vsync_period(0), Ok(11_111));
    }

    #[test]
    fn bad_display_index() {
        let (engine, _, _) = engine();
        assert_eq!(engine.vsync_period(NUM_DISPLAYS), Err(QueryError::InvalidArgument));
        assert_eq!(
            engine.wait_for_vsync(NUM_DISPLAYS, Duration::ZERO),
            Err(WaitError::InvalidArgument)
        );
    }

    #[test]
    fn vsync_wakes_only_its_display() {
        let (engine, _, _) = engine();
        let engine2 = Arc::clone(&engine);
        let other = thread::spawn(move || engine2.wait_for_vsync(1, Duration::from_millis(300)));

        let start = Instant::now();
        while engine.displays[1].vsync_wait.is_empty() {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::yield_now();
        }
        engine.handle_vsync(0);

        assert_eq!(other.join().unwrap(), Err(WaitError::Timeout));
    }

    #[test]
    fn worker_lifecycle() {
        let (engine, regs, _) = engine();

        let worker = engine.spawn_worker().unwrap();
        assert_eq!(worker.state(), WorkerState::Inactive);

        // Inactive: pending interrupts are left alone
        regs.status.store(IntrStatus::VSYNC0.bits(), Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.frame_count(0), Ok(0));

        worker.activate();
        assert_eq!(worker.state(), WorkerState::Active);
        let start = Instant::now();
        while engine.frame_count(0) != Ok(1) {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::yield_now();
        }

        worker.deactivate();
        assert_eq!(worker.state(), WorkerState::Inactive);

        worker.stop();
    }

    #[test]
    fn stopping_old_worker_leaves_new_one_alone() {
        let (engine, regs, _) = engine();
        let old = engine.spawn_worker().unwrap();
        let new = engine.spawn_worker().unwrap();
        new.activate();

        old.stop();
        assert_eq!(new.state(), WorkerState::Active);

        // The new worker is still polling
        regs.status.store(IntrStatus::VSYNC1.bits(), Ordering::Relaxed);
        let start = Instant::now();
        while engine.frame_count(1) != Ok(1) {
            assert!(start.elapsed() < Duration::from_secs(10));
            thread::yield_now();
        }

        new.stop();
    }

    #[test]
    fn stop_returns_while_a_successor_runs() {
        let (engine, _, _) = engine();
        for _ in 0..100 {
            let old = engine.spawn_worker().unwrap();
            let new = engine.spawn_worker().unwrap();
            old.stop();
            assert_eq!(new.state(), WorkerState::Inactive);
            new.stop();
        }
    }
}
