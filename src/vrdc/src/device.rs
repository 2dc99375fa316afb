//! The configuration and lifecycle orchestrator
use std::{sync::Arc, time::Duration};

use spin::Mutex as SpinMutex;

use crate::{
    buffer::{CorrectionBuffers, Slot},
    config::{clamp_duty, DisplayConfig, Options},
    engine::{DisplayStats, Engine, Worker, WorkerState},
    regs::{self, SysCtrl},
    ChromaticMode, Clock, CoherentMemory, DisplayMode, DistortionMode, EnableError, InitError,
    MotionCompMode, QueryError, RegisterBank, SetConfigError, SetMapError, SyncMode, WaitError,
};

/// The display controller.
///
/// All methods may be called from any thread. Configuration changes and
/// buffer installation are serialized by a single lock, and each change is
/// written to the hardware before the lock is released. The timing worker
/// touches the interrupt registers without taking that lock.
pub struct VrDisplay {
    regs: Arc<dyn RegisterBank>,
    engine: Arc<Engine>,
    inner: SpinMutex<Inner>,
}

struct Inner {
    config: DisplayConfig,
    initialized: bool,
    enabled: bool,
    suspended: bool,
    /// Set while `fini` is joining the worker. `init` is refused until the
    /// teardown completes.
    finalizing: bool,
    worker: Option<Worker>,
    buffers: CorrectionBuffers,
}

/// Write a register. Failures are logged and otherwise ignored; the
/// configuration is the source of truth and will be written again by the next
/// change or by `resume`.
fn write_reg(regs: &dyn RegisterBank, offset: u32, value: u32) {
    log::trace!("write32({offset:#06x}, {value:#010x})");
    if let Err(e) = regs.write32(offset, value) {
        log::warn!("failed to write {value:#010x} to register {offset:#06x}: {e}");
    }
}

impl Inner {
    fn is_busy(&self) -> bool {
        self.initialized || self.finalizing
    }
}

impl VrDisplay {
    pub fn new(
        regs: Arc<dyn RegisterBank>,
        mem: Arc<dyn CoherentMemory>,
        clock: Arc<dyn Clock>,
        options: Options,
    ) -> Self {
        let engine = Arc::new(Engine::new(
            Arc::clone(&regs),
            clock,
            options.config().nominal_period_us(),
            options.get_poll_interval(),
        ));

        Self {
            regs,
            engine,
            inner: SpinMutex::new(Inner {
                config: *options.config(),
                initialized: false,
                enabled: false,
                suspended: false,
                finalizing: false,
                worker: None,
                buffers: CorrectionBuffers::new(mem),
            }),
        }
    }

    /// Write every configuration register from `config`.
    fn apply_config(&self, config: &DisplayConfig) {
        let bank = &*self.regs;
        write_reg(bank, regs::VR_SYNC_CTRL, regs::sync_ctrl(config));
        write_reg(bank, regs::VR_LOW_PERSIST, regs::low_persist(config));
        write_reg(bank, regs::VR_LATENCY_CTRL, regs::latency_ctrl(config));
        write_reg(bank, regs::VR_DISTORTION_CTRL, regs::distortion_ctrl(config));
        write_reg(bank, regs::VR_CHROMATIC_CTRL, regs::chromatic_ctrl(config));
        write_reg(bank, regs::VR_MOTION_COMP, regs::motion_comp(config));
        self.apply_mode(config);
    }

    fn apply_mode(&self, config: &DisplayConfig) {
        let bank = &*self.regs;
        write_reg(bank, regs::VR_DIRECT_MODE, regs::direct_mode(config));
        write_reg(bank, regs::VR_ASYNC_COMMIT, regs::async_commit(config));
        write_reg(bank, regs::VR_LOW_PERSIST, regs::low_persist(config));
    }

    /// Program the configuration registers and start the timing worker in the
    /// Inactive state.
    ///
    /// Configuration changes made before `init` are kept and written here.
    /// Fails with `BadObjectState` if the device is initialized or a `fini` on
    /// another thread hasn't finished yet.
    pub fn init(&self) -> Result<(), InitError> {
        log::trace!("init");
        if self.inner.lock().is_busy() {
            return Err(InitError::BadObjectState);
        }

        // Spawning may take a while, so do it outside the lock
        let worker = self.engine.spawn_worker()?;

        let mut inner = self.inner.lock();
        if inner.is_busy() {
            // Lost a race with another `init` or `fini`
            drop(inner);
            worker.stop();
            return Err(InitError::BadObjectState);
        }

        self.apply_config(&inner.config);
        inner.worker = Some(worker);
        inner.initialized = true;
        inner.enabled = false;
        inner.suspended = false;
        log::debug!("initialized with {:?}", inner.config);
        Ok(())
    }

    /// Stop the timing worker and free all correction buffers. Disables the
    /// controller first if it's enabled. Does nothing if the device isn't
    /// initialized.
    pub fn fini(&self) {
        log::trace!("fini");
        let worker = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return;
            }
            self.disable_locked(&mut inner);
            inner.initialized = false;
            inner.suspended = false;
            inner.finalizing = true;
            inner.worker.take()
        };

        // Join outside the lock; the worker never takes it, but callers
        // shouldn't spin for a whole poll interval
        if let Some(worker) = worker {
            worker.stop();
        }

        let mut inner = self.inner.lock();
        let freed = inner.buffers.release_all();
        inner.finalizing = false;
        drop(inner);
        log::debug!("finalized, freed {freed} correction buffer(s)");
    }

    fn enable_locked(&self, inner: &mut Inner) -> Result<(), EnableError> {
        if !inner.initialized {
            return Err(EnableError::BadObjectState);
        }
        if inner.enabled {
            return Ok(());
        }

        write_reg(&*self.regs, regs::SYS_CTRL, SysCtrl::RUNNING.bits());
        inner.enabled = true;
        if let Some(worker) = &inner.worker {
            worker.activate();
        }
        log::debug!("enabled");
        Ok(())
    }

    fn disable_locked(&self, inner: &mut Inner) {
        if !inner.enabled {
            return;
        }

        write_reg(&*self.regs, regs::SYS_CTRL, SysCtrl::empty().bits());
        inner.enabled = false;
        if let Some(worker) = &inner.worker {
            worker.deactivate();
        }
        log::debug!("disabled");
    }

    /// Enable the controller and activate the timing worker. Does nothing if
    /// it's already enabled.
    pub fn enable(&self) -> Result<(), EnableError> {
        log::trace!("enable");
        self.enable_locked(&mut self.inner.lock())
    }

    /// Disable the controller and deactivate the timing worker. Does nothing
    /// if it's already disabled.
    pub fn disable(&self) {
        log::trace!("disable");
        self.disable_locked(&mut self.inner.lock());
    }

    /// Disable the controller, keeping the configuration. Does nothing if the
    /// device isn't initialized.
    pub fn suspend(&self) -> Result<(), EnableError> {
        log::trace!("suspend");
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Ok(());
        }
        self.disable_locked(&mut inner);
        inner.suspended = true;
        Ok(())
    }

    /// Re-apply the stored mode and enable the controller.
    ///
    /// The mode registers are written even if nothing has changed. Correction
    /// buffer addresses are not written again.
    pub fn resume(&self) -> Result<(), EnableError> {
        log::trace!("resume");
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(EnableError::BadObjectState);
        }
        let config = inner.config;
        self.apply_mode(&config);
        self.enable_locked(&mut inner)?;
        inner.suspended = false;
        Ok(())
    }

    /// Update the configuration with `f` and write it to the hardware with
    /// `apply`, atomically with respect to other configuration changes.
    fn update_config(
        &self,
        f: impl FnOnce(&mut DisplayConfig),
        apply: impl FnOnce(&dyn RegisterBank, &DisplayConfig),
    ) -> Result<(), SetConfigError> {
        let mut inner = self.inner.lock();
        f(&mut inner.config);
        apply(&*self.regs, &inner.config);
        Ok(())
    }

    pub fn set_mode(&self, mode: DisplayMode) -> Result<(), SetConfigError> {
        log::trace!("set_mode({mode:?})");
        self.update_config(|c| c.mode = mode, |_, c| self.apply_mode(c))
    }

    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<(), SetConfigError> {
        log::trace!("set_sync_mode({mode:?})");
        self.update_config(
            |c| c.sync_mode = mode,
            |r, c| write_reg(r, regs::VR_SYNC_CTRL, regs::sync_ctrl(c)),
        )
    }

    /// Set the distortion correction mode.
    ///
    /// This doesn't write the map's address even if the new mode consumes the
    /// map; only [`Self::set_distortion_map`] does.
    pub fn set_distortion_mode(&self, mode: DistortionMode) -> Result<(), SetConfigError> {
        log::trace!("set_distortion_mode({mode:?})");
        self.update_config(
            |c| c.distortion_mode = mode,
            |r, c| write_reg(r, regs::VR_DISTORTION_CTRL, regs::distortion_ctrl(c)),
        )
    }

    pub fn set_chromatic_mode(&self, mode: ChromaticMode) -> Result<(), SetConfigError> {
        log::trace!("set_chromatic_mode({mode:?})");
        self.update_config(
            |c| c.chromatic_mode = mode,
            |r, c| write_reg(r, regs::VR_CHROMATIC_CTRL, regs::chromatic_ctrl(c)),
        )
    }

    pub fn set_motion_comp_mode(&self, mode: MotionCompMode) -> Result<(), SetConfigError> {
        log::trace!("set_motion_comp_mode({mode:?})");
        self.update_config(
            |c| c.motion_comp_mode = mode,
            |r, c| write_reg(r, regs::VR_MOTION_COMP, regs::motion_comp(c)),
        )
    }

    /// Configure low persistence. `duty` is clamped to `0..=100`.
    pub fn set_low_persistence(&self, enable: bool, duty: u32) -> Result<(), SetConfigError> {
        log::trace!("set_low_persistence({enable}, {duty})");
        let duty = clamp_duty(duty);
        self.update_config(
            |c| {
                c.low_persistence = enable;
                c.low_persistence_duty = duty;
            },
            |r, c| write_reg(r, regs::VR_LOW_PERSIST, regs::low_persist(c)),
        )
    }

    pub fn set_fast_path(&self, enable: bool) -> Result<(), SetConfigError> {
        log::trace!("set_fast_path({enable})");
        self.update_config(
            |c| c.fast_path = enable,
            |r, c| {
                write_reg(r, regs::VR_LATENCY_CTRL, regs::latency_ctrl(c));
                write_reg(r, regs::VR_DIRECT_MODE, regs::direct_mode(c));
            },
        )
    }

    pub fn set_bypass_options(
        &self,
        blend: bool,
        scale: bool,
        gamma: bool,
        dither: bool,
    ) -> Result<(), SetConfigError> {
        log::trace!("set_bypass_options({blend}, {scale}, {gamma}, {dither})");
        self.update_config(
            |c| {
                c.bypass_blend = blend;
                c.bypass_scale = scale;
                c.bypass_gamma = gamma;
                c.bypass_dither = dither;
            },
            |r, c| write_reg(r, regs::VR_LATENCY_CTRL, regs::latency_ctrl(c)),
        )
    }

    /// Install a correction buffer. `offset_if_used` yields the register that
    /// receives the buffer's bus address when the current mode consumes the
    /// buffer.
    fn install(
        &self,
        slot: Slot,
        data: &[u8],
        offset_if_used: impl FnOnce(&DisplayConfig) -> Option<u32>,
    ) -> Result<(), SetMapError> {
        let mut inner = self.inner.lock();
        let config = inner.config;
        let bank = &*self.regs;
        // `install` validates `slot` before calling this
        inner.buffers.install(slot, data, |buf| {
            if let Some(offset) = offset_if_used(&config) {
                write_reg(bank, offset, buf.bus_addr());
            }
        })
    }

    /// Install display `display`'s lens distortion map.
    pub fn set_distortion_map(&self, display: usize, data: &[u8]) -> Result<(), SetMapError> {
        log::trace!("set_distortion_map({display}, [{} bytes])", data.len());
        self.install(Slot::Distortion(display), data, |c| {
            c.distortion_mode
                .uses_map()
                .then(|| regs::distortion_coef(display))
        })
    }

    /// Install display `display`'s chromatic aberration map.
    pub fn set_chromatic_map(&self, display: usize, data: &[u8]) -> Result<(), SetMapError> {
        log::trace!("set_chromatic_map({display}, [{} bytes])", data.len());
        self.install(Slot::Chromatic(display), data, |c| {
            c.chromatic_mode
                .uses_map()
                .then(|| regs::chromatic_coef(display))
        })
    }

    /// Install the device-wide motion vectors.
    pub fn set_motion_vectors(&self, data: &[u8]) -> Result<(), SetMapError> {
        log::trace!("set_motion_vectors([{} bytes])", data.len());
        self.install(Slot::MotionVectors, data, |c| {
            c.motion_comp_mode
                .uses_vectors()
                .then_some(regs::VR_MOTION_VECTOR)
        })
    }

    /// Block until the next vsync of display `display` or until `timeout`
    /// elapses. See [`crate::DEFAULT_WAIT_TIMEOUT`].
    pub fn wait_for_vsync(&self, display: usize, timeout: Duration) -> Result<(), WaitError> {
        self.engine.wait_for_vsync(display, timeout)
    }

    /// Block until the next commit-done event of display `display` or until
    /// `timeout` elapses.
    pub fn wait_for_commit(&self, display: usize, timeout: Duration) -> Result<(), WaitError> {
        self.engine.wait_for_commit(display, timeout)
    }

    /// Get the smoothed vsync period of display `display` in microseconds.
    pub fn get_vsync_period(&self, display: usize) -> Result<u32, QueryError> {
        self.engine.vsync_period(display)
    }

    /// Get the smoothed commit interval of display `display` in microseconds.
    pub fn get_commit_latency(&self, display: usize) -> Result<u32, QueryError> {
        self.engine.commit_latency(display)
    }

    pub fn frame_count(&self, display: usize) -> Result<u64, QueryError> {
        self.engine.frame_count(display)
    }

    pub fn stats(&self, display: usize) -> Result<DisplayStats, QueryError> {
        self.engine.stats(display)
    }

    /// Get a copy of the current configuration.
    pub fn config(&self) -> DisplayConfig {
        self.inner.lock().config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    pub fn worker_state(&self) -> WorkerState {
        self.inner
            .lock()
            .worker
            .as_ref()
            .map_or(WorkerState::Stopped, Worker::state)
    }
}

impl Drop for VrDisplay {
    fn drop(&mut self) {
        self.fini();
    }
}

impl std::fmt::Debug for VrDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VrDisplay")
            .field("config", &inner.config)
            .field("initialized", &inner.initialized)
            .field("enabled", &inner.enabled)
            .field("suspended", &inner.suspended)
            .field("buffers", &inner.buffers)
            .field("engine", &self.engine)
            .finish()
    }
}
