//! Boots a display controller against the simulation, lets it run for a
//! while, and logs its statistics.
//!
//! ```text
//! RUST_LOG=info vrdc_sim [REFRESH_HZ] [DURATION_MS]
//! ```
use std::{error::Error, sync::Arc, time::Duration};
use vrdc::{DistortionMode, Options, SystemClock, DEFAULT_WAIT_TIMEOUT, NUM_DISPLAYS};
use vrdc_port_std::{sim_display, VsyncSource};

fn parse_arg<T: std::str::FromStr>(index: usize, default: T) -> Result<T, Box<dyn Error>> {
    match std::env::args().nth(index) {
        Some(arg) => arg
            .parse()
            .map_err(|_| format!("invalid argument: {arg:?}").into()),
        None => Ok(default),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    vrdc_port_std::env_logger::init();

    let refresh_hz: u32 = parse_arg(1, 90)?;
    let duration_ms: u64 = parse_arg(2, 1000)?;

    let options = Options::new()
        .target_vrefresh(refresh_hz)
        .distortion_mode(DistortionMode::Mesh);
    let (display, regs, mem) = sim_display(options, Arc::new(SystemClock));

    display.init()?;
    for i in 0..NUM_DISPLAYS {
        let mesh: Vec<u8> = (0..4096).map(|x| (x ^ i) as u8).collect();
        display.set_distortion_map(i, &mesh)?;
    }
    display.enable()?;

    let period = Duration::from_micros(1_000_000 / u64::from(refresh_hz.max(1)));
    let source = VsyncSource::start(regs.clone(), period, true);

    display.wait_for_vsync(0, DEFAULT_WAIT_TIMEOUT.max(period * 4))?;
    std::thread::sleep(Duration::from_millis(duration_ms));
    drop(source);

    for i in 0..NUM_DISPLAYS {
        let stats = display.stats(i)?;
        log::info!(
            "display {i}: {} frames, vsync period {} μs, commit interval {} μs",
            stats.frame_counter,
            stats.vsync_period_us,
            stats.commit_latency_us,
        );
    }

    display.fini();
    log::info!("{mem:?}");
    log::info!("{} register writes", regs.writes().len());
    Ok(())
}
