use clap::Parser;
use tangsoc::{Args, StopReason, build_soc};
use tracing::info;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }
    if args.frames.is_none() && args.max_ticks.is_none() && args.timeout_ms.is_none() {
        eprintln!("Error: headless runs need --frames, --max-ticks or --timeout-ms");
        std::process::exit(2);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Create SoC
    info!("=== Creating SoC ===");
    let mut soc = match build_soc(&args) {
        Ok(soc) => soc,
        Err(e) => {
            eprintln!("Failed to create SoC: {}", e);
            std::process::exit(2);
        }
    };

    // Run SoC
    info!("=== Running SoC (Headless) ===");
    let stop_reason = soc.run();

    // Log final state
    let stats = soc.stats();
    info!("=== Simulation Complete ===");
    info!("Stop reason: {:?}", stop_reason);
    info!(
        "Ticks: sys {} hdmi {} nes {}",
        stats.sys_ticks, stats.hdmi_ticks, stats.nes_ticks
    );
    info!(
        "Frames: {} (starved pixels: {}, bus errors: {}, ROM reads: {}, SD irqs: {})",
        stats.frames, stats.starved, stats.bus_errors, stats.rom_relayed, stats.sd_irqs
    );
    info!("Simulated time: {:.6} s", soc.scheduler().now_seconds());
    info!("Elapsed: {:?}", soc.elapsed());

    if let Some(path) = &args.dump_frame {
        if let Err(e) = std::fs::write(path, soc.sink().to_ppm()) {
            eprintln!("Failed to write frame to {:?}: {}", path, e);
            std::process::exit(2);
        }
        info!("Frame written to {:?}", path);
    }

    let exit_code = match stop_reason {
        StopReason::Error(msg) => {
            eprintln!("Simulation error: {}", msg);
            2
        }
        StopReason::FrameLimit => {
            info!("PASS: {} frames displayed", stats.frames);
            0
        }
        StopReason::TickLimit => {
            eprintln!("Tick limit reached after {} frames", stats.frames);
            1
        }
        StopReason::Timeout => {
            eprintln!("Timeout reached after {} frames", stats.frames);
            1
        }
    };

    std::process::exit(exit_code);
}
