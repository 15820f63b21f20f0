use clap::Parser;
use tangsoc::{Args, build_soc, display};
use tracing::info;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Create SoC
    info!("=== Creating SoC ===");
    let soc = build_soc(&args).unwrap_or_else(|e| panic!("Failed to create SoC: {}", e));

    // Run with display
    info!("=== Starting SoC with Display ===");
    info!("Board: {}, selector {}", args.board, args.selector);

    display::run(soc).expect("Failed to run display");
}
