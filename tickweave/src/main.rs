//! tickweave headless runner.
//!
//! Runs the simulation engine against a local simulated narrative provider.
//!
//! ```bash
//! cargo run -p tickweave -- --ticks 1200 --seed 7 --inputs demos/village.txt --save run.json
//! cargo run -p tickweave -- --verify run.json
//! ```

mod headless;
mod provider;

use headless::{parse_options_from_args, run_headless, RunOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let options = match parse_options_from_args(&args, RunOptions::from_env()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    run_headless(options).await
}

fn print_help() {
    println!("tickweave - deterministic simulation with asynchronous narrative");
    println!();
    println!("USAGE:");
    println!("  tickweave [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help              Show this help message");
    println!("  --ticks <N>             Ticks to run (default: 600)");
    println!("  --seed <S>              Session seed (default: from config)");
    println!("  --config <FILE>         Engine config JSON");
    println!("  --inputs <FILE>         Player input script, '<tick> <command>' per line");
    println!("  --save <FILE>           Save the session when done");
    println!("  --load <FILE>           Resume a saved session (its log is verified first)");
    println!("  --verify <FILE>         Replay a saved session and report divergence");
    println!("  --failure-rate <P>      Simulated provider failure probability (default: 0.1)");
    println!("  --fast                  Run ticks back to back instead of in real time");
    println!("  -q, --quiet             Only print the summary");
    println!();
    println!("ENVIRONMENT:");
    println!("  RUST_LOG                Log filter (default: info)");
    println!("  TICKWEAVE_TICKS, TICKWEAVE_SEED, TICKWEAVE_FAILURE_RATE, TICKWEAVE_CONFIG");
    println!();
    println!("COMMANDS (in input scripts):");
    println!("  move <entity> <x> <y>, cheer <entity> <delta>, grant <resource> <amount>,");
    println!("  trigger <event>, spawn <name> [faction]; append '-- text' for flavor");
}
