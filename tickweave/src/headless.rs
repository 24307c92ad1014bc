//! Headless runner.
//!
//! Runs a session for a fixed number of ticks against the simulated
//! provider, feeding player inputs from a script file, and prints what
//! happened. Also saves, loads and verifies sessions.
//!
//! Input scripts hold one `<tick> <command>` per line; blank lines and lines
//! starting with `#` are skipped:
//!
//! ```text
//! 10 cheer 2 0.5 -- Ansel hears good news
//! 40 trigger storm
//! ```

use crate::provider::SimulatedProvider;
use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tickweave_core::scheduler::InputResult;
use tickweave_core::{EngineConfig, NarrativeProvider, Session, TickReport};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Options for a headless run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ticks: u64,
    pub seed: Option<u64>,
    pub config: Option<PathBuf>,
    pub inputs: Option<PathBuf>,
    pub save: Option<PathBuf>,
    pub load: Option<PathBuf>,
    pub verify: Option<PathBuf>,
    pub failure_rate: f64,
    /// Run ticks back to back instead of at the configured rate.
    pub fast: bool,
    pub quiet: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ticks: 600,
            seed: None,
            config: None,
            inputs: None,
            save: None,
            load: None,
            verify: None,
            failure_rate: 0.1,
            fast: false,
            quiet: false,
        }
    }
}

impl RunOptions {
    /// Apply `TICKWEAVE_*` environment overrides. Command-line flags are
    /// parsed afterwards and win.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(ticks) = env_parse("TICKWEAVE_TICKS") {
            options.ticks = ticks;
        }
        options.seed = env_parse("TICKWEAVE_SEED");
        if let Some(rate) = env_parse("TICKWEAVE_FAILURE_RATE") {
            options.failure_rate = rate;
        }
        options.config = std::env::var_os("TICKWEAVE_CONFIG").map(PathBuf::from);
        options
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value, "ignoring unparseable environment override");
            None
        }
    }
}

/// Parse run options from command line arguments.
pub fn parse_options_from_args(
    args: &[String],
    mut options: RunOptions,
) -> Result<RunOptions, String> {
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i).cloned().ok_or_else(|| format!("{flag} needs a value"))
        };
        match flag {
            "--ticks" => options.ticks = parse_flag(flag, &value()?)?,
            "--seed" => options.seed = Some(parse_flag(flag, &value()?)?),
            "--failure-rate" => options.failure_rate = parse_flag(flag, &value()?)?,
            "--config" => options.config = Some(value()?.into()),
            "--inputs" => options.inputs = Some(value()?.into()),
            "--save" => options.save = Some(value()?.into()),
            "--load" => options.load = Some(value()?.into()),
            "--verify" => options.verify = Some(value()?.into()),
            "--fast" => options.fast = true,
            "--quiet" | "-q" => options.quiet = true,
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }
    if !(0.0..=1.0).contains(&options.failure_rate) {
        return Err("--failure-rate must be between 0 and 1".to_string());
    }
    Ok(options)
}

fn parse_flag<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

/// Read an input script into per-tick command lines.
async fn load_inputs(path: &PathBuf) -> Result<BTreeMap<u64, Vec<String>>, Box<dyn Error>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut script: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let at = format!("{}:{}", path.display(), number + 1);
        let (tick, command) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("{at}: expected '<tick> <command>'"))?;
        let tick: u64 = tick
            .parse()
            .map_err(|_| format!("{at}: invalid tick '{tick}'"))?;
        script.entry(tick).or_default().push(command.trim().to_string());
    }
    Ok(script)
}

/// Run in headless mode.
pub async fn run_headless(options: RunOptions) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &options.verify {
        return verify(path, &options).await;
    }

    let mut config = match &options.config {
        Some(path) => EngineConfig::from_json_file(path).await?,
        None => EngineConfig::default(),
    };
    if let Some(seed) = options.seed {
        config = config.with_seed(seed);
    }

    let mut session = match &options.load {
        Some(path) => {
            let saved = tickweave_core::SavedSession::load_json(path).await?;
            let provider = provider(saved.seed, &options);
            let session = tickweave_core::SessionBuilder::from_saved(saved).build(provider)?;
            println!("[LOADED] {} at tick {}", path.display(), session.tick());
            session
        }
        None => Session::new(config.clone(), provider(config.seed, &options))?,
    };

    let script = match &options.inputs {
        Some(path) => load_inputs(path).await?,
        None => BTreeMap::new(),
    };

    println!("=== tickweave ===");
    println!(
        "seed {}  rate {} Hz  ticks {}  failure rate {:.2}",
        session.config().seed,
        session.config().scheduler.tick_rate_hz,
        options.ticks,
        options.failure_rate
    );
    println!();

    let start = session.tick();
    let mut pacer = interval(session.config().scheduler.tick_duration());
    pacer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    for _ in 0..options.ticks {
        if options.fast {
            tokio::task::yield_now().await;
        } else {
            pacer.tick().await;
        }
        let next = session.tick() + 1;
        for line in script.get(&next).into_iter().flatten() {
            if let Err(e) = session.queue_command(line) {
                println!("[INPUT] tick {next}: could not parse '{line}': {e}");
            }
        }
        let report = session.run_tick()?;
        if !options.quiet {
            print_report(&report);
        }
    }

    print_summary(&session, start);

    if let Some(path) = &options.save {
        session.save(path).await?;
        println!("[SAVED] {}", path.display());
    }
    session.shutdown();
    Ok(())
}

fn provider(seed: u64, options: &RunOptions) -> Arc<dyn NarrativeProvider> {
    Arc::new(SimulatedProvider::new(seed).with_failure_rate(options.failure_rate))
}

/// Load a save, replay its log and report the outcome.
async fn verify(path: &PathBuf, options: &RunOptions) -> Result<(), Box<dyn Error>> {
    let saved = tickweave_core::SavedSession::load_json(path).await?;
    let provider = provider(saved.seed, options);
    let records = saved.replay_log.len();
    match Session::load(path, provider).await {
        Ok(mut session) => {
            println!(
                "[VERIFIED] {}: {} ticks, {} records, final hash {}",
                path.display(),
                session.tick(),
                records,
                session.snapshot_hash(session.tick()).unwrap_or("-")
            );
            session.shutdown();
            Ok(())
        }
        Err(e) => {
            println!("[DIVERGED] {}: {e}", path.display());
            Err(e.into())
        }
    }
}

fn print_report(report: &TickReport) {
    let tick = report.tick;
    match &report.input {
        Some(InputResult::Applied(input)) => println!("[{tick:>5}] input  {}", input.verb()),
        Some(InputResult::Rejected { input, error }) => {
            println!("[{tick:>5}] input  {} rejected: {error}", input.verb())
        }
        None => {}
    }
    for event in &report.events {
        println!("[{tick:>5}] change {}", event.kind());
    }
    for completed in &report.applied {
        println!(
            "[{tick:>5}] {:<8} {} ({})",
            completed.outcome.source(),
            completed.outcome.text(),
            completed.origin
        );
    }
    for violation in &report.violations {
        println!("[{tick:>5}] repair {violation}");
    }
}

fn print_summary(session: &Session, start: u64) {
    let world = session.world();
    let stats = session.queue_stats();
    println!();
    println!("[SUMMARY]");
    println!("  ticks run: {} (now at tick {})", session.tick() - start, session.tick());
    println!("  population: {}", world.population());
    for resource in world.resources.values() {
        println!("  {}: {:.1} (floor {:.1})", resource.name, resource.quantity, resource.floor);
    }
    println!(
        "  snapshot: {}",
        session.snapshot_hash(session.tick()).unwrap_or("-")
    );
    println!("  chronicle entries: {}", world.chronicle.len());
    println!("[METRICS]");
    for line in session.metrics().to_string().lines() {
        println!("  {line}");
    }
    println!(
        "  queue: {} enqueued, {} deduplicated, {} cache hits",
        stats.enqueued, stats.deduplicated, stats.cache_hits
    );
    println!(
        "  dropped: {} overflowed, {} evicted, {} timed out",
        stats.overflowed, stats.evicted, stats.timed_out
    );
    println!(
        "  calls: {} succeeded, {} failed, {} retried",
        stats.succeeded, stats.failed, stats.retried
    );
    info!(tick = session.tick(), "headless run finished");
}
