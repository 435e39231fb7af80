//! bptrace - Trace function entries with software breakpoints
//!
//! Entry point that handles CLI argument parsing, breakpoint resolution
//! and the final hit summary.

use clap::Parser;

/// bptrace: count hits on code addresses and functions of a process tree
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Attach to a running process instead of spawning one
    #[arg(short, long, conflicts_with = "command")]
    pid: Option<i32>,

    /// Breakpoint location: hex address (0x...) or function name in the main executable
    #[arg(short, long = "break", value_name = "ADDR|SYMBOL")]
    breakpoints: Vec<String>,

    /// Remove all breakpoints and detach after this many hits
    #[arg(long, value_name = "N")]
    max_hits: Option<u64>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Program to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::info!("bptrace initialized for {}", bptrace::Arch::host().name());
    log::debug!("Args: {:?}", args);

    run(args)
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> anyhow::Result<()> {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use anyhow::{bail, Context};
    use bptrace::analysis::{load_bias, LoadedBinary};
    use bptrace::debug::{HitReporter, Tracer};
    use colored::Colorize;

    // 3. Start or attach to the target
    let mut tracer = match (args.pid, args.command.split_first()) {
        (Some(pid), _) => Tracer::attach(pid)?,
        (None, Some((program, rest))) => Tracer::spawn(program, rest)?,
        (None, None) => bail!("nothing to trace: give --pid or a program to run"),
    };
    let pid = tracer.leader_pid();

    // 4. Resolve symbols of the main executable
    let proc_exe = PathBuf::from(format!("/proc/{}/exe", pid));
    let exe = std::fs::read_link(&proc_exe).unwrap_or(proc_exe);
    let needs_symbols = args.breakpoints.iter().any(|location| parse_address(location).is_none());
    let symbols = if needs_symbols {
        let binary = LoadedBinary::from_file(&exe)?;
        let bias = if binary.is_pie { load_bias(pid, &exe)? } else { 0 };
        log::info!("{}: load bias {:#x}", exe.display(), bias);
        binary.symbols(bias).1
    } else {
        Vec::new()
    };

    // 5. Plant breakpoints
    let total = Arc::new(AtomicU64::new(0));
    let mut reporters = Vec::new();
    {
        let process = tracer.leader_mut().context("target vanished")?;
        for location in &args.breakpoints {
            let (address, symbol) = match parse_address(location) {
                Some(address) => (address, None),
                None => {
                    let symbol = symbols
                        .iter()
                        .find(|s| s.name == *location)
                        .with_context(|| format!("no function named {} in {}", location, exe.display()))?;
                    (symbol.address, Some(symbol))
                }
            };

            match process.insert_breakpoint(address, symbol) {
                Ok(_) => {}
                Err(err) if err.is_recoverable() => log::warn!("{}: pending ({})", location, err),
                Err(err) => return Err(err.into()),
            }

            if process.lookup(address).is_some_and(|bp| !bp.has_callbacks()) {
                let reporter = Arc::new(HitReporter::new(location.clone(), total.clone()));
                process.set_callbacks(address, reporter.clone())?;
                reporters.push(reporter);
            }
        }
    }
    println!(
        "[*] bptrace v{} - tracing pid {} with {} breakpoints",
        env!("CARGO_PKG_VERSION"),
        pid,
        reporters.len()
    );

    // 6. Run until the tree is gone or enough hits were seen
    let max_hits = args.max_hits;
    let outcome = tracer.run(|| max_hits.is_some_and(|max| total.load(Ordering::Relaxed) >= max))?;

    // 7. Summary
    println!("{}", "Breakpoint hits".bold().cyan());
    println!("{}", "═".repeat(40).cyan());
    for reporter in &reporters {
        println!("  {:<28} {:>8}", reporter.label().green(), reporter.hits());
    }
    println!("[*] Target {}", outcome);

    std::process::exit(outcome.exit_code());
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> anyhow::Result<()> {
    anyhow::bail!("tracing is only supported on Linux")
}

/// `0x`-prefixed hex address
fn parse_address(location: &str) -> Option<u64> {
    let digits = location.strip_prefix("0x").or_else(|| location.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
