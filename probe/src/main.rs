use std::collections::BTreeSet;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser;
use lockhold::proc_locks;
use lockhold::proc_locks::Holder;

/// Inspect, watch and break advisory locks held on a file.
#[derive(Parser)]
#[command(version)]
struct Command {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(clap::Subcommand)]
enum Mode {
    /// Show which processes hold a lock on the file (exit 2 if locked)
    Check { path: PathBuf },
    /// Print the lock holders whenever they change
    Monitor {
        path: PathBuf,
        #[arg(short, long, default_value = "2s")]
        interval: lockhold::Interval,
    },
    /// Signal the processes holding a lock on the file
    Release {
        path: PathBuf,
        #[arg(short, long, value_enum, default_value = "int")]
        signal: Signal,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Copy, Clone, clap::ValueEnum)]
enum Signal {
    Int,
    Term,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

const LOCKED_EXIT: i32 = 2;
const RELEASE_POLL: Duration = Duration::from_millis(50);
/// Longer than one holder tick, so a holder that missed the wake-up still counts.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(3);

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_timed();

    let command = Command::parse();

    match command.mode {
        Mode::Check { path } => {
            if check(&path)? {
                process::exit(LOCKED_EXIT);
            }
            Ok(())
        }
        Mode::Monitor { path, interval } => {
            lockhold::handle_signals()?;
            monitor(&path, interval.0)
        }
        Mode::Release { path, signal, yes } => release(&path, signal, yes),
    }
}

/// Returns whether the file is locked.
fn check(path: &Path) -> anyhow::Result<bool> {
    let holders = proc_locks::holders(path)?;
    print_holders(path, &holders);

    if holders.is_empty() {
        if lockhold::lock::is_locked(path)? {
            println!("Warning: File appears to be locked despite no processes found.");
            println!("         The holder may live in another mount or PID namespace.");
            return Ok(true);
        }
        return Ok(false);
    }

    Ok(true)
}

fn monitor(path: &Path, interval: Duration) -> anyhow::Result<()> {
    println!("Monitoring file locks for: {}", path.display());
    println!("Update interval: {:?}", interval);
    println!("Press Ctrl+C to stop monitoring\n");
    io::stdout().flush()?;

    let mut last: Option<Vec<Holder>> = None;

    while !lockhold::release_requested() {
        match proc_locks::holders(path) {
            Ok(holders) if holders_changed(last.as_deref(), &holders) => {
                let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                println!("[{}] Lock status changed:", timestamp);
                if holders.is_empty() {
                    println!("  File is now UNLOCKED");
                } else {
                    println!("  File is LOCKED by {} process(es):", holders.len());
                    for holder in &holders {
                        println!("    {}", holder);
                    }
                }
                println!();
                io::stdout().flush()?;
                last = Some(holders);
            }
            Ok(_) => (),
            Err(error) => log::warn!("Error checking file locks: {:#}", error),
        }

        idle(interval);
    }

    log::debug!("monitor stopped by {}", lockhold::received().unwrap_or("?"));
    Ok(())
}

// only the set of owning pids counts; names and order may jitter between reads
fn holders_changed(last: Option<&[Holder]>, current: &[Holder]) -> bool {
    let Some(last) = last else { return true };
    let pids = |holders: &[Holder]| {
        holders
            .iter()
            .map(|holder| holder.pid)
            .collect::<BTreeSet<_>>()
    };
    pids(last) != pids(current)
}

// sleep for `interval`, waking early once a release signal arrives
fn idle(interval: Duration) {
    let deadline = Instant::now() + interval;
    while !lockhold::release_requested() {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else { return };
        lockhold::sleep_interruptible(left.min(lockhold::IDLE_TICK));
    }
}

fn release(path: &Path, signal: Signal, yes: bool) -> anyhow::Result<()> {
    let holders = proc_locks::holders(path)?;
    if holders.is_empty() {
        println!("File '{}' is not locked by any process", path.display());
        return Ok(());
    }

    print_holders(path, &holders);

    if !yes {
        print!("Do you want to signal these processes? (y/N): ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;

        if !confirmed(&answer) {
            println!("Operation cancelled");
            return Ok(());
        }
    }

    for holder in &holders {
        send(holder, signal);
    }

    println!("\nRechecking file locks...");
    io::stdout().flush()?;

    let remaining = wait_released(path)?;
    if remaining.is_empty() {
        println!("File '{}' is now unlocked", path.display());
    } else {
        println!("Warning: Some processes are still locking the file:");
        print_holders(path, &remaining);
    }

    Ok(())
}

// poll until the holders let go or RELEASE_TIMEOUT passes
fn wait_released(path: &Path) -> anyhow::Result<Vec<Holder>> {
    let deadline = Instant::now() + RELEASE_TIMEOUT;
    loop {
        let remaining = proc_locks::holders(path)?;
        if remaining.is_empty() || Instant::now() >= deadline {
            return Ok(remaining);
        }
        thread::sleep(RELEASE_POLL);
    }
}

fn send(holder: &Holder, signal: Signal) {
    let Some(pid) = holder.pid else {
        log::warn!("Skipping lock with no owning process: {}", holder);
        return;
    };

    match unsafe { libc::kill(pid as libc::pid_t, signal.raw()) } {
        0 => log::info!("signalled {} ({})", pid, holder.name),
        _ => {
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::ESRCH) => log::info!("process {} already exited", pid),
                _ => log::error!("Failed to signal {} ({}): {}", pid, holder.name, error),
            }
        }
    }
}

fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn print_holders(path: &Path, holders: &[Holder]) {
    if holders.is_empty() {
        println!("File '{}' is not locked by any process", path.display());
        return;
    }

    println!(
        "File '{}' is locked by {} process(es):",
        path.display(),
        holders.len()
    );
    println!("{:-<80}", "");
    for (i, holder) in holders.iter().enumerate() {
        println!("Process #{}", i + 1);
        match holder.pid {
            Some(pid) => println!("  PID: {}", pid),
            None => println!("  PID: - (open file description lock)"),
        }
        println!("  Name: {}", holder.name);
        if let Some(exe) = &holder.exe {
            println!("  Path: {}", exe.display());
        }
        println!("  Lock: {} {}", holder.kind, holder.access);
        println!();
    }
}
