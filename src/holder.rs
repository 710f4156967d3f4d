use std::io;
use std::io::Write as _;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use lockhold::LockedFile;

/// Hold an exclusive lock on a file until interrupted.
///
/// The file is created if missing and TRUNCATED to zero length once locked.
#[derive(Parser)]
#[command(version)]
struct Command {
    /// File to lock
    filename: PathBuf,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_timed();

    let command = parse_args();

    lockhold::handle_signals()?;

    let lock = LockedFile::acquire(&command.filename)?;

    println!("Locking file: {}", command.filename.display());
    println!("Press Ctrl+C to release lock");
    io::stdout().flush()?;

    while !lockhold::release_requested() {
        lockhold::sleep_interruptible(lockhold::IDLE_TICK);
    }

    log::debug!("received {}", lockhold::received().unwrap_or("release request"));

    lock.release()?;
    println!("Released lock");

    Ok(())
}

// usage errors exit 1 rather than clap's default of 2
fn parse_args() -> Command {
    match Command::try_parse() {
        Ok(command) => command,
        Err(error) if !error.use_stderr() => error.exit(),
        Err(error) => {
            let _ = error.print();
            process::exit(1)
        }
    }
}
