pub mod lock;
pub mod proc_locks;
mod signal;

use std::time::Duration;

pub use lock::LockedFile;
pub use signal::handle_signals;
pub use signal::received;
pub use signal::release_requested;
pub use signal::sleep_interruptible;

/// Sleep between checks of the release flag.
pub const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interval(pub Duration);

impl std::str::FromStr for Interval {
    type Err = anyhow::Error;
    fn from_str(string: &str) -> anyhow::Result<Self> {
        let (value, unit) = if let Some(prefix) = string.strip_suffix("ms") {
            (prefix, Duration::from_millis(1))
        } else if let Some(prefix) = string.strip_suffix('s') {
            (prefix, Duration::from_secs(1))
        } else if let Some(prefix) = string.strip_suffix('m') {
            (prefix, Duration::from_secs(60))
        } else {
            (string, Duration::from_secs(1))
        };

        let count = value.parse::<u32>()?;
        if count == 0 {
            return Err(anyhow::anyhow!("Interval must be positive: {}", string));
        }

        Ok(Interval(unit * count))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn sleep_interruptible_sleeps_without_signal() {
        let start = Instant::now();
        sleep_interruptible(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn parses_interval_units() {
        assert_eq!("500ms".parse::<Interval>().unwrap().0, Duration::from_millis(500));
        assert_eq!("2s".parse::<Interval>().unwrap().0, Duration::from_secs(2));
        assert_eq!("1m".parse::<Interval>().unwrap().0, Duration::from_secs(60));
        assert_eq!("3".parse::<Interval>().unwrap().0, Duration::from_secs(3));
    }

    #[test]
    fn rejects_bad_intervals() {
        for bad in ["", "s", "0", "0ms", "-1s", "1h", "fast"] {
            assert!(bad.parse::<Interval>().is_err(), "{:?} parsed", bad);
        }
    }
}
