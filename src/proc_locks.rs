//! Reader for the kernel lock table in `/proc/locks`.
//!
//! Each row looks like
//!
//! ```text
//! 2: FLOCK  ADVISORY  WRITE 4242 00:2f:1832 0 EOF
//! 2: -> FLOCK  ADVISORY  WRITE 4250 00:2f:1832 0 EOF
//! ```
//!
//! where `->` marks a process blocked waiting on the lock above it and the
//! device numbers are hexadecimal.

use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context as _;

const PROC_LOCKS: &str = "/proc/locks";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Flock,
    Posix,
    Ofd,
    Lease,
    Other(String),
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Flock => f.write_str("FLOCK"),
            Kind::Posix => f.write_str("POSIX"),
            Kind::Ofd => f.write_str("OFDLCK"),
            Kind::Lease => f.write_str("LEASE"),
            Kind::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Other(String),
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => f.write_str("READ"),
            Access::Write => f.write_str("WRITE"),
            Access::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockEntry {
    pub ordinal: u32,
    pub waiting: bool,
    pub kind: Kind,
    /// `ADVISORY`, `MANDATORY`, or a lease state such as `ACTIVE`
    pub mode: String,
    pub access: Access,
    /// `None` for OFD locks, which the kernel reports with pid -1
    pub pid: Option<u32>,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
}

impl std::str::FromStr for LockEntry {
    type Err = anyhow::Error;
    fn from_str(line: &str) -> anyhow::Result<Self> {
        let mut fields = line.split_whitespace();
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| anyhow!("Missing {} in lock entry {:?}", name, line))
        };

        let ordinal = next("ordinal")?;
        let ordinal = ordinal
            .strip_suffix(':')
            .ok_or_else(|| anyhow!("Malformed ordinal {:?}", ordinal))?
            .parse::<u32>()?;

        let (waiting, kind) = match next("kind")? {
            "->" => (true, next("kind")?),
            kind => (false, kind),
        };

        let kind = match kind {
            "FLOCK" => Kind::Flock,
            "POSIX" => Kind::Posix,
            "OFDLCK" => Kind::Ofd,
            "LEASE" => Kind::Lease,
            other => Kind::Other(other.to_owned()),
        };

        let mode = next("mode")?.to_owned();

        let access = match next("access")? {
            "READ" => Access::Read,
            "WRITE" => Access::Write,
            other => Access::Other(other.to_owned()),
        };

        let pid = match next("pid")?.parse::<i64>()? {
            pid if pid < 0 => None,
            pid => Some(u32::try_from(pid)?),
        };

        let device = next("device")?;
        let mut parts = device.splitn(3, ':');
        let (Some(major), Some(minor), Some(inode)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("Malformed device {:?}", device));
        };

        Ok(LockEntry {
            ordinal,
            waiting,
            kind,
            mode,
            access,
            pid,
            major: u32::from_str_radix(major, 16)?,
            minor: u32::from_str_radix(minor, 16)?,
            inode: inode.parse::<u64>()?,
        })
    }
}

/// Parse the whole table, skipping blank lines.
pub fn parse(table: &str) -> anyhow::Result<Vec<LockEntry>> {
    table
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.parse::<LockEntry>())
        .collect()
}

pub fn read_table() -> anyhow::Result<Vec<LockEntry>> {
    let table = fs::read_to_string(PROC_LOCKS)
        .with_context(|| anyhow!("Failed to read {}", PROC_LOCKS))?;
    parse(&table).with_context(|| anyhow!("Failed to parse {}", PROC_LOCKS))
}

/// Split a `st_dev` value the way glibc's `major()`/`minor()` do.
pub fn split_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Holder {
    pub pid: Option<u32>,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub kind: Kind,
    pub access: Access,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "PID: {} | Name: {}", pid, self.name)?,
            None => write!(f, "PID: - | Name: {}", self.name)?,
        }
        match &self.exe {
            Some(exe) => write!(f, " | Path: {}", exe.display())?,
            None => write!(f, " | Path: ?")?,
        }
        write!(f, " | {} {}", self.kind, self.access)
    }
}

impl Holder {
    fn lookup(entry: &LockEntry) -> Self {
        let (name, exe) = match entry.pid {
            Some(pid) => {
                let proc_dir = PathBuf::from(format!("/proc/{}", pid));
                let name = fs::read_to_string(proc_dir.join("comm"))
                    .map(|comm| comm.trim_end().to_owned())
                    .unwrap_or_else(|_| "?".to_owned());
                (name, fs::read_link(proc_dir.join("exe")).ok())
            }
            None => ("?".to_owned(), None),
        };

        Holder {
            pid: entry.pid,
            name,
            exe,
            kind: entry.kind.clone(),
            access: entry.access.clone(),
        }
    }
}

/// Entries in `table` granted (not waiting) on the file identified by
/// `dev`/`inode`, one per distinct owner and lock type.
pub fn granted_on(table: &[LockEntry], dev: u64, inode: u64) -> Vec<&LockEntry> {
    let (major, minor) = split_dev(dev);
    let mut granted: Vec<&LockEntry> = Vec::new();

    for entry in table {
        if entry.waiting || entry.major != major || entry.minor != minor || entry.inode != inode {
            continue;
        }
        if granted.iter().any(|seen| {
            seen.pid == entry.pid && seen.kind == entry.kind && seen.access == entry.access
        }) {
            continue;
        }
        granted.push(entry);
    }

    granted
}

/// Processes currently holding a lock on `path`.
pub fn holders(path: &Path) -> anyhow::Result<Vec<Holder>> {
    let metadata =
        fs::metadata(path).with_context(|| anyhow!("Failed to stat {}", path.display()))?;
    let table = read_table()?;

    let holders: Vec<Holder> = granted_on(&table, metadata.dev(), metadata.ino())
        .into_iter()
        .map(Holder::lookup)
        .collect();

    log::debug!(
        "{} lock table entries, {} on {}",
        table.len(),
        holders.len(),
        path.display()
    );

    Ok(holders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockedFile;

    const TABLE: &str = "\
1: POSIX  ADVISORY  WRITE 1203 fd:01:393253 0 EOF
2: FLOCK  ADVISORY  WRITE 4242 00:2f:1832 0 EOF
2: -> FLOCK  ADVISORY  WRITE 4250 00:2f:1832 0 EOF
3: OFDLCK ADVISORY  READ  -1 00:06:9 0 EOF
4: LEASE  ACTIVE    READ  977 103:02:55 0 EOF
5: POSIX  ADVISORY  WRITE 1203 fd:01:393253 10 20
";

    #[test]
    fn parses_rows() {
        let entries = parse(TABLE).unwrap();
        assert_eq!(entries.len(), 6);

        assert_eq!(
            entries[0],
            LockEntry {
                ordinal: 1,
                waiting: false,
                kind: Kind::Posix,
                mode: "ADVISORY".to_owned(),
                access: Access::Write,
                pid: Some(1203),
                major: 0xfd,
                minor: 0x01,
                inode: 393253,
            }
        );

        assert!(entries[2].waiting);
        assert_eq!(entries[2].kind, Kind::Flock);
        assert_eq!(entries[2].pid, Some(4250));

        assert_eq!(entries[3].kind, Kind::Ofd);
        assert_eq!(entries[3].pid, None);
        assert_eq!(entries[3].access, Access::Read);

        assert_eq!(entries[4].kind, Kind::Lease);
        assert_eq!(entries[4].mode, "ACTIVE");
        assert_eq!(entries[4].major, 0x103);
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!("1 FLOCK ADVISORY WRITE 1 00:01:2 0 EOF".parse::<LockEntry>().is_err());
        assert!("1: FLOCK ADVISORY WRITE".parse::<LockEntry>().is_err());
        assert!("1: FLOCK ADVISORY WRITE x 00:01:2 0 EOF".parse::<LockEntry>().is_err());
        assert!("1: FLOCK ADVISORY WRITE 1 0001 0 EOF".parse::<LockEntry>().is_err());
    }

    #[test]
    fn splits_device_numbers() {
        assert_eq!(split_dev(0x0801), (8, 1));
        assert_eq!(split_dev(0xfd01), (0xfd, 1));
        // major 259, minor 2 in the glibc encoding
        assert_eq!(split_dev(0x10302), (0x103, 2));
    }

    #[test]
    fn granted_skips_waiters_and_duplicates() {
        let entries = parse(TABLE).unwrap();

        let flock = granted_on(&entries, 0x2f, 1832);
        assert_eq!(flock.len(), 1);
        assert_eq!(flock[0].pid, Some(4242));

        let posix = granted_on(&entries, 0xfd01, 393253);
        assert_eq!(posix.len(), 1);

        assert!(granted_on(&entries, 0x2f, 1).is_empty());
    }

    #[test]
    fn finds_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held");

        let lock = LockedFile::acquire(&path).unwrap();
        let holders = holders(&path).unwrap();
        assert!(holders
            .iter()
            .any(|holder| holder.pid == Some(std::process::id()) && holder.kind == Kind::Flock));

        lock.release().unwrap();
        assert!(super::holders(&path).unwrap().is_empty());
    }
}
