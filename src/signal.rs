use std::ffi;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;

static RELEASE: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn release_callback(signum: ffi::c_int) {
    LAST_SIGNAL.store(signum, Ordering::Relaxed);
    RELEASE.store(true, Ordering::Release);
}

/// Whether SIGINT or SIGTERM has been delivered since [`handle_signals`].
pub fn release_requested() -> bool {
    RELEASE.load(Ordering::Acquire)
}

/// Name of the signal that set the release flag, if any.
pub fn received() -> Option<&'static str> {
    match LAST_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        libc::SIGINT => Some("SIGINT"),
        libc::SIGTERM => Some("SIGTERM"),
        _ => Some("unknown signal"),
    }
}

/// Route SIGINT and SIGTERM to the release flag instead of the default
/// terminate action. No SA_RESTART, so raw syscalls such as `nanosleep`
/// return EINTR; std wrappers like `thread::sleep` retry and do not.
pub fn handle_signals() -> anyhow::Result<()> {
    unsafe {
        let mut sa_release = mem::zeroed::<libc::sigaction>();
        sa_release.sa_sigaction = release_callback as usize;

        if libc::sigemptyset(&mut sa_release.sa_mask) == -1
            || libc::sigaction(libc::SIGINT, &sa_release, ptr::null_mut()) == -1
            || libc::sigaction(libc::SIGTERM, &sa_release, ptr::null_mut()) == -1
        {
            return Err(anyhow!("Failed to handle SIGINT, SIGTERM"));
        }

        Ok(())
    }
}

/// Sleep for `duration`, returning early when a signal interrupts the wait.
///
/// Unlike `thread::sleep` this does not resume after EINTR, so a loop
/// checking [`release_requested`] sees the flag as soon as the handler runs.
pub fn sleep_interruptible(duration: Duration) {
    let request = libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };

    // EINTR is the wake-up; any other failure just ends the nap early
    unsafe {
        libc::nanosleep(&request, ptr::null_mut());
    }
}
