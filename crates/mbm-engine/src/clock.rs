//! Monotonic nanosecond clock and a restartable sleeper.
//!
//! On Linux, timestamps use `CLOCK_MONOTONIC_RAW` (immune to NTP slew).
//! On other platforms, an `Instant`-based fallback is used. Pacing depends on
//! these ticks being strictly non-decreasing within a process.

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Sleep at least `ns` nanoseconds, resuming transparently when the sleep is
/// interrupted by a signal. Returns only after the full duration elapses.
pub fn sleep_ns(ns: u64) {
    #[cfg(unix)]
    {
        let mut req = libc::timespec {
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        };
        let mut rem = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // nanosleep fills `rem` with the unslept remainder on EINTR.
        while unsafe { libc::nanosleep(&req, &mut rem) } == -1 {
            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
            req = rem;
        }
    }
    #[cfg(not(unix))]
    std::thread::sleep(std::time::Duration::from_nanos(ns));
}

/// Suppress SIGPIPE process-wide so a write to a closed peer surfaces as
/// EPIPE on the socket instead of killing the process.
pub fn ignore_sigpipe() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
