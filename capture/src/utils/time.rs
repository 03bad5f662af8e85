//! Time-related utilities

use chrono::{SecondsFormat, Utc};

/// Current monotonic time in nanoseconds, the clock every frame is stamped with
#[cfg(target_os = "linux")]
pub fn monotonic_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC always exists
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as i64) * 1_000_000_000 + ts.tv_nsec as i64
}

/// Current monotonic time in nanoseconds, measured from first use
#[cfg(not(target_os = "linux"))]
pub fn monotonic_nanos() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

/// Wall-clock time as ISO-8601, stored in the capture header
pub fn capture_time_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_goes_back() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_capture_time_format() {
        let now = capture_time_now();
        assert!(now.ends_with('Z'));
        assert!(now.len() < 64);
    }
}
