//! Local clock-quality probe.
//!
//! TWAMP senders advertise how trustworthy their timestamps are through the
//! Error Estimate field. The only OS-dependent piece of the service is the
//! query behind that: on Linux the kernel's NTP state is read via
//! `adjtimex(2)`, everywhere else a conservative fallback is reported. The
//! probe is a pure query with no side effects and is re-run for every TWAMP
//! request.

use crate::error_estimate::ErrorEstimate;

/// Estimated error reported when the platform cannot answer (seconds).
pub const FALLBACK_ERROR_SECONDS: f64 = 0.5;

/// Result of one clock-quality query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockStatus {
    /// The clock is disciplined by an external source (NTP/PTP).
    pub synchronized: bool,
    /// Estimated clock error in seconds; non-negative when meaningful.
    pub estimated_error_seconds: f64,
}

impl ClockStatus {
    /// The conservative answer used when the platform cannot be asked.
    pub fn fallback() -> Self {
        Self {
            synchronized: false,
            estimated_error_seconds: FALLBACK_ERROR_SECONDS,
        }
    }

    /// Encodes this status as the outgoing 16-bit TWAMP Error Estimate.
    pub fn wire_error_estimate(&self) -> u16 {
        ErrorEstimate::encode(self.synchronized, false, self.estimated_error_seconds)
    }
}

/// Interface to the host's time service.
///
/// A trait so the dispatcher and tests can substitute a fixed answer; the
/// production implementation is [`SystemClockProbe`].
pub trait ClockProbe: Send + Sync {
    /// Queries the current synchronization state.
    fn query(&self) -> ClockStatus;
}

/// Clock probe backed by the host's time service.
///
/// On Linux this asks the kernel via `adjtimex(2)`; the clock counts as
/// synchronized when the call does not report `TIME_ERROR` and the
/// `STA_UNSYNC` flag is clear, and `esterror` (microseconds) becomes the
/// estimated error. On other platforms, and whenever the syscall fails, the
/// probe answers `{false, 0.5 s}`, which the Error Estimate encoding
/// advertises as unsynchronized rather than silently trusting.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClockProbe;

impl SystemClockProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ClockProbe for SystemClockProbe {
    fn query(&self) -> ClockStatus {
        query_platform_clock()
    }
}

#[cfg(target_os = "linux")]
fn query_platform_clock() -> ClockStatus {
    use log::{debug, warn};

    // SAFETY: adjtimex with modes == 0 only reads kernel time state into
    // the zeroed struct; it never modifies the clock.
    let mut tx: libc::timex = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::adjtimex(&mut tx) };
    if rc < 0 {
        warn!("adjtimex failed: {}", std::io::Error::last_os_error());
        return ClockStatus::fallback();
    }

    let synchronized = rc != libc::TIME_ERROR && (tx.status & libc::STA_UNSYNC) == 0;

    // esterror is in microseconds; a non-positive value means the kernel has
    // no estimate.
    let estimated_error_seconds = if tx.esterror > 0 {
        tx.esterror as f64 / 1e6
    } else {
        FALLBACK_ERROR_SECONDS
    };

    debug!(
        "clock probe: rc={}, status={:#x}, synced={}, esterror={} us",
        rc, tx.status, synchronized, tx.esterror
    );

    ClockStatus {
        synchronized,
        estimated_error_seconds,
    }
}

#[cfg(not(target_os = "linux"))]
fn query_platform_clock() -> ClockStatus {
    log::debug!("clock probe: no platform time service on this target, using fallback");
    ClockStatus::fallback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_estimate::ErrorEstimate;

    #[test]
    fn test_fallback_status() {
        let status = ClockStatus::fallback();
        assert!(!status.synchronized);
        assert_eq!(status.estimated_error_seconds, 0.5);
    }

    #[test]
    fn test_fallback_wire_estimate_is_unsynchronized() {
        let raw = ClockStatus::fallback().wire_error_estimate();
        let decoded = ErrorEstimate::decode(raw);
        assert!(!decoded.synced);
        assert!(!decoded.unavailable);
        assert_eq!(decoded.error_seconds, 0.5);
    }

    #[test]
    fn test_synchronized_wire_estimate() {
        let status = ClockStatus {
            synchronized: true,
            estimated_error_seconds: 0.001,
        };
        let decoded = ErrorEstimate::decode(status.wire_error_estimate());
        assert!(decoded.synced);
        let rel = (decoded.error_seconds - 0.001).abs() / 0.001;
        assert!(rel <= 1.0 / 256.0);
    }

    #[test]
    fn test_system_probe_answers() {
        // Whatever the host reports, the contract holds: a meaningful error
        // is non-negative.
        let status = SystemClockProbe::new().query();
        assert!(status.estimated_error_seconds >= 0.0);
    }
}
