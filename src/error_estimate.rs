//! TWAMP Error Estimate codec (RFC 4656 section 4.1.2).
//!
//! The 16-bit field layout:
//!
//! ```text
//!  bit 15: S - clock is synchronized to UTC via an external source
//!  bit 14: Z - timestamp not available (error is infinite)
//!  bits 8-13: Scale (6-bit unsigned)
//!  bits 0-7:  Multiplier (8-bit unsigned)
//! ```
//!
//! Error in seconds = `Multiplier × 2^(-Scale)`. A set Z-bit or a zero
//! multiplier means the estimate is unavailable and is reported with the
//! [`ERROR_UNAVAILABLE`] sentinel.

use serde::{Deserialize, Serialize};

/// Sentinel for an unavailable (infinite) error estimate.
pub const ERROR_UNAVAILABLE: f64 = -1.0;

/// Smallest encodable error in seconds; lower values are clamped up.
const MIN_ERROR_SECONDS: f64 = 1e-6;
/// Largest encodable error in seconds; higher values are clamped down.
const MAX_ERROR_SECONDS: f64 = 100.0;

/// Decoded Error Estimate field.
///
/// # Examples
///
/// ```
/// use netgauge::error_estimate::ErrorEstimate;
///
/// let info = ErrorEstimate::decode(0x8A01);
/// assert!(info.synced);
/// assert_eq!(info.scale, 10);
/// assert_eq!(info.multiplier, 1);
/// assert_eq!(info.error_seconds, 2f64.powi(-10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorEstimate {
    /// S-bit: clock is synchronized to UTC.
    pub synced: bool,
    /// Z-bit: timestamp not available.
    pub unavailable: bool,
    /// 6-bit scale factor.
    pub scale: u8,
    /// 8-bit multiplier.
    pub multiplier: u8,
    /// `multiplier × 2^(-scale)`, or [`ERROR_UNAVAILABLE`] when the Z-bit is
    /// set or the multiplier is zero.
    pub error_seconds: f64,
}

impl ErrorEstimate {
    /// Decodes a 16-bit Error Estimate field.
    pub fn decode(raw: u16) -> Self {
        let synced = (raw >> 15) & 1 == 1;
        let unavailable = (raw >> 14) & 1 == 1;
        let scale = ((raw >> 8) & 0x3F) as u8;
        let multiplier = (raw & 0xFF) as u8;

        let error_seconds = if unavailable || multiplier == 0 {
            ERROR_UNAVAILABLE
        } else {
            f64::from(multiplier) * 2f64.powi(-i32::from(scale))
        };

        Self {
            synced,
            unavailable,
            scale,
            multiplier,
            error_seconds,
        }
    }

    /// Encodes an Error Estimate field.
    ///
    /// When `unavailable` is set the field carries Z=1 with multiplier 1 and
    /// scale 0. Otherwise `error_seconds` is clamped to the encodable range
    /// and represented with the largest scale whose rounded multiplier still
    /// fits in `[1, 255]`. That drives the multiplier toward the top of its
    /// range, so quantization stays within one part in 256 of the true value
    /// across the whole supported range.
    pub fn encode(synced: bool, unavailable: bool, error_seconds: f64) -> u16 {
        if unavailable {
            let mut raw = (1u16 << 14) | 1;
            if synced {
                raw |= 1 << 15;
            }
            return raw;
        }

        let error_seconds = error_seconds.clamp(MIN_ERROR_SECONDS, MAX_ERROR_SECONDS);

        let mut best_scale = 0u8;
        let mut best_multiplier = 1u8;
        for scale in (0..=63u8).rev() {
            let multiplier = (error_seconds * 2f64.powi(i32::from(scale))).round();
            if (1.0..=255.0).contains(&multiplier) {
                best_scale = scale;
                best_multiplier = multiplier as u8;
                break;
            }
        }

        let mut raw = 0u16;
        if synced {
            raw |= 1 << 15;
        }
        raw |= u16::from(best_scale & 0x3F) << 8;
        raw |= u16::from(best_multiplier);
        raw
    }

    /// The raw field rendered as `0xXXXX`, as emitted in result documents.
    pub fn hex(raw: u16) -> String {
        format!("0x{raw:04X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_synced_scale_multiplier() {
        // S=1, Z=0, Scale=10, Multiplier=1 -> 2^-10 s
        let info = ErrorEstimate::decode(0x8A01);
        assert!(info.synced);
        assert!(!info.unavailable);
        assert_eq!(info.scale, 10);
        assert_eq!(info.multiplier, 1);
        assert!((info.error_seconds - 0.0009765625).abs() < 1e-12);
    }

    #[test]
    fn test_decode_unavailable() {
        // Z=1: error is infinite regardless of scale/multiplier.
        let info = ErrorEstimate::decode(0x4001);
        assert!(!info.synced);
        assert!(info.unavailable);
        assert_eq!(info.error_seconds, ERROR_UNAVAILABLE);
    }

    #[test]
    fn test_decode_zero_multiplier_is_unavailable() {
        let info = ErrorEstimate::decode(0x8A00);
        assert!(!info.unavailable);
        assert_eq!(info.multiplier, 0);
        assert_eq!(info.error_seconds, ERROR_UNAVAILABLE);
    }

    #[test]
    fn test_encode_unavailable() {
        let raw = ErrorEstimate::encode(false, true, 0.0);
        let info = ErrorEstimate::decode(raw);
        assert!(info.unavailable);
        assert_eq!(info.multiplier, 1);
        assert_eq!(info.scale, 0);
    }

    #[test]
    fn test_encode_half_second_is_exact() {
        // 0.5 s has an exact representation: 128 x 2^-8.
        let raw = ErrorEstimate::encode(false, false, 0.5);
        let info = ErrorEstimate::decode(raw);
        assert_eq!(info.multiplier, 128);
        assert_eq!(info.scale, 8);
        assert_eq!(info.error_seconds, 0.5);
    }

    #[test]
    fn test_encode_sets_sync_bit() {
        let raw = ErrorEstimate::encode(true, false, 0.5);
        assert_eq!(raw >> 15, 1);
        assert!(ErrorEstimate::decode(raw).synced);
        assert!(!ErrorEstimate::decode(ErrorEstimate::encode(false, false, 0.5)).synced);
    }

    #[test]
    fn test_encode_clamps_range() {
        // Below 1 µs clamps up to 1 µs; above 100 s clamps down to 100 s.
        let tiny = ErrorEstimate::decode(ErrorEstimate::encode(false, false, 1e-12));
        assert!(tiny.error_seconds >= 1e-6 * (1.0 - 1.0 / 256.0));

        let huge = ErrorEstimate::decode(ErrorEstimate::encode(false, false, 1e6));
        assert!(huge.error_seconds <= 100.0 * (1.0 + 1.0 / 256.0));
        assert!(huge.error_seconds >= 100.0 * (1.0 - 1.0 / 256.0));
    }

    #[test]
    fn test_round_trip_precision() {
        // decode(encode(t)) stays within a 2^-8 relative band across the
        // supported range.
        let mut t = 1e-6;
        while t <= 100.0 {
            let info = ErrorEstimate::decode(ErrorEstimate::encode(true, false, t));
            assert!(info.synced);
            let lo = t * (1.0 - 1.0 / 256.0);
            let hi = t * (1.0 + 1.0 / 256.0);
            assert!(
                info.error_seconds >= lo && info.error_seconds <= hi,
                "t={t}: decoded {} outside [{lo}, {hi}]",
                info.error_seconds
            );
            t *= 1.37;
        }
    }

    #[test]
    fn test_reencode_preserves_error_seconds() {
        // Re-encoding a decoded value lands on the same point of the
        // quantization grid: error_seconds is preserved exactly for values
        // that are exactly representable.
        for raw in [0x8A01u16, 0x0101, 0x8880, 0x0880, 0x01C8] {
            let first = ErrorEstimate::decode(raw);
            let reencoded =
                ErrorEstimate::encode(first.synced, first.unavailable, first.error_seconds);
            let second = ErrorEstimate::decode(reencoded);
            assert_eq!(first.error_seconds, second.error_seconds, "raw={raw:#06x}");
            assert_eq!(first.synced, second.synced);
        }
    }

    #[test]
    fn test_hex_rendering() {
        assert_eq!(ErrorEstimate::hex(0x8A01), "0x8A01");
        assert_eq!(ErrorEstimate::hex(0x0001), "0x0001");
    }
}
