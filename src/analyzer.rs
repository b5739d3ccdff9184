//! TWAMP result analysis.
//!
//! A single pass over the probe records computes, per valid probe:
//!
//! - raw forward delay `F = T2 - T1` and raw reverse delay `R = T4 - T3`
//!   (both shifted by the sender/reflector clock offset),
//! - reflector turnaround `U = T3 - T2`,
//! - network RTT `N = F + R = (T4 - T1) - U`, offset-free because the
//!   offset enters F and R with opposite signs,
//! - the per-probe offset estimate `O = (F - R) / 2` and the
//!   symmetric-path corrected delays `F' = F - O`, `R' = R + O`.
//!
//! Across consecutive valid probes it derives the RFC 3393 IPDV series for
//! both directions (offset-free for the same reason) and feeds the RFC 3550
//! exponentially smoothed jitter estimators. TTLs yield best-effort hop
//! counts. All duration accumulation happens in nanoseconds; the report is
//! rendered in milliseconds.

use serde::{Deserialize, Serialize};

use crate::clock::ClockStatus;
use crate::error_estimate::ErrorEstimate;
use crate::twamp::SessionOutcome;

const NANOS_PER_MILLI: f64 = 1e6;

/// min/max/avg group, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayStatsMs {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// min/max/avg/stddev group, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RttStatsMs {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
}

/// IPDV group: min/max/avg plus the mean absolute deviation, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IpdvStatsMs {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub mean_abs: f64,
}

/// Hop-count group for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HopStats {
    pub min: i64,
    pub max: i64,
    pub avg: f64,
}

/// Hop counts for both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HopReport {
    pub forward: HopStats,
    pub reverse: HopStats,
}

/// Fully decoded Error Estimate, as rendered in the result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEstimateReport {
    pub synced: bool,
    pub unavailable: bool,
    pub scale: u8,
    pub multiplier: u8,
    pub error_seconds: f64,
    pub error_ms: f64,
    pub raw_value_hex: String,
}

impl ErrorEstimateReport {
    fn from_raw(raw: u16) -> Self {
        let info = ErrorEstimate::decode(raw);
        Self {
            synced: info.synced,
            unavailable: info.unavailable,
            scale: info.scale,
            multiplier: info.multiplier,
            error_seconds: info.error_seconds,
            error_ms: info.error_seconds * 1000.0,
            raw_value_hex: ErrorEstimate::hex(raw),
        }
    }
}

/// Clock-synchronization quality metadata.
///
/// `sender_synced` comes from the local clock probe queried at the start of
/// the request (authoritative); the Error Estimate the sender advertised on
/// the wire is reported alongside for reference. `reflector_synced` is the
/// S-bit of the reflector's Error Estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub sender_synced: bool,
    pub reflector_synced: bool,
    pub both_synced: bool,
    pub sender_error_estimate: ErrorEstimateReport,
    pub reflector_error_estimate: ErrorEstimateReport,
}

/// TWAMP measurement result document.
///
/// Immutable once returned; every duration field is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwampReport {
    pub server: String,
    pub local_endpoint: String,
    pub remote_endpoint: String,
    pub probes: u32,
    pub loss_percent: f64,
    /// Network RTT `(T4-T1) - (T3-T2)`: reflector processing removed,
    /// clock-offset free.
    pub rtt_min_ms: f64,
    pub rtt_max_ms: f64,
    pub rtt_avg_ms: f64,
    pub rtt_stddev_ms: f64,
    /// Raw RTT `T4-T1`, including reflector turnaround.
    pub rtt_raw_ms: RttStatsMs,
    pub reflector_turnaround_ms: DelayStatsMs,
    pub estimated_clock_offset_ms: f64,
    pub sync_status: SyncStatus,
    pub forward_delay_raw_ms: DelayStatsMs,
    pub forward_delay_corrected_ms: DelayStatsMs,
    pub forward_ipdv_ms: IpdvStatsMs,
    pub forward_jitter_ms: f64,
    pub reverse_delay_raw_ms: DelayStatsMs,
    pub reverse_delay_corrected_ms: DelayStatsMs,
    pub reverse_ipdv_ms: IpdvStatsMs,
    pub reverse_jitter_ms: f64,
    pub hops: HopReport,
}

/// Running min/max/sum over nanosecond samples.
#[derive(Debug, Clone, Copy, Default)]
struct RangeAcc {
    min: f64,
    max: f64,
    sum: f64,
    count: u32,
}

impl RangeAcc {
    fn add(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / f64::from(self.count)
        }
    }

    fn stats_ms(&self) -> DelayStatsMs {
        DelayStatsMs {
            min: self.min / NANOS_PER_MILLI,
            max: self.max / NANOS_PER_MILLI,
            avg: self.avg() / NANOS_PER_MILLI,
        }
    }
}

/// Running hop-count aggregate for one direction.
#[derive(Debug, Clone, Copy, Default)]
struct HopAcc {
    min: i64,
    max: i64,
    sum: i64,
    count: u32,
}

impl HopAcc {
    fn add(&mut self, v: i64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn stats(&self) -> HopStats {
        HopStats {
            min: self.min,
            max: self.max,
            avg: if self.count == 0 {
                0.0
            } else {
                self.sum as f64 / f64::from(self.count)
            },
        }
    }
}

/// RFC 3550 jitter estimator: `J += (|d| - J) / 16`, state starts at zero.
#[derive(Debug, Clone, Copy, Default)]
struct Rfc3550Jitter {
    nanos: f64,
}

impl Rfc3550Jitter {
    fn update(&mut self, ipdv_nanos: f64) {
        self.nanos += (ipdv_nanos.abs() - self.nanos) / 16.0;
    }

    fn millis(&self) -> f64 {
        self.nanos / NANOS_PER_MILLI
    }
}

/// Infers the reflector's initial TTL as the smallest common value (64,
/// 128, 255) not below the received one.
fn infer_initial_ttl(received_ttl: u8) -> i64 {
    if received_ttl > 128 {
        255
    } else if received_ttl > 64 {
        128
    } else {
        64
    }
}

/// Analyzes a completed probe session into the result document.
///
/// `probe_count` is the requested probe count and the loss denominator.
/// When no probe came back valid, `loss_percent` is 100 and every metric
/// field is zero; the document shape never changes.
pub fn analyze(
    server: &str,
    outcome: &SessionOutcome,
    probe_count: u32,
    sender_clock: ClockStatus,
) -> TwampReport {
    let mut fwd_raw = RangeAcc::default();
    let mut rev_raw = RangeAcc::default();
    let mut fwd_corr = RangeAcc::default();
    let mut rev_corr = RangeAcc::default();
    let mut turnaround = RangeAcc::default();
    let mut network_rtt = RangeAcc::default();
    let mut raw_rtt = RangeAcc::default();
    let mut offset = RangeAcc::default();
    let mut network_rtt_sumsq = 0.0f64;
    let mut raw_rtt_sumsq = 0.0f64;

    let mut fwd_ipdv = RangeAcc::default();
    let mut rev_ipdv = RangeAcc::default();
    let mut fwd_ipdv_abs_sum = 0.0f64;
    let mut rev_ipdv_abs_sum = 0.0f64;
    let mut fwd_jitter = Rfc3550Jitter::default();
    let mut rev_jitter = Rfc3550Jitter::default();
    let mut prev_delays: Option<(f64, f64)> = None;

    let mut fwd_hops = HopAcc::default();
    let mut rev_hops = HopAcc::default();

    let mut first_error_estimates: Option<(u16, u16)> = None;
    let mut valid_count = 0u32;

    for record in outcome.records.iter().filter(|r| !r.lost) {
        let f = (record.t2_ns - record.t1_ns) as f64;
        let r = (record.t4_ns - record.t3_ns) as f64;
        let u = (record.t3_ns - record.t2_ns) as f64;
        let n = f + r;
        let raw = (record.t4_ns - record.t1_ns) as f64;
        let o = (f - r) / 2.0;

        fwd_raw.add(f);
        rev_raw.add(r);
        turnaround.add(u);
        network_rtt.add(n);
        raw_rtt.add(raw);
        offset.add(o);
        fwd_corr.add(f - o);
        rev_corr.add(r + o);
        network_rtt_sumsq += n * n;
        raw_rtt_sumsq += raw * raw;

        if first_error_estimates.is_none() {
            first_error_estimates =
                Some((record.sender_error_estimate, record.reflector_error_estimate));
        }

        // IPDV over consecutive valid probes; the clock offset is the same
        // in both terms and cancels.
        if let Some((prev_f, prev_r)) = prev_delays {
            let df = f - prev_f;
            let dr = r - prev_r;
            fwd_ipdv.add(df);
            rev_ipdv.add(dr);
            fwd_ipdv_abs_sum += df.abs();
            rev_ipdv_abs_sum += dr.abs();
            fwd_jitter.update(df);
            rev_jitter.update(dr);
        }
        prev_delays = Some((f, r));

        if record.sender_ttl > 0 {
            fwd_hops.add(255 - i64::from(record.sender_ttl));
        }
        if record.received_ttl > 0 {
            let initial = infer_initial_ttl(record.received_ttl);
            rev_hops.add(initial - i64::from(record.received_ttl));
        }

        valid_count += 1;
    }

    let lost_count = probe_count.saturating_sub(valid_count);
    let loss_percent = if probe_count > 0 {
        f64::from(lost_count) / f64::from(probe_count) * 100.0
    } else {
        0.0
    };

    let (sender_raw, reflector_raw) = first_error_estimates.unwrap_or((0, 0));
    let sender_ee = ErrorEstimateReport::from_raw(sender_raw);
    let reflector_ee = ErrorEstimateReport::from_raw(reflector_raw);
    let reflector_synced = reflector_ee.synced;
    let sender_synced = sender_clock.synchronized;

    let network_rtt_stats = network_rtt.stats_ms();
    let raw_rtt_stats = raw_rtt.stats_ms();

    TwampReport {
        server: server.to_string(),
        local_endpoint: outcome.local_endpoint.clone(),
        remote_endpoint: outcome.remote_endpoint.clone(),
        probes: probe_count,
        loss_percent,
        rtt_min_ms: network_rtt_stats.min,
        rtt_max_ms: network_rtt_stats.max,
        rtt_avg_ms: network_rtt_stats.avg,
        rtt_stddev_ms: stddev_ms(&network_rtt, network_rtt_sumsq),
        rtt_raw_ms: RttStatsMs {
            min: raw_rtt_stats.min,
            max: raw_rtt_stats.max,
            avg: raw_rtt_stats.avg,
            stddev: stddev_ms(&raw_rtt, raw_rtt_sumsq),
        },
        reflector_turnaround_ms: turnaround.stats_ms(),
        estimated_clock_offset_ms: offset.avg() / NANOS_PER_MILLI,
        sync_status: SyncStatus {
            sender_synced,
            reflector_synced,
            both_synced: sender_synced && reflector_synced,
            sender_error_estimate: sender_ee,
            reflector_error_estimate: reflector_ee,
        },
        forward_delay_raw_ms: fwd_raw.stats_ms(),
        forward_delay_corrected_ms: fwd_corr.stats_ms(),
        forward_ipdv_ms: ipdv_stats_ms(&fwd_ipdv, fwd_ipdv_abs_sum),
        forward_jitter_ms: fwd_jitter.millis(),
        reverse_delay_raw_ms: rev_raw.stats_ms(),
        reverse_delay_corrected_ms: rev_corr.stats_ms(),
        reverse_ipdv_ms: ipdv_stats_ms(&rev_ipdv, rev_ipdv_abs_sum),
        reverse_jitter_ms: rev_jitter.millis(),
        hops: HopReport {
            forward: fwd_hops.stats(),
            reverse: rev_hops.stats(),
        },
    }
}

/// `sqrt(E[X^2] - E[X]^2)` over an accumulator, clamped at zero, in ms.
fn stddev_ms(acc: &RangeAcc, sumsq: f64) -> f64 {
    if acc.count == 0 {
        return 0.0;
    }
    let mean = acc.avg();
    let mean_sq = sumsq / f64::from(acc.count);
    let variance = (mean_sq - mean * mean).max(0.0);
    variance.sqrt() / NANOS_PER_MILLI
}

fn ipdv_stats_ms(acc: &RangeAcc, abs_sum: f64) -> IpdvStatsMs {
    let base = acc.stats_ms();
    IpdvStatsMs {
        min: base.min,
        max: base.max,
        avg: base.avg,
        mean_abs: if acc.count == 0 {
            0.0
        } else {
            abs_sum / f64::from(acc.count) / NANOS_PER_MILLI
        },
    }
}
