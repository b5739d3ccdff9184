//! netgauge - network performance measurement service
//!
//! Two measurement cores behind a small request interface:
//!
//! - a wire-compatible iperf3 client that negotiates with standard iperf3
//!   servers and drives paced bandwidth transfers over parallel streams
//! - a TWAMP client post-processor computing per-direction delays, RFC 3393
//!   IPDV, RFC 3550 jitter, clock-offset-free network RTT, hop counts, and
//!   clock-synchronization metadata from the four TWAMP timestamps
//!
//! # Features
//!
//! - TCP and UDP iperf3 tests, upload and reverse (download) mode
//! - Token-bucket rate pacing with a shared wall-clock deadline
//! - TWAMP-light probe sessions with Error Estimate advertisement
//! - Asynchronous I/O using tokio; HTTP dispatch via axum

pub mod analyzer;
pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod error_estimate;
pub mod protocol;
pub mod token_bucket;
pub mod twamp;

pub use analyzer::{analyze, TwampReport};
pub use client::{Iperf3Client, Iperf3Result};
pub use clock::{ClockProbe, ClockStatus, SystemClockProbe};
pub use config::{Iperf3Config, Protocol, TwampConfig};
pub use error::{Error, Result};
pub use error_estimate::ErrorEstimate;
pub use twamp::{ProbeRecord, SessionOutcome, SessionTransport, TwampLightTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
