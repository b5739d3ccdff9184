use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default iperf3 server port.
pub const DEFAULT_IPERF3_PORT: u16 = 5201;
/// Default TWAMP control port.
pub const DEFAULT_TWAMP_PORT: u16 = 862;
/// Default iperf3 test duration in seconds.
pub const DEFAULT_DURATION_SECS: u64 = 5;
/// Default bandwidth target in Mbit/s.
pub const DEFAULT_BANDWIDTH_MBPS: u64 = 100;
/// Default number of TWAMP probes per request.
pub const DEFAULT_PROBE_COUNT: u32 = 10;

/// Block size sent in the parameter JSON for TCP tests (128 KiB).
pub const DEFAULT_TCP_BLKSIZE: usize = 128 * 1024;
/// Block size sent in the parameter JSON for UDP tests.
pub const DEFAULT_UDP_BLKSIZE: usize = 1460;

/// Transport protocol for the iperf3 data streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Name used in result documents ("TCP" / "UDP").
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(Error::Config(format!(
                "unknown protocol {other:?}, expected TCP or UDP"
            ))),
        }
    }
}

/// Configuration for one iperf3 measurement.
///
/// Built by the dispatcher from a validated request; every field is already
/// defaulted and sanity-checked by the time a client sees it.
///
/// # Examples
///
/// ```
/// use netgauge::{Iperf3Config, Protocol};
/// use std::time::Duration;
///
/// let config = Iperf3Config::new("iperf.example.net".to_string())
///     .with_parallel(4)
///     .with_duration(Duration::from_secs(10));
/// assert_eq!(config.protocol, Protocol::Tcp);
/// assert_eq!(config.block_size(), 128 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iperf3Config {
    /// Target server hostname or IP.
    pub host: String,

    /// Target server port.
    pub port: u16,

    /// Test duration.
    pub duration: Duration,

    /// Number of parallel data streams (minimum effective 1).
    pub parallel: usize,

    /// Protocol for the data streams.
    pub protocol: Protocol,

    /// Reverse mode: the server sends, this client receives.
    pub reverse: bool,

    /// Total bandwidth target in bits per second, shared across streams.
    pub bits_per_second: u64,
}

impl Iperf3Config {
    /// Creates a configuration for `host` with every other field defaulted.
    pub fn new(host: String) -> Self {
        Self {
            host,
            port: DEFAULT_IPERF3_PORT,
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
            parallel: 1,
            protocol: Protocol::Tcp,
            reverse: false,
            bits_per_second: DEFAULT_BANDWIDTH_MBPS * 1_000_000,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the stream count; zero is lifted to one.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Sets the bandwidth target from Mbit/s; zero falls back to the default.
    pub fn with_bandwidth_mbps(mut self, mbps: u64) -> Self {
        let mbps = if mbps == 0 { DEFAULT_BANDWIDTH_MBPS } else { mbps };
        self.bits_per_second = mbps * 1_000_000;
        self
    }

    /// Block size advertised in the parameter JSON, by protocol.
    pub fn block_size(&self) -> usize {
        match self.protocol {
            Protocol::Tcp => DEFAULT_TCP_BLKSIZE,
            Protocol::Udp => DEFAULT_UDP_BLKSIZE,
        }
    }

    /// `host:port` string used for dialing and error messages.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for one TWAMP measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwampConfig {
    /// Target reflector hostname or IP.
    pub host: String,

    /// Target reflector port.
    pub port: u16,

    /// Number of probes to send.
    pub probe_count: u32,

    /// Extra padding bytes appended to each sender test packet. Forwarded to
    /// the session transport unchanged; post-processing ignores it.
    pub padding: usize,
}

impl TwampConfig {
    /// Creates a configuration for `host` with every other field defaulted.
    pub fn new(host: String) -> Self {
        Self {
            host,
            port: DEFAULT_TWAMP_PORT,
            probe_count: DEFAULT_PROBE_COUNT,
            padding: 0,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the probe count; zero falls back to the default.
    pub fn with_probe_count(mut self, count: u32) -> Self {
        self.probe_count = if count == 0 { DEFAULT_PROBE_COUNT } else { count };
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// `host:port` string used for dialing and error messages.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
