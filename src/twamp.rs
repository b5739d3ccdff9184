//! TWAMP session transport: per-probe records and a TWAMP-light sender.
//!
//! The analyzer consumes [`ProbeRecord`]s and does not care where they come
//! from; [`SessionTransport`] is the seam. The bundled implementation,
//! [`TwampLightTransport`], speaks the unauthenticated test-packet format of
//! RFC 4656/5357 directly against a reflector port (no control-channel
//! negotiation), which is enough for TWAMP-light style reflectors. A full
//! TWAMP integration can plug in its own transport.

use std::net::{ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::{Error, Result};

/// IP TTL on outgoing probes. Forward hop counts are derived from the
/// reflector's report of the TTL it saw, assuming this initial value.
pub const SENDER_TTL: u32 = 255;

/// Unauthenticated sender test packet header: sequence number, NTP
/// timestamp, error estimate.
const SENDER_HEADER_LEN: usize = 14;

/// Size of an unauthenticated reflected test packet without padding.
pub const REFLECTED_PACKET_LEN: usize = 41;

/// Seconds between the NTP era (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// One sent probe, as observed by the session sender.
///
/// Timestamps are Unix nanoseconds: T1 send, T2 reflector receive, T3
/// reflector send, T4 sender receive. A lost probe (no reply before the
/// timeout) carries only `t1_ns` and the `lost` flag; lost records
/// contribute to the loss count and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRecord {
    pub t1_ns: i64,
    pub t2_ns: i64,
    pub t3_ns: i64,
    pub t4_ns: i64,
    /// Error Estimate this sender advertised, as echoed by the reflector.
    pub sender_error_estimate: u16,
    /// Error Estimate of the reflector's own clock.
    pub reflector_error_estimate: u16,
    /// TTL of the probe on arrival at the reflector.
    pub sender_ttl: u8,
    /// TTL of the reflected packet on arrival back at the sender; 0 when
    /// unavailable.
    pub received_ttl: u8,
    pub lost: bool,
}

impl ProbeRecord {
    /// Record for a probe whose reply never arrived.
    pub fn lost(t1_ns: i64) -> Self {
        Self {
            t1_ns,
            t2_ns: 0,
            t3_ns: 0,
            t4_ns: 0,
            sender_error_estimate: 0,
            reflector_error_estimate: 0,
            sender_ttl: 0,
            received_ttl: 0,
            lost: true,
        }
    }
}

/// Everything a completed probe session yields.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Local test endpoint as `ip:port`.
    pub local_endpoint: String,
    /// Remote test endpoint as `ip:port`.
    pub remote_endpoint: String,
    /// One record per sent probe, in send order.
    pub records: Vec<ProbeRecord>,
}

/// Parameters for one probe session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Number of probes to send.
    pub probe_count: u32,
    /// Padding bytes appended to each sender packet, forwarded unchanged.
    pub padding: usize,
    /// Error Estimate to advertise in outgoing probes.
    pub sender_error_estimate: u16,
    /// How long to wait for each reply before declaring the probe lost.
    pub reply_timeout: Duration,
    /// Cadence between consecutive probes.
    pub interval: Duration,
}

impl SessionSpec {
    pub fn new(probe_count: u32, padding: usize, sender_error_estimate: u16) -> Self {
        Self {
            probe_count,
            padding,
            sender_error_estimate,
            reply_timeout: Duration::from_secs(1),
            interval: Duration::from_secs(1),
        }
    }
}

/// Executes probe sessions against a target reflector.
///
/// Implementations block; the request layer runs them on a blocking task.
pub trait SessionTransport: Send + Sync {
    /// Runs a session of `spec.probe_count` probes against `target`
    /// (`host:port`) and returns one record per sent probe.
    fn execute(&self, target: &str, spec: &SessionSpec) -> Result<SessionOutcome>;
}

/// TWAMP-light session sender over UDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TwampLightTransport;

impl TwampLightTransport {
    pub fn new() -> Self {
        Self
    }
}

impl SessionTransport for TwampLightTransport {
    fn execute(&self, target: &str, spec: &SessionSpec) -> Result<SessionOutcome> {
        let addr = target
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("resolve {target} failed: {e}")))?
            .next()
            .ok_or_else(|| Error::Connection(format!("resolve {target}: no addresses")))?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| Error::Connection(format!("bind for {target} failed: {e}")))?;
        socket
            .connect(addr)
            .map_err(|e| Error::Connection(format!("connect to {target} failed: {e}")))?;
        socket.set_ttl(SENDER_TTL)?;

        if addr.is_ipv4() {
            if let Err(e) = enable_recv_ttl(&socket) {
                // Reverse hop counts degrade to "unavailable"; keep probing.
                warn!("IP_RECVTTL not available: {e}");
            }
        }

        let local_endpoint = socket.local_addr()?.to_string();
        let remote_endpoint = addr.to_string();
        info!(
            "TWAMP session: {} -> {} ({} probes, {} byte padding)",
            local_endpoint, remote_endpoint, spec.probe_count, spec.padding
        );

        let mut records = Vec::with_capacity(spec.probe_count as usize);
        let mut reply_buf = vec![0u8; REFLECTED_PACKET_LEN + spec.padding + 512];

        for seq in 0..spec.probe_count {
            let probe_started = Instant::now();
            let t1_ns = unix_now_nanos();

            let packet = build_sender_packet(seq, t1_ns, spec.sender_error_estimate, spec.padding);
            socket
                .send(&packet)
                .map_err(|e| Error::Connection(format!("send to {target} failed: {e}")))?;

            records.push(self.await_reply(&socket, seq, t1_ns, spec, &mut reply_buf)?);

            // Hold the cadence: next probe leaves one interval after this
            // one did, unless the reply already took longer.
            if seq + 1 < spec.probe_count {
                let elapsed = probe_started.elapsed();
                if elapsed < spec.interval {
                    std::thread::sleep(spec.interval - elapsed);
                }
            }
        }

        let lost = records.iter().filter(|r| r.lost).count();
        debug!("TWAMP session done: {}/{} replies", records.len() - lost, records.len());

        Ok(SessionOutcome {
            local_endpoint,
            remote_endpoint,
            records,
        })
    }
}

impl TwampLightTransport {
    /// Waits for the reply to probe `seq`, discarding stale replies, until
    /// the reply timeout passes.
    fn await_reply(
        &self,
        socket: &UdpSocket,
        seq: u32,
        t1_ns: i64,
        spec: &SessionSpec,
        buf: &mut [u8],
    ) -> Result<ProbeRecord> {
        let deadline = Instant::now() + spec.reply_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ProbeRecord::lost(t1_ns));
            }
            socket.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;

            match recv_with_ttl(socket, buf) {
                Ok((n, received_ttl)) => {
                    let t4_ns = unix_now_nanos();
                    match parse_reflected_packet(&buf[..n], t1_ns, t4_ns, received_ttl) {
                        Some(record) if echoed_sequence(&buf[..n]) == Some(seq) => {
                            return Ok(record)
                        }
                        Some(_) => {
                            debug!("discarding stale reflected packet ({n} bytes)");
                        }
                        None => {
                            debug!("discarding short reflected packet ({n} bytes)");
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(ProbeRecord::lost(t1_ns));
                }
                Err(e) => {
                    return Err(Error::Connection(format!("receive failed: {e}")));
                }
            }
        }
    }
}

/// Builds an unauthenticated sender test packet: sequence number, NTP
/// timestamp, error estimate, then `padding` zero bytes.
fn build_sender_packet(seq: u32, t1_ns: i64, error_estimate: u16, padding: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(SENDER_HEADER_LEN + padding);
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&ntp_from_unix_nanos(t1_ns).to_be_bytes());
    packet.extend_from_slice(&error_estimate.to_be_bytes());
    packet.resize(SENDER_HEADER_LEN + padding, 0);
    packet
}

/// Sender sequence number echoed in a reflected packet, if it is long
/// enough to carry one.
fn echoed_sequence(packet: &[u8]) -> Option<u32> {
    let bytes = packet.get(24..28)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parses an unauthenticated reflected test packet.
///
/// Layout (RFC 5357 section 4.2.1): sequence number (4), timestamp T3 (8),
/// error estimate (2), MBZ (2), receive timestamp T2 (8), sender sequence
/// number (4), sender timestamp (8), sender error estimate (2), MBZ (2),
/// sender TTL (1).
fn parse_reflected_packet(
    packet: &[u8],
    t1_ns: i64,
    t4_ns: i64,
    received_ttl: u8,
) -> Option<ProbeRecord> {
    if packet.len() < REFLECTED_PACKET_LEN {
        return None;
    }

    let t3_raw = u64::from_be_bytes(packet[4..12].try_into().ok()?);
    let reflector_ee = u16::from_be_bytes(packet[12..14].try_into().ok()?);
    let t2_raw = u64::from_be_bytes(packet[16..24].try_into().ok()?);
    let sender_ee = u16::from_be_bytes(packet[36..38].try_into().ok()?);
    let sender_ttl = packet[40];

    Some(ProbeRecord {
        t1_ns,
        t2_ns: unix_nanos_from_ntp(t2_raw),
        t3_ns: unix_nanos_from_ntp(t3_raw),
        t4_ns,
        sender_error_estimate: sender_ee,
        reflector_error_estimate: reflector_ee,
        sender_ttl,
        received_ttl,
        lost: false,
    })
}

/// Current wall-clock time as Unix nanoseconds.
fn unix_now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Converts Unix nanoseconds to a 64-bit NTP timestamp (RFC 5905 format:
/// 32-bit seconds since 1900, 32-bit fraction).
fn ntp_from_unix_nanos(ns: i64) -> u64 {
    let ns = ns.max(0) as u64;
    let secs = ns / 1_000_000_000 + NTP_UNIX_OFFSET_SECS;
    let frac = ((ns % 1_000_000_000) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Converts a 64-bit NTP timestamp to Unix nanoseconds.
fn unix_nanos_from_ntp(raw: u64) -> i64 {
    let secs = (raw >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
    let frac_ns = ((raw & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
    (secs * 1_000_000_000 + frac_ns) as i64
}

/// Receives one datagram along with the IP TTL it arrived with.
///
/// The TTL comes from an `IP_TTL` control message and requires
/// `IP_RECVTTL`; where that is unavailable the TTL is reported as 0 and the
/// analyzer skips reverse hop derivation.
#[cfg(target_os = "linux")]
fn recv_with_ttl(socket: &UdpSocket, buf: &mut [u8]) -> std::io::Result<(usize, u8)> {
    use std::os::fd::AsRawFd;

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control = [0u8; 64];
    // SAFETY: msghdr points at live buffers for the duration of the call;
    // recvmsg fills them and the cmsg walk stays within msg_controllen.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut ttl = 0u8;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_TTL {
                let value = *(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                ttl = value.clamp(0, 255) as u8;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, ttl))
}

#[cfg(not(target_os = "linux"))]
fn recv_with_ttl(socket: &UdpSocket, buf: &mut [u8]) -> std::io::Result<(usize, u8)> {
    let n = socket.recv(buf)?;
    Ok((n, 0))
}

#[cfg(target_os = "linux")]
fn enable_recv_ttl(socket: &UdpSocket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    // SAFETY: plain setsockopt with a c_int-sized option value.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_recv_ttl(_socket: &UdpSocket) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "per-packet TTL not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_packet_layout() {
        let packet = build_sender_packet(7, 1_700_000_000_000_000_000, 0x8101, 0);
        assert_eq!(packet.len(), SENDER_HEADER_LEN);
        assert_eq!(&packet[0..4], &7u32.to_be_bytes());
        assert_eq!(&packet[12..14], &0x8101u16.to_be_bytes());
    }

    #[test]
    fn test_sender_packet_padding() {
        let packet = build_sender_packet(0, 0, 0, 27);
        assert_eq!(packet.len(), SENDER_HEADER_LEN + 27);
        assert!(packet[SENDER_HEADER_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ntp_round_trip() {
        let ns = 1_700_000_123_456_789_012i64;
        let back = unix_nanos_from_ntp(ntp_from_unix_nanos(ns));
        // The 32-bit fraction resolves ~0.23 ns; allow a few counts.
        assert!((back - ns).abs() < 5, "round trip drifted by {}", back - ns);
    }

    #[test]
    fn test_ntp_epoch_offset() {
        // Unix epoch = NTP 2_208_988_800.0
        assert_eq!(ntp_from_unix_nanos(0) >> 32, NTP_UNIX_OFFSET_SECS);
        assert_eq!(unix_nanos_from_ntp(NTP_UNIX_OFFSET_SECS << 32), 0);
    }

    fn build_reflected(seq: u32, t2: u64, t3: u64, sender_seq: u32, sender_ee: u16) -> Vec<u8> {
        let mut p = vec![0u8; REFLECTED_PACKET_LEN];
        p[0..4].copy_from_slice(&seq.to_be_bytes());
        p[4..12].copy_from_slice(&t3.to_be_bytes());
        p[12..14].copy_from_slice(&0x0164u16.to_be_bytes());
        p[16..24].copy_from_slice(&t2.to_be_bytes());
        p[24..28].copy_from_slice(&sender_seq.to_be_bytes());
        p[36..38].copy_from_slice(&sender_ee.to_be_bytes());
        p[40] = 250;
        p
    }

    #[test]
    fn test_parse_reflected_packet() {
        let t2 = ntp_from_unix_nanos(1_700_000_000_100_000_000);
        let t3 = ntp_from_unix_nanos(1_700_000_000_100_050_000);
        let packet = build_reflected(3, t2, t3, 3, 0x8101);

        let record =
            parse_reflected_packet(&packet, 1_700_000_000_000_000_000, 1_700_000_000_200_000_000, 62)
                .unwrap();
        assert!(!record.lost);
        assert_eq!(record.reflector_error_estimate, 0x0164);
        assert_eq!(record.sender_error_estimate, 0x8101);
        assert_eq!(record.sender_ttl, 250);
        assert_eq!(record.received_ttl, 62);
        assert!((record.t2_ns - 1_700_000_000_100_000_000).abs() < 5);
        assert!((record.t3_ns - 1_700_000_000_100_050_000).abs() < 5);
        assert_eq!(echoed_sequence(&packet), Some(3));
    }

    #[test]
    fn test_parse_rejects_short_packet() {
        let packet = vec![0u8; REFLECTED_PACKET_LEN - 1];
        assert!(parse_reflected_packet(&packet, 0, 0, 0).is_none());
    }

    #[test]
    fn test_session_against_local_reflector() {
        // Minimal reflector: echo each probe back in the reflected layout.
        let reflector = UdpSocket::bind("127.0.0.1:0").unwrap();
        let reflector_addr = reflector.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            for seq in 0..3u32 {
                let (n, peer) = reflector.recv_from(&mut buf).unwrap();
                assert!(n >= SENDER_HEADER_LEN);
                let sender_seq =
                    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                assert_eq!(sender_seq, seq);
                let now = ntp_from_unix_nanos(unix_now_nanos());
                let sender_ee = u16::from_be_bytes([buf[12], buf[13]]);
                let reply = build_reflected(seq, now, now, sender_seq, sender_ee);
                reflector.send_to(&reply, peer).unwrap();
            }
        });

        let transport = TwampLightTransport::new();
        let mut spec = SessionSpec::new(3, 0, 0x0101);
        spec.interval = Duration::from_millis(10);
        let outcome = transport
            .execute(&reflector_addr.to_string(), &spec)
            .unwrap();

        handle.join().unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.records.iter().all(|r| !r.lost));
        assert!(outcome.records.iter().all(|r| r.sender_error_estimate == 0x0101));
        assert_eq!(outcome.remote_endpoint, reflector_addr.to_string());
    }

    #[test]
    fn test_session_counts_lost_probes() {
        // Bind a reflector that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();

        let transport = TwampLightTransport::new();
        let mut spec = SessionSpec::new(2, 0, 0);
        spec.reply_timeout = Duration::from_millis(50);
        spec.interval = Duration::from_millis(10);

        let outcome = transport.execute(&addr.to_string(), &spec).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records.iter().all(|r| r.lost));
    }
}
