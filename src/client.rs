//! iperf3 protocol client.
//!
//! Wire-compatible with standard iperf3 servers: the control channel walks
//! the server-driven state machine (cookie, parameter exchange, stream
//! creation, test phase, results exchange), and the data plane runs one
//! worker task per stream against a single shared wall-clock deadline, with
//! token-bucket pacing on the send path.

use log::{debug, info};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{Iperf3Config, Protocol};
use crate::protocol::{
    self, generate_cookie, state, ControlState, TestParams, COOKIE_SIZE,
};
use crate::token_bucket::TokenBucket;
use crate::{Error, Result};

/// Control-connection dial timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-stream creation timeout.
pub const STREAM_CREATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send-path chunk ceiling; the payload is `min(64 KiB, block size)`.
const MAX_SEND_CHUNK: usize = 64 * 1024;

/// Socket buffer size applied to TCP data streams.
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Result document for one iperf3 measurement.
///
/// Exactly one of `sent_bytes` / `received_bytes` is present, selected by
/// the test direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iperf3Result {
    pub server: String,
    pub port: u16,
    pub protocol: String,
    pub duration_sec: f64,
    pub bandwidth_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_bytes: Option<u64>,
}

/// One data stream, TCP or UDP, pinned to a single worker.
enum DataStream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataStream {
    async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DataStream::Tcp(stream) => stream.write(buf).await,
            DataStream::Udp(socket) => socket.send(buf).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DataStream::Tcp(stream) => stream.read(buf).await,
            DataStream::Udp(socket) => socket.recv(buf).await,
        }
    }

    /// Writes `buf` completely; used for the cookie, which must arrive whole.
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            DataStream::Tcp(stream) => stream.write_all(buf).await,
            DataStream::Udp(socket) => socket.send(buf).await.map(|_| ()),
        }
    }
}

/// iperf3 measurement client for one request.
///
/// Created per request and consumed by [`Iperf3Client::run`]; nothing is
/// shared between requests.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Iperf3Client, Iperf3Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Iperf3Config::new("iperf.example.net".to_string());
/// let result = Iperf3Client::new(config).run().await?;
/// println!("{:.2} Mbit/s", result.bandwidth_mbps);
/// # Ok(())
/// # }
/// ```
pub struct Iperf3Client {
    config: Iperf3Config,
    cookie: [u8; COOKIE_SIZE],
    cancel: CancellationToken,
}

impl Iperf3Client {
    pub fn new(config: Iperf3Config) -> Self {
        Self {
            config,
            cookie: generate_cookie(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token for request-level cancellation.
    ///
    /// Cancelling makes every data-plane worker exit at its next check;
    /// dropping the client closes the control channel and all streams.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the measurement to completion.
    ///
    /// Drives the full control-channel state machine and the data plane;
    /// the first classified failure terminates the request, no retries.
    pub async fn run(&self) -> Result<Iperf3Result> {
        let target = self.config.target();

        let mut control = self.connect(&target).await?;
        let mut machine = ControlState::ParamExchange;

        machine = self.exchange_params(&mut control, machine).await?;
        let streams = self.create_streams(&mut control, &mut machine, &target).await?;

        // TEST_START, then TEST_RUNNING.
        machine = Self::expect_server_state(&mut control, machine).await?;
        Self::expect_server_state(&mut control, machine).await?;

        info!(
            "iperf3: test running for {}s ({} streams, {})",
            self.config.duration.as_secs(),
            self.config.parallel,
            self.config.protocol.as_str()
        );

        let (total_bytes, actual_duration) = self.run_data_plane(streams).await;

        self.finish(&mut control).await?;

        let duration_sec = actual_duration.as_secs_f64();
        let bandwidth_mbps = if duration_sec > 0.0 {
            (total_bytes as f64 * 8.0) / (duration_sec * 1e6)
        } else {
            0.0
        };

        info!("iperf3: test completed - {bandwidth_mbps:.2} Mbit/s");

        Ok(Iperf3Result {
            server: self.config.host.clone(),
            port: self.config.port,
            protocol: self.config.protocol.as_str().to_string(),
            duration_sec,
            bandwidth_mbps,
            sent_bytes: (!self.config.reverse).then_some(total_bytes),
            received_bytes: self.config.reverse.then_some(total_bytes),
        })
    }

    /// Dials the control connection and sends the cookie.
    async fn connect(&self, target: &str) -> Result<TcpStream> {
        let mut stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| Error::Connection(format!("connect to {target} timed out")))?
            .map_err(|e| Error::Connection(format!("connect to {target} failed: {e}")))?;

        stream.set_nodelay(true)?;

        stream
            .write_all(&self.cookie)
            .await
            .map_err(|e| Error::Connection(format!("send cookie to {target} failed: {e}")))?;

        info!("iperf3: connected to {target}, cookie sent ({COOKIE_SIZE} bytes)");
        Ok(stream)
    }

    /// Reads one server state byte and advances the machine.
    async fn expect_server_state(
        control: &mut TcpStream,
        machine: ControlState,
    ) -> Result<ControlState> {
        let observed = protocol::read_state(control).await?;
        machine.advance(observed)
    }

    /// Waits for PARAM_EXCHANGE and sends the parameter JSON.
    async fn exchange_params(
        &self,
        control: &mut TcpStream,
        machine: ControlState,
    ) -> Result<ControlState> {
        let machine = Self::expect_server_state(control, machine).await?;

        let params = TestParams::from_config(&self.config);
        protocol::write_framed_json(control, &params).await?;

        debug!(
            "iperf3: parameters exchanged (time={}s, parallel={}, len={})",
            params.time, params.parallel, params.len
        );
        Ok(machine)
    }

    /// Waits for CREATE_STREAMS and opens the data connections.
    ///
    /// A failure on any stream aborts the request; streams opened so far are
    /// closed on drop.
    async fn create_streams(
        &self,
        control: &mut TcpStream,
        machine: &mut ControlState,
        target: &str,
    ) -> Result<Vec<DataStream>> {
        *machine = Self::expect_server_state(control, *machine).await?;

        let mut streams = Vec::with_capacity(self.config.parallel);
        for i in 0..self.config.parallel {
            let mut stream = match self.config.protocol {
                Protocol::Tcp => {
                    let stream = time::timeout(STREAM_CREATE_TIMEOUT, TcpStream::connect(target))
                        .await
                        .map_err(|_| {
                            Error::Connection(format!("create stream {i} to {target} timed out"))
                        })?
                        .map_err(|e| {
                            Error::Connection(format!("create stream {i} to {target} failed: {e}"))
                        })?;
                    configure_stream_socket(&stream);
                    DataStream::Tcp(stream)
                }
                Protocol::Udp => {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    time::timeout(STREAM_CREATE_TIMEOUT, socket.connect(target))
                        .await
                        .map_err(|_| {
                            Error::Connection(format!("create stream {i} to {target} timed out"))
                        })?
                        .map_err(|e| {
                            Error::Connection(format!("create stream {i} to {target} failed: {e}"))
                        })?;
                    DataStream::Udp(socket)
                }
            };

            stream.write_all(&self.cookie).await.map_err(|e| {
                Error::Connection(format!("send cookie on stream {i} to {target} failed: {e}"))
            })?;
            streams.push(stream);
        }

        debug!("iperf3: created {} data streams", streams.len());
        Ok(streams)
    }

    /// Runs the workers until the shared deadline and joins their totals.
    ///
    /// Returns the summed byte count and the wall-clock time from test
    /// start to the last worker's exit.
    async fn run_data_plane(&self, streams: Vec<DataStream>) -> (u64, Duration) {
        let started = Instant::now();
        let deadline = started + self.config.duration;
        let block_size = self.config.block_size();

        let mut workers = Vec::with_capacity(streams.len());
        if self.config.reverse {
            for (id, stream) in streams.into_iter().enumerate() {
                workers.push(tokio::spawn(receive_worker(
                    id,
                    stream,
                    block_size,
                    deadline,
                    self.cancel.clone(),
                )));
            }
        } else {
            let chunk_size = MAX_SEND_CHUNK.min(block_size);
            let mut payload = vec![0u8; chunk_size];
            rand::thread_rng().fill_bytes(&mut payload);
            let payload = Arc::new(payload);

            let per_stream_bytes_per_sec =
                (self.config.bits_per_second as f64 / self.config.parallel as f64) / 8.0;

            for (id, stream) in streams.into_iter().enumerate() {
                workers.push(tokio::spawn(send_worker(
                    id,
                    stream,
                    Arc::clone(&payload),
                    per_stream_bytes_per_sec,
                    deadline,
                    self.cancel.clone(),
                )));
            }
        }

        let mut total_bytes = 0u64;
        for worker in workers {
            total_bytes += worker.await.unwrap_or(0);
        }

        (total_bytes, started.elapsed())
    }

    /// Signals TEST_END and walks the terminal exchange.
    async fn finish(&self, control: &mut TcpStream) -> Result<()> {
        let mut machine = ControlState::TestEnd;
        protocol::write_state(control, state::TEST_END).await?;

        machine = Self::expect_server_state(control, machine).await?;
        // The client has nothing beyond its transfer totals to report;
        // send an empty object and discard the server's results.
        protocol::write_framed_json(control, &serde_json::json!({})).await?;
        let _server_results: serde_json::Value = protocol::read_framed_json(control).await?;

        Self::expect_server_state(control, machine).await?;
        protocol::write_state(control, state::IPERF_DONE).await?;

        debug!("iperf3: session done");
        Ok(())
    }
}

/// Applies throughput-oriented socket options to a TCP data stream.
fn configure_stream_socket(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(STREAM_BUFFER_SIZE) {
        debug!("set send buffer size failed: {e}");
    }
    if let Err(e) = sock.set_recv_buffer_size(STREAM_BUFFER_SIZE) {
        debug!("set recv buffer size failed: {e}");
    }
}

/// Send worker: writes the shared payload until the deadline, paced to its
/// per-stream rate. Write errors end the worker, not the test; whatever was
/// sent still counts.
async fn send_worker(
    id: usize,
    mut stream: DataStream,
    payload: Arc<Vec<u8>>,
    target_bytes_per_sec: f64,
    deadline: Instant,
    cancel: CancellationToken,
) -> u64 {
    let mut bucket = TokenBucket::new(target_bytes_per_sec);
    let mut stream_bytes = 0u64;

    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            break;
        }

        match time::timeout(deadline - now, stream.write(&payload)).await {
            Ok(Ok(n)) => {
                stream_bytes += n as u64;
                bucket.throttle(stream_bytes).await;
            }
            Ok(Err(e)) => {
                debug!("stream {id}: write ended: {e}");
                break;
            }
            Err(_) => break, // write deadline reached
        }
    }

    debug!("stream {id}: sent {stream_bytes} bytes");
    stream_bytes
}

/// Receive worker: reads until the deadline, EOF, or an error. The server
/// paces; no throttling on this side.
async fn receive_worker(
    id: usize,
    mut stream: DataStream,
    block_size: usize,
    deadline: Instant,
    cancel: CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; block_size];
    let mut stream_bytes = 0u64;

    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            break;
        }

        match time::timeout(deadline - now, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break, // server closed the stream
            Ok(Ok(n)) => stream_bytes += n as u64,
            Ok(Err(e)) => {
                debug!("stream {id}: read ended: {e}");
                break;
            }
            Err(_) => break, // read deadline reached
        }
    }

    debug!("stream {id}: received {stream_bytes} bytes");
    stream_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_sent_bytes_only() {
        let result = Iperf3Result {
            server: "h".to_string(),
            port: 5201,
            protocol: "TCP".to_string(),
            duration_sec: 5.0,
            bandwidth_mbps: 94.7,
            sent_bytes: Some(59_187_500),
            received_bytes: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["sent_bytes"], 59_187_500u64);
        assert!(value.get("received_bytes").is_none());
    }

    #[test]
    fn test_result_serializes_received_bytes_only() {
        let result = Iperf3Result {
            server: "h".to_string(),
            port: 5201,
            protocol: "TCP".to_string(),
            duration_sec: 5.0,
            bandwidth_mbps: 94.7,
            sent_bytes: None,
            received_bytes: Some(59_187_500),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["received_bytes"], 59_187_500u64);
        assert!(value.get("sent_bytes").is_none());
    }

    #[test]
    fn test_client_holds_fresh_cookie() {
        let a = Iperf3Client::new(Iperf3Config::new("h".to_string()));
        let b = Iperf3Client::new(Iperf3Config::new("h".to_string()));
        assert_eq!(a.cookie.len(), COOKIE_SIZE);
        assert_eq!(a.cookie[COOKIE_SIZE - 1], 0);
        assert_ne!(a.cookie, b.cookie);
    }
}
