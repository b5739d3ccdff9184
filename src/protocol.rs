//! iperf3 control-channel wire layer.
//!
//! The control channel mixes three encodings:
//!
//! - single signed state bytes driven by the server,
//! - JSON payloads framed with a 4-byte big-endian length prefix,
//! - a 37-byte cookie that identifies the session and each data stream.
//!
//! This module owns all three plus the parameter JSON sent during
//! PARAM_EXCHANGE, and the control state machine the client walks.

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Iperf3Config;
use crate::{Error, Result};

/// Protocol state bytes, as defined by iperf3.
pub mod state {
    pub const TEST_START: i8 = 1;
    pub const TEST_RUNNING: i8 = 2;
    pub const TEST_END: i8 = 4;
    pub const PARAM_EXCHANGE: i8 = 9;
    pub const CREATE_STREAMS: i8 = 10;
    pub const EXCHANGE_RESULTS: i8 = 13;
    pub const DISPLAY_RESULTS: i8 = 14;
    pub const IPERF_DONE: i8 = 16;
    pub const ACCESS_DENIED: i8 = -1;
    pub const SERVER_ERROR: i8 = -2;
}

/// Client version advertised in the parameter JSON.
pub const CLIENT_VERSION: &str = "3.16";

/// Cookie length: 36 base32 characters plus a NUL terminator.
pub const COOKIE_SIZE: usize = 37;

/// Largest framed JSON payload the client will accept (1 MiB).
pub const MAX_CONTROL_JSON_LEN: u32 = 1024 * 1024;

const COOKIE_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Control-channel states for one iperf3 session.
///
/// The server drives the state machine; the client reacts. A session only
/// advances along the documented sequence, and any out-of-sequence state
/// byte fails it with [`Error::UnexpectedState`].
///
/// Server state bytes move the machine through [`ControlState::advance`];
/// the client-driven edges (connection established, test deadline reached,
/// final IPERF_DONE written) are assigned directly by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Connecting,
    ParamExchange,
    CreateStreams,
    TestStart,
    TestRunning,
    TestEnd,
    ExchangeResults,
    DisplayResults,
    Done,
    Failed,
}

impl ControlState {
    /// The state byte the server is expected to send next, if the machine is
    /// waiting on one.
    pub fn expected_state(&self) -> Option<i8> {
        match self {
            ControlState::ParamExchange => Some(state::PARAM_EXCHANGE),
            ControlState::CreateStreams => Some(state::CREATE_STREAMS),
            ControlState::TestStart => Some(state::TEST_START),
            ControlState::TestRunning => Some(state::TEST_RUNNING),
            ControlState::TestEnd => Some(state::EXCHANGE_RESULTS),
            ControlState::ExchangeResults => Some(state::DISPLAY_RESULTS),
            _ => None,
        }
    }

    /// Advances the machine on a server state byte.
    ///
    /// Returns the next state, or the classified failure: ACCESS_DENIED and
    /// SERVER_ERROR during parameter exchange map to their fixed errors,
    /// anything else out of sequence to [`Error::UnexpectedState`].
    pub fn advance(self, observed: i8) -> Result<ControlState> {
        match (self, observed) {
            (ControlState::ParamExchange, state::PARAM_EXCHANGE) => Ok(ControlState::CreateStreams),
            (ControlState::ParamExchange, state::ACCESS_DENIED) => Err(Error::AccessDenied),
            (ControlState::ParamExchange, state::SERVER_ERROR) => Err(Error::ServerError),
            (ControlState::CreateStreams, state::CREATE_STREAMS) => Ok(ControlState::TestStart),
            (ControlState::TestStart, state::TEST_START) => Ok(ControlState::TestRunning),
            // TEST_RUNNING confirms the running phase; the state advances to
            // TestEnd only when the client reaches its deadline.
            (ControlState::TestRunning, state::TEST_RUNNING) => Ok(ControlState::TestRunning),
            (ControlState::TestEnd, state::EXCHANGE_RESULTS) => Ok(ControlState::ExchangeResults),
            (ControlState::ExchangeResults, state::DISPLAY_RESULTS) => {
                Ok(ControlState::DisplayResults)
            }
            (from, observed) => Err(Error::UnexpectedState {
                observed,
                expected: from.expected_state().unwrap_or(0),
            }),
        }
    }
}

/// Test parameters sent to the server during PARAM_EXCHANGE.
///
/// Field names and presence rules match the iperf3 wire format: `udp` and
/// `reverse` are omitted when falsy, everything else is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestParams {
    pub tcp: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub udp: bool,
    pub omit: u32,
    pub time: u64,
    pub num: u64,
    pub blockcount: u64,
    pub parallel: usize,
    pub len: usize,
    pub pacing_timer: u32,
    pub client_version: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reverse: u8,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

impl TestParams {
    /// Builds the parameter JSON for a configured test.
    pub fn from_config(config: &Iperf3Config) -> Self {
        Self {
            tcp: config.protocol == crate::Protocol::Tcp,
            udp: config.protocol == crate::Protocol::Udp,
            omit: 0,
            time: config.duration.as_secs(),
            num: 0,
            blockcount: 0,
            parallel: config.parallel,
            len: config.block_size(),
            pacing_timer: 1000,
            client_version: CLIENT_VERSION.to_string(),
            reverse: u8::from(config.reverse),
        }
    }
}

/// Generates a session cookie.
///
/// 36 characters drawn independently and uniformly from the base32 alphabet
/// `abcdefghijklmnopqrstuvwxyz234567`, followed by a NUL terminator. The
/// characters come from `rand::thread_rng`, a cryptographically seeded
/// source; the cookie is the only credential tying data streams to their
/// control connection.
pub fn generate_cookie() -> [u8; COOKIE_SIZE] {
    let mut rng = rand::thread_rng();
    let mut cookie = [0u8; COOKIE_SIZE];
    for slot in cookie.iter_mut().take(COOKIE_SIZE - 1) {
        *slot = COOKIE_ALPHABET[rng.gen_range(0..COOKIE_ALPHABET.len())];
    }
    cookie[COOKIE_SIZE - 1] = 0;
    cookie
}

/// Reads one state byte, interpreted as a signed 8-bit integer.
pub async fn read_state<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0] as i8)
}

/// Writes one state byte.
pub async fn write_state<W: AsyncWrite + Unpin>(writer: &mut W, state: i8) -> Result<()> {
    writer.write_all(&[state as u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a JSON value framed with a 4-byte big-endian length prefix.
pub async fn write_framed_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-framed JSON value.
///
/// The length is validated before any buffer is allocated: zero and
/// anything above [`MAX_CONTROL_JSON_LEN`] are protocol errors.
pub async fn read_framed_json<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 || len > MAX_CONTROL_JSON_LEN {
        return Err(Error::Protocol(format!("invalid JSON length: {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}
