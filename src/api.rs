//! HTTP request dispatcher.
//!
//! Thin layer over the two measurement cores: validates and defaults the
//! request, invokes the iperf3 client or the TWAMP session transport plus
//! analyzer, and renders the `{status, data, error}` envelope. Input errors
//! are 400s, measurement failures 500s. This is also the only layer holding
//! request-timeout policy.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::analyzer::{analyze, TwampReport};
use crate::client::{Iperf3Client, Iperf3Result};
use crate::clock::{ClockProbe, SystemClockProbe};
use crate::config::{Iperf3Config, TwampConfig};
use crate::twamp::{SessionSpec, SessionTransport, TwampLightTransport};
use crate::{Error, Result};

/// Slack added on top of the nominal test duration before the dispatcher
/// gives up on a measurement.
const REQUEST_GRACE: Duration = Duration::from_secs(30);

/// Shared service dependencies: the clock probe and the TWAMP transport.
///
/// Both are read-only; no state is carried between requests.
pub struct AppState {
    pub clock: Arc<dyn ClockProbe>,
    pub transport: Arc<dyn SessionTransport>,
}

impl AppState {
    /// State wired to the host clock and the bundled TWAMP-light transport.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClockProbe::new()),
            transport: Arc::new(TwampLightTransport::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

/// Request body for `POST /iperf/client/run`.
///
/// Everything except `server_host` is optional; a missing or zero numeric
/// field takes its documented default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Iperf3RunRequest {
    pub server_host: String,
    pub server_port: u16,
    pub duration: u64,
    pub parallel: usize,
    pub protocol: String,
    pub reverse: bool,
    pub bandwidth: u64,
}

impl Iperf3RunRequest {
    /// Validates the request and applies defaults.
    pub fn into_config(self) -> Result<Iperf3Config> {
        if self.server_host.trim().is_empty() {
            return Err(Error::Config("server_host is required".to_string()));
        }

        let protocol = if self.protocol.is_empty() {
            crate::Protocol::Tcp
        } else {
            self.protocol.parse()?
        };

        let mut config = Iperf3Config::new(self.server_host)
            .with_protocol(protocol)
            .with_reverse(self.reverse)
            .with_bandwidth_mbps(self.bandwidth);
        if self.server_port != 0 {
            config = config.with_port(self.server_port);
        }
        if self.duration != 0 {
            config = config.with_duration(Duration::from_secs(self.duration));
        }
        if self.parallel != 0 {
            config = config.with_parallel(self.parallel);
        }
        Ok(config)
    }
}

/// Request body for `POST /twamp/client/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TwampRunRequest {
    pub server_host: String,
    pub server_port: u16,
    pub count: u32,
    pub padding: usize,
}

impl TwampRunRequest {
    /// Validates the request and applies defaults.
    pub fn into_config(self) -> Result<TwampConfig> {
        if self.server_host.trim().is_empty() {
            return Err(Error::Config("server_host is required".to_string()));
        }

        let mut config = TwampConfig::new(self.server_host)
            .with_probe_count(self.count)
            .with_padding(self.padding);
        if self.server_port != 0 {
            config = config.with_port(self.server_port);
        }
        Ok(config)
    }
}

/// Builds the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/iperf/client/run", post(iperf3_run))
        .route("/twamp/client/run", post(twamp_run))
        .route("/health", get(health))
        .route("/", get(api_doc))
        .with_state(state)
}

/// POST /iperf/client/run - run an iperf3 bandwidth test.
pub async fn iperf3_run(
    State(_state): State<Arc<AppState>>,
    payload: std::result::Result<Json<Iperf3RunRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse<Iperf3Result>>) {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return input_error(rejection.to_string()),
    };

    let config = match request.into_config() {
        Ok(config) => config,
        Err(e) => return input_error(e.to_string()),
    };

    info!(
        "iperf3 test: {} ({}, {}s, {} streams, reverse={}, bandwidth={}M)",
        config.target(),
        config.protocol.as_str(),
        config.duration.as_secs(),
        config.parallel,
        config.reverse,
        config.bits_per_second / 1_000_000
    );

    let time_limit = config.duration + REQUEST_GRACE;
    let client = Iperf3Client::new(config);
    match time::timeout(time_limit, client.run()).await {
        Ok(Ok(result)) => (StatusCode::OK, Json(ApiResponse::ok(result))),
        Ok(Err(e)) => failure(e),
        Err(_) => failure(Error::Connection(format!(
            "measurement did not finish within {}s",
            time_limit.as_secs()
        ))),
    }
}

/// POST /twamp/client/run - run a TWAMP probe session and analyze it.
pub async fn twamp_run(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<TwampRunRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse<TwampReport>>) {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return input_error(rejection.to_string()),
    };

    let config = match request.into_config() {
        Ok(config) => config,
        Err(e) => return input_error(e.to_string()),
    };

    info!("TWAMP test: {} ({} probes)", config.target(), config.probe_count);

    // The sender's sync status comes from the local clock probe, queried
    // once per request; the same answer feeds the outgoing Error Estimate.
    let clock = state.clock.query();
    let spec = SessionSpec::new(
        config.probe_count,
        config.padding,
        clock.wire_error_estimate(),
    );

    let time_limit =
        spec.interval * config.probe_count + spec.reply_timeout + REQUEST_GRACE;
    let transport = Arc::clone(&state.transport);
    let target = config.target();
    let session = time::timeout(
        time_limit,
        tokio::task::spawn_blocking(move || transport.execute(&target, &spec)),
    )
    .await;

    let outcome = match session {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => return failure(e),
        Ok(Err(join_error)) => {
            return failure(Error::Connection(format!("session task failed: {join_error}")))
        }
        Err(_) => {
            return failure(Error::Connection(format!(
                "session did not finish within {}s",
                time_limit.as_secs()
            )))
        }
    };

    let report = analyze(&config.host, &outcome, config.probe_count, clock);
    (StatusCode::OK, Json(ApiResponse::ok(report)))
}

/// GET /health - liveness check.
pub async fn health() -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        status: "healthy".to_string(),
        data: None,
        error: None,
    })
}

/// GET / - machine-readable API description.
pub async fn api_doc() -> Json<ApiResponse<serde_json::Value>> {
    let doc = serde_json::json!({
        "name": "netgauge",
        "version": crate::VERSION,
        "description": "Network performance measurement service: native iperf3 client and TWAMP latency analysis",
        "endpoints": [
            {
                "path": "/iperf/client/run",
                "method": "POST",
                "body": {
                    "server_host": "iperf3 server hostname or IP (required)",
                    "server_port": "server port (default 5201)",
                    "duration": "test duration in seconds (default 5)",
                    "parallel": "number of parallel streams (default 1)",
                    "protocol": "TCP or UDP (default TCP)",
                    "reverse": "download instead of upload (default false)",
                    "bandwidth": "bandwidth limit in Mbit/s (default 100)"
                }
            },
            {
                "path": "/twamp/client/run",
                "method": "POST",
                "body": {
                    "server_host": "TWAMP reflector hostname or IP (required)",
                    "server_port": "reflector port (default 862)",
                    "count": "number of probes (default 10)",
                    "padding": "extra bytes per probe packet (default 0)"
                }
            },
            { "path": "/health", "method": "GET" }
        ]
    });
    Json(ApiResponse::ok(doc))
}

fn input_error<T: Serialize>(message: String) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message)))
}

fn failure<T: Serialize>(error: Error) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = if error.is_input_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ApiResponse::error(error.to_string())))
}
