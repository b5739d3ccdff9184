use thiserror::Error;

/// Error types for netgauge measurements.
///
/// The variants follow the failure taxonomy of the service: transport
/// failures, protocol violations on the iperf3 control channel, the two
/// authorization states a server can answer with, and invalid input from the
/// request layer.
///
/// # Examples
///
/// ```
/// use netgauge::Error;
///
/// fn check_host(host: &str) -> Result<(), Error> {
///     if host.is_empty() {
///         return Err(Error::Config("server_host is required".to_string()));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during network operations.
    ///
    /// Wraps `std::io::Error` for socket failures, short reads and timeouts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    ///
    /// Occurs when encoding the parameter JSON or decoding a framed payload
    /// from the control channel.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection-related error.
    ///
    /// Used for dial failures and cookie-send failures; the message carries
    /// the target `host:port`.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol violation on the control channel.
    ///
    /// Covers framing violations such as a zero or oversized JSON length.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server sent a state byte out of sequence.
    ///
    /// Carries the observed byte and the state byte the client was waiting
    /// for; the session transitions to failed.
    #[error("unexpected server state {observed}, expected {expected}")]
    UnexpectedState { observed: i8, expected: i8 },

    /// The server answered with ACCESS_DENIED (-1).
    #[error("server denied access")]
    AccessDenied,

    /// The server answered with SERVER_ERROR (-2).
    #[error("server error")]
    ServerError,

    /// Invalid or incomplete request input.
    ///
    /// The dispatcher reports these to the caller as 400-class errors; all
    /// other variants surface as 500-class measurement failures.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for netgauge operations.
///
/// Most fallible functions in this library return this type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for input errors the request layer maps to a 400 response.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_state_message() {
        let err = Error::UnexpectedState {
            observed: 7,
            expected: 9,
        };
        assert_eq!(err.to_string(), "unexpected server state 7, expected 9");
    }

    #[test]
    fn test_authorization_messages() {
        assert_eq!(Error::AccessDenied.to_string(), "server denied access");
        assert_eq!(Error::ServerError.to_string(), "server error");
    }

    #[test]
    fn test_input_error_classification() {
        assert!(Error::Config("missing host".into()).is_input_error());
        assert!(!Error::AccessDenied.is_input_error());
        assert!(!Error::Protocol("bad length".into()).is_input_error());
    }
}
