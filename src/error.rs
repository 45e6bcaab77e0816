use std::io;

pub type Result<T> = std::result::Result<T, SabrError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that abort a SABR fetch.
///
/// There is no retry at this layer: every variant is fatal to the current
/// fetch and propagates to the caller, which owns backoff and fallback
/// decisions.
#[derive(Debug)]
pub enum SabrError {
    /// HTTP connect/read/write failure.
    Transport(reqwest::Error),
    /// Non-2xx response from the streaming server. `body` holds at most the
    /// first 500 bytes of the response for diagnosis.
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    /// Malformed wire data: bad UMP framing, truncated payloads, varint
    /// overflow, empty response body.
    Protocol(String),
    /// Server-emitted SABR_ERROR part.
    Server {
        error_type: String,
        action: i64,
        status_code: i64,
    },
    /// The server demands attestation (stream protection status 3). The
    /// poToken is missing or no longer accepted; the caller may mint a new
    /// one and retry the whole fetch.
    AttestationRequired,
    /// The request loop finished without writing a single audio byte.
    /// The output file has been deleted.
    EmptyStream,
    /// Output file I/O failure.
    Io(io::Error),
}

impl std::fmt::Display for SabrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SabrError::Transport(e) => write!(f, "sabr transport: {e}"),
            SabrError::HttpStatus { status, body } => {
                write!(f, "sabr http {status}: {body}")
            }
            SabrError::Protocol(msg) => write!(f, "sabr protocol: {msg}"),
            SabrError::Server {
                error_type,
                action,
                status_code,
            } => write!(
                f,
                "sabr server error: type={error_type}, action={action}, status={status_code}"
            ),
            SabrError::AttestationRequired => {
                write!(f, "sabr attestation required (poToken missing or invalid)")
            }
            SabrError::EmptyStream => write!(f, "sabr stream produced no audio bytes"),
            SabrError::Io(e) => write!(f, "sabr output io: {e}"),
        }
    }
}

impl std::error::Error for SabrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SabrError::Transport(e) => Some(e),
            SabrError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SabrError {
    fn from(e: reqwest::Error) -> Self {
        SabrError::Transport(e)
    }
}

impl From<io::Error> for SabrError {
    fn from(e: io::Error) -> Self {
        SabrError::Io(e)
    }
}
