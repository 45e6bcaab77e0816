//! SABR audio streaming client.
//!
//! Fetches a complete audio track from a server speaking the SABR ("server
//! adaptive bitrate") protocol. The server delivers media in many small
//! framed pieces across many HTTP round-trips; this crate maintains the
//! session state (initialized formats, consumed ranges, server contexts,
//! redirects), reassembles the audio format's segments in order and writes
//! them to a file, dropping every other format.
//!
//! The caller supplies the streaming URL and format identifiers it obtained
//! from the outer player response, plus the opaque credentials the server
//! expects echoed back (poToken, ustreamer config). There is no retry here:
//! every error aborts the fetch and propagates.
//!
//! ```no_run
//! use sabr_fetch::{ClientConfig, FetchRequest, SabrClient};
//!
//! # async fn demo() -> sabr_fetch::Result<()> {
//! let client = SabrClient::with_defaults(ClientConfig::default())?;
//! let result = client
//!     .fetch_audio(FetchRequest {
//!         streaming_url: "https://example.org/videoplayback?expire=...".into(),
//!         itag: 251,
//!         lmt: 1_747_754_876_286_051,
//!         duration_ms: 192_000,
//!         po_token: None,
//!         ustreamer_config: Some("CAESAggB".into()),
//!         output_file: "/tmp/track.webm".into(),
//!     })
//!     .await?;
//! println!("wrote {} bytes", result.bytes_written);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

pub mod error;
pub mod protobuf;
mod request;
mod stream;
pub mod ump;

pub use error::{Result, SabrError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Session-global settings provided by the host application.
///
/// Everything here is optional except the client identity number; the
/// defaults produce a plain web-music client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub visitor_data: Option<String>,
    /// Numeric client identity sent in every request. 67 = web music.
    pub client_name: i32,
    pub client_version: Option<String>,
    /// Overrides the built-in web user agent for both the HTTP header and
    /// the client info submessage.
    pub user_agent: Option<String>,
    pub hl: Option<String>,
    pub gl: Option<String>,
    /// Raw cookie header passed through on every streaming request.
    pub cookie: Option<String>,
    /// Proxy URL for [`SabrClient::with_defaults`].
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            visitor_data: None,
            client_name: 67,
            client_version: None,
            user_agent: None,
            hl: None,
            gl: None,
            cookie: None,
            proxy: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch input / output
// ---------------------------------------------------------------------------

/// Inputs for one fetch, as extracted from the outer player response.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Absolute streaming URL (may be replaced mid-fetch by a redirect part).
    pub streaming_url: String,
    pub itag: i32,
    /// Last-modified time of the format; 0 = absent.
    pub lmt: u64,
    /// Track duration, informational only.
    pub duration_ms: i64,
    /// Base64 proof-of-origin token (URL-safe preferred, standard accepted).
    pub po_token: Option<String>,
    /// Base64 opaque per-video streaming config, passed through verbatim.
    pub ustreamer_config: Option<String>,
    pub output_file: PathBuf,
}

/// Successful fetch outcome.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub bytes_written: u64,
    pub output_file: PathBuf,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// SABR protocol client. Cheap to clone the inner `reqwest::Client`; one
/// `SabrClient` can serve many sequential fetches.
pub struct SabrClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl SabrClient {
    /// Wrap an existing HTTP client. The caller owns connection pooling,
    /// timeouts and proxy setup.
    pub fn new(http: reqwest::Client, config: ClientConfig) -> Self {
        Self { http, config }
    }

    /// Build an HTTP client with the protocol timeouts (30 s connect, 60 s
    /// read) and the configured proxy.
    pub fn with_defaults(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    /// Fetch a complete audio track to `output_file`.
    ///
    /// On success the file holds every audio segment in order and the byte
    /// count is returned. On failure the error propagates and, when nothing
    /// was written, the file is removed.
    pub async fn fetch_audio(&self, request: FetchRequest) -> Result<FetchResult> {
        let po_token = match &request.po_token {
            Some(b64) => decode_base64(b64)?,
            None => Vec::new(),
        };
        let ustreamer_config = match &request.ustreamer_config {
            Some(b64) => decode_base64(b64)?,
            None => Vec::new(),
        };

        tracing::info!(
            "[sabr] fetch itag={} lmt={} duration={}ms -> {}",
            request.itag,
            request.lmt,
            request.duration_ms,
            request.output_file.display(),
        );

        stream::run_fetch(
            &self.http,
            &self.config,
            &request,
            &po_token,
            &ustreamer_config,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Base64 inputs
// ---------------------------------------------------------------------------

// The player response hands these out URL-safe without padding, but some
// paths deliver the standard alphabet. Accept both, padding optional.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn decode_base64(input: &str) -> Result<Vec<u8>> {
    URL_SAFE_LENIENT
        .decode(input)
        .or_else(|_| STANDARD_LENIENT.decode(input))
        .map_err(|e| SabrError::Protocol(format!("invalid base64 input: {e}")))
}
