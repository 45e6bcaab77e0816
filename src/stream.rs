//! Core SABR streaming implementation.
//!
//! Runs the request/response loop for one fetch: serialize the session state,
//! POST it, feed the framed response through the UMP parser, dispatch each
//! part to its handler, and decide whether the stream is complete. Handlers
//! mutate the session and append audio bytes to the output file; every other
//! format the server initializes is marked discarded and its bytes dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SabrError};
use crate::protobuf::Message;
use crate::request;
use crate::ump::{self, UmpParser, UmpPart};
use crate::{ClientConfig, FetchRequest, FetchResult};

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Hard cap on round-trips per fetch.
const MAX_REQUESTS: u32 = 300;

/// Consecutive requests without audio activity before giving up.
const MAX_STALLED_REQUESTS: u32 = 5;

/// How much of a non-2xx response body to keep for the error message.
const ERROR_BODY_PREVIEW: usize = 500;

const MUSIC_ORIGIN: &str = "https://music.youtube.com";

const WEB_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// End sequence number of the "fully buffered" range fed to discarded
/// formats; also the cutoff separating real ranges from the sentinel.
const SENTINEL_END_SEQUENCE: i64 = i32::MAX as i64;
const SENTINEL_DURATION_MS: i64 = i64::MAX / 2;

/// SABR_CONTEXT_UPDATE write policy: keep the existing value.
const WRITE_POLICY_KEEP_EXISTING: u64 = 2;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// A contiguous run of consumed segments for one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConsumedRange {
    pub start_sequence_number: i64,
    /// Inclusive.
    pub end_sequence_number: i64,
    pub start_time_ms: i64,
    pub duration_ms: i64,
}

/// Server's initialization descriptor for one format, keyed by stringified
/// itag in the session map.
#[derive(Debug)]
pub(crate) struct InitializedFormat {
    pub itag: i32,
    pub lmt: u64,
    pub xtags: Option<String>,
    /// True for every non-audio format; its media bytes are dropped.
    pub discard: bool,
    pub end_time_ms: i64,
    pub total_segments: i64,
    pub mime_type: Option<String>,
    pub init_segment_received: bool,
    pub consumed_ranges: Vec<ConsumedRange>,
}

/// In-flight segment, keyed by the server-assigned header id. Lives only for
/// the duration of one request.
#[derive(Debug)]
struct PartialSegment {
    format_key: String,
    is_init_segment: bool,
    sequence_number: i64,
    start_ms: i64,
    duration_ms: i64,
    discard: bool,
    received_bytes: u64,
}

/// Server-pushed opaque blob the client echoes back while told to.
#[derive(Debug)]
pub(crate) struct SabrContext {
    pub value: Bytes,
    pub send_by_default: bool,
    pub write_policy: u64,
}

/// Per-fetch root state.
pub(crate) struct SabrSession {
    /// Mutable: SABR_REDIRECT replaces it.
    pub url: String,
    pub preferred_itag: i32,
    pub preferred_lmt: u64,
    pub request_number: u32,
    /// Monotonically non-decreasing virtual playhead.
    pub player_time_ms: i64,
    pub playback_cookie: Option<Bytes>,
    pub sabr_context_updates: BTreeMap<i32, SabrContext>,
    pub sabr_contexts_to_send: BTreeSet<i32>,
    pub initialized_formats: BTreeMap<String, InitializedFormat>,
    partial_segments: HashMap<u32, PartialSegment>,
    /// Key of the first audio format the server initializes, frozen after.
    pub audio_format_key: Option<String>,
    stream_complete: bool,
    /// True iff at least one non-discarded MEDIA_END arrived this request.
    activity_in_request: bool,
    stalled_requests: u32,
    /// Server-requested delay before the next request (NEXT_REQUEST_POLICY).
    backoff_time_ms: u64,
}

impl SabrSession {
    pub(crate) fn new(url: String, preferred_itag: i32, preferred_lmt: u64) -> Self {
        Self {
            url,
            preferred_itag,
            preferred_lmt,
            request_number: 0,
            player_time_ms: 0,
            playback_cookie: None,
            sabr_context_updates: BTreeMap::new(),
            sabr_contexts_to_send: BTreeSet::new(),
            initialized_formats: BTreeMap::new(),
            partial_segments: HashMap::new(),
            audio_format_key: None,
            stream_complete: false,
            activity_in_request: false,
            stalled_requests: 0,
            backoff_time_ms: 0,
        }
    }

    fn audio_format(&self) -> Option<&InitializedFormat> {
        self.initialized_formats.get(self.audio_format_key.as_ref()?)
    }

    /// Decide whether the audio stream has been fully delivered. Sentinel
    /// ranges (the discard trick) never count.
    fn check_stream_complete(&mut self) {
        let Some(format) = self.audio_format() else {
            return;
        };

        let max_end = format
            .consumed_ranges
            .iter()
            .filter(|r| r.end_sequence_number < SENTINEL_END_SEQUENCE)
            .map(|r| r.end_sequence_number)
            .max();

        if format.total_segments > 0 {
            if let Some(max_end) = max_end {
                if max_end >= format.total_segments {
                    tracing::info!(
                        "[sabr] all audio segments received ({max_end}/{})",
                        format.total_segments
                    );
                    self.stream_complete = true;
                    return;
                }
            }
        }

        if format.end_time_ms > 0 && self.player_time_ms >= format.end_time_ms {
            tracing::info!(
                "[sabr] audio complete by time ({}ms/{}ms)",
                self.player_time_ms,
                format.end_time_ms
            );
            self.stream_complete = true;
        }
    }

    /// Move the virtual playhead past what has been consumed, so the next
    /// request asks for the following segments. Never moves backwards.
    fn advance_player_time(&mut self) {
        let Some(format) = self.audio_format() else {
            return;
        };

        let t = self.player_time_ms;
        let mut covering_end = None;
        let mut max_end = None;
        for range in format
            .consumed_ranges
            .iter()
            .filter(|r| r.end_sequence_number < SENTINEL_END_SEQUENCE)
        {
            let end = range.start_time_ms + range.duration_ms;
            if range.start_time_ms <= t && t < end {
                covering_end = Some(end);
            }
            max_end = Some(max_end.map_or(end, |m: i64| m.max(end)));
        }

        if let Some(next) = covering_end.or(max_end) {
            if next > self.player_time_ms {
                self.player_time_ms = next;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UMP part handlers
// ---------------------------------------------------------------------------

fn handle_format_init_metadata(session: &mut SabrSession, data: &Bytes) {
    let meta = Message::parse(data.clone());
    let Some(format_id) = meta.first_message(2) else {
        tracing::debug!("[sabr] format init without format id, ignoring");
        return;
    };
    let Some(itag) = format_id.first_varint(1) else {
        tracing::debug!("[sabr] format init without itag, ignoring");
        return;
    };

    let itag = itag as i32;
    let format_key = itag.to_string();
    if session.initialized_formats.contains_key(&format_key) {
        return;
    }

    let mime_type = meta.first_string(5);
    let discard = !mime_type
        .as_deref()
        .is_some_and(|m| m.starts_with("audio/"));

    let mut format = InitializedFormat {
        itag,
        lmt: format_id.first_varint(2).unwrap_or(0),
        xtags: format_id.first_string(3),
        discard,
        end_time_ms: meta.first_varint(3).unwrap_or(0) as i64,
        total_segments: meta.first_varint(4).unwrap_or(0) as i64,
        mime_type,
        init_segment_received: false,
        consumed_ranges: Vec::new(),
    };

    if discard {
        // Report the format as fully buffered so the server stops sending it.
        format.consumed_ranges.push(ConsumedRange {
            start_sequence_number: 0,
            end_sequence_number: SENTINEL_END_SEQUENCE,
            start_time_ms: 0,
            duration_ms: SENTINEL_DURATION_MS,
        });
    } else if session.audio_format_key.is_none() {
        session.audio_format_key = Some(format_key.clone());
    }

    tracing::info!(
        "[sabr] format init: itag={itag}, mime={:?}, discard={discard}, total_segments={}, end_ms={}",
        format.mime_type,
        format.total_segments,
        format.end_time_ms,
    );

    session.initialized_formats.insert(format_key, format);
}

fn handle_media_header(session: &mut SabrSession, data: &Bytes) {
    let header = Message::parse(data.clone());
    let Some(header_id) = header.first_varint(1) else {
        return;
    };
    let itag = header
        .first_message(13)
        .and_then(|f| f.first_varint(1))
        .or_else(|| header.first_varint(3));
    let Some(itag) = itag else {
        tracing::debug!("[sabr] media header {header_id} without format id, ignoring");
        return;
    };

    let format_key = (itag as i32).to_string();
    // An uninitialized format still gets a partial segment so its MEDIA parts
    // resolve, just with the bytes dropped.
    let discard = session
        .initialized_formats
        .get(&format_key)
        .map_or(true, |f| f.discard);

    let segment = PartialSegment {
        format_key,
        is_init_segment: header.first_bool(8).unwrap_or(false),
        sequence_number: header.first_varint(9).unwrap_or(0) as i64,
        start_ms: header.first_varint(11).unwrap_or(0) as i64,
        duration_ms: header.first_varint(12).unwrap_or(0) as i64,
        discard,
        received_bytes: 0,
    };

    tracing::debug!(
        "[sabr] media header: id={header_id}, itag={itag}, init={}, seq={}, start={}ms, dur={}ms, discard={}",
        segment.is_init_segment,
        segment.sequence_number,
        segment.start_ms,
        segment.duration_ms,
        segment.discard,
    );

    session.partial_segments.insert(header_id as u32, segment);
}

/// Returns the audio payload to append to the output, if any.
fn handle_media(session: &mut SabrSession, data: &Bytes) -> Option<Bytes> {
    let (header_id, consumed) = ump::read_varint(data)?;
    let payload = data.slice(consumed..);

    let segment = session.partial_segments.get_mut(&header_id)?;
    segment.received_bytes += payload.len() as u64;

    if segment.discard || payload.is_empty() {
        return None;
    }
    Some(payload)
}

fn handle_media_end(session: &mut SabrSession, data: &Bytes) {
    let Some((header_id, _)) = ump::read_varint(data) else {
        return;
    };
    let Some(segment) = session.partial_segments.remove(&header_id) else {
        return;
    };
    if segment.discard {
        return;
    }

    session.activity_in_request = true;

    let Some(format) = session.initialized_formats.get_mut(&segment.format_key) else {
        return;
    };

    if segment.is_init_segment {
        format.init_segment_received = true;
        return;
    }

    let seq = segment.sequence_number;
    if let Some(range) = format
        .consumed_ranges
        .iter_mut()
        .find(|r| r.end_sequence_number + 1 == seq)
    {
        range.end_sequence_number = seq;
        range.duration_ms = (segment.start_ms - range.start_time_ms) + segment.duration_ms;
    } else {
        format.consumed_ranges.push(ConsumedRange {
            start_sequence_number: seq,
            end_sequence_number: seq,
            start_time_ms: segment.start_ms,
            duration_ms: segment.duration_ms,
        });
    }

    tracing::debug!(
        "[sabr] segment {seq} done ({}ms+{}ms, {} bytes)",
        segment.start_ms,
        segment.duration_ms,
        segment.received_bytes,
    );
}

fn handle_next_request_policy(session: &mut SabrSession, data: &Bytes) {
    let policy = Message::parse(data.clone());
    session.backoff_time_ms = policy.first_varint(4).unwrap_or(0);
    if let Some(cookie) = policy.first_bytes(7) {
        session.playback_cookie = Some(cookie.clone());
    }
    tracing::debug!(
        "[sabr] next request policy: backoff={}ms, cookie={}",
        session.backoff_time_ms,
        session.playback_cookie.is_some(),
    );
}

fn handle_sabr_redirect(session: &mut SabrSession, data: &Bytes) {
    if let Some(url) = Message::parse(data.clone()).first_string(1) {
        tracing::info!("[sabr] redirect to new streaming URL");
        session.url = url;
    }
}

fn handle_sabr_error(data: &Bytes) -> SabrError {
    let err = Message::parse(data.clone());
    SabrError::Server {
        error_type: err.first_string(1).unwrap_or_else(|| "unknown".to_owned()),
        action: err.first_varint(2).unwrap_or(0) as i64,
        status_code: err
            .first_message(3)
            .and_then(|m| m.first_varint(1))
            .unwrap_or(0) as i64,
    }
}

fn handle_context_update(session: &mut SabrSession, data: &Bytes) {
    let update = Message::parse(data.clone());
    let ctx_type = update.first_varint(1).unwrap_or(0) as i32;
    let write_policy = update.first_varint(5).unwrap_or(0);

    if write_policy == WRITE_POLICY_KEEP_EXISTING
        && session.sabr_context_updates.contains_key(&ctx_type)
    {
        tracing::debug!("[sabr] context update type={ctx_type} kept existing value");
        return;
    }

    let send_by_default = update.first_bool(4).unwrap_or(false);
    session.sabr_context_updates.insert(
        ctx_type,
        SabrContext {
            value: update.first_bytes(3).cloned().unwrap_or_else(Bytes::new),
            send_by_default,
            write_policy,
        },
    );
    if send_by_default {
        session.sabr_contexts_to_send.insert(ctx_type);
    }
    tracing::debug!("[sabr] context update: type={ctx_type}, send={send_by_default}");
}

fn handle_context_sending_policy(session: &mut SabrSession, data: &Bytes) {
    let policy = Message::parse(data.clone());
    for t in policy.all_varints(1) {
        session.sabr_contexts_to_send.insert(t as i32);
    }
    for t in policy.all_varints(2) {
        session.sabr_contexts_to_send.remove(&(t as i32));
    }
    // Withdrawn values stay in the send-set and go out as "unsent" types
    // until the server re-supplies them.
    for t in policy.all_varints(3) {
        session.sabr_context_updates.remove(&(t as i32));
    }
}

fn handle_stream_protection(data: &Bytes) -> Result<()> {
    let status = Message::parse(data.clone()).first_varint(1).unwrap_or(0);
    match status {
        1 => tracing::debug!("[sabr] stream protection: ok"),
        2 => tracing::warn!("[sabr] stream protection: attestation pending"),
        3 => return Err(SabrError::AttestationRequired),
        n => tracing::debug!("[sabr] stream protection: status={n}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Part dispatch
// ---------------------------------------------------------------------------

async fn dispatch_part(
    session: &mut SabrSession,
    part: UmpPart,
    output: &mut fs::File,
    bytes_written: &mut u64,
) -> Result<()> {
    match part.part_type {
        ump::MEDIA_HEADER => handle_media_header(session, &part.data),
        ump::MEDIA => {
            if let Some(audio) = handle_media(session, &part.data) {
                output.write_all(&audio).await?;
                *bytes_written += audio.len() as u64;
            }
        }
        ump::MEDIA_END => handle_media_end(session, &part.data),
        ump::LIVE_METADATA => {
            tracing::debug!("[sabr] live metadata ignored ({} bytes)", part.data.len());
        }
        ump::NEXT_REQUEST_POLICY => handle_next_request_policy(session, &part.data),
        ump::FORMAT_INITIALIZATION_METADATA => handle_format_init_metadata(session, &part.data),
        ump::SABR_REDIRECT => handle_sabr_redirect(session, &part.data),
        ump::SABR_ERROR => return Err(handle_sabr_error(&part.data)),
        ump::SABR_CONTEXT_UPDATE => handle_context_update(session, &part.data),
        ump::STREAM_PROTECTION_STATUS => handle_stream_protection(&part.data)?,
        ump::SABR_CONTEXT_SENDING_POLICY => handle_context_sending_policy(session, &part.data),
        other => {
            tracing::debug!(
                "[sabr] unhandled UMP part type={other} ({} bytes)",
                part.data.len()
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Single request/response cycle
// ---------------------------------------------------------------------------

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn request_cycle(
    http: &reqwest::Client,
    config: &ClientConfig,
    session: &mut SabrSession,
    po_token: &[u8],
    ustreamer_config: &[u8],
    output: &mut fs::File,
    bytes_written: &mut u64,
) -> Result<()> {
    let body = request::build_body(session, config, po_token, ustreamer_config);

    let url = if session.url.contains('?') {
        format!("{}&rn={}", session.url, session.request_number)
    } else {
        format!("{}?rn={}", session.url, session.request_number)
    };

    tracing::info!(
        "[sabr] request #{} ({} bytes), player_time={}ms",
        session.request_number,
        body.len(),
        session.player_time_ms,
    );

    let mut req = http
        .post(&url)
        .header("Content-Type", "application/x-protobuf")
        .header("Accept", "application/vnd.yt-ump")
        .header("Accept-Encoding", "identity")
        .header(
            "User-Agent",
            config.user_agent.as_deref().unwrap_or(WEB_USER_AGENT),
        )
        .header("Origin", MUSIC_ORIGIN)
        .header("Referer", format!("{MUSIC_ORIGIN}/"));

    if let Some(cookie) = &config.cookie {
        req = req.header("Cookie", cookie);
    }

    let resp = req.body(body).send().await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SabrError::HttpStatus {
            status,
            body: truncate_utf8(&body, ERROR_BODY_PREVIEW).to_owned(),
        });
    }

    let mut parser = UmpParser::new();
    let mut chunks = resp.bytes_stream();
    let mut body_bytes: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        body_bytes += chunk.len() as u64;
        parser.push(&chunk);

        while let Some(part) = parser.next_part() {
            dispatch_part(session, part, output, bytes_written).await?;
        }
    }
    parser.finish()?;

    if body_bytes == 0 {
        return Err(SabrError::Protocol("empty response body".to_owned()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch driver
// ---------------------------------------------------------------------------

async fn drive(
    http: &reqwest::Client,
    config: &ClientConfig,
    session: &mut SabrSession,
    po_token: &[u8],
    ustreamer_config: &[u8],
    output: &mut fs::File,
    bytes_written: &mut u64,
) -> Result<()> {
    loop {
        if session.stream_complete {
            break;
        }
        if session.request_number >= MAX_REQUESTS {
            tracing::warn!("[sabr] request cap reached ({MAX_REQUESTS}), stopping");
            break;
        }

        session.request_number += 1;
        session.activity_in_request = false;
        session.partial_segments.clear();

        request_cycle(
            http,
            config,
            session,
            po_token,
            ustreamer_config,
            output,
            bytes_written,
        )
        .await?;

        if session.activity_in_request {
            session.stalled_requests = 0;
        } else {
            session.stalled_requests += 1;
            if session.stalled_requests >= MAX_STALLED_REQUESTS {
                tracing::warn!(
                    "[sabr] no audio activity for {} consecutive requests, giving up",
                    session.stalled_requests,
                );
                break;
            }
        }

        session.check_stream_complete();
        if !session.stream_complete {
            session.advance_player_time();

            if session.backoff_time_ms > 0 {
                tracing::debug!("[sabr] backing off {}ms", session.backoff_time_ms);
                tokio::time::sleep(Duration::from_millis(session.backoff_time_ms)).await;
            }
        }
    }
    Ok(())
}

/// Run one complete fetch: request loop, output-file lifecycle, cleanup.
pub(crate) async fn run_fetch(
    http: &reqwest::Client,
    config: &ClientConfig,
    fetch: &FetchRequest,
    po_token: &[u8],
    ustreamer_config: &[u8],
) -> Result<FetchResult> {
    let mut session = SabrSession::new(fetch.streaming_url.clone(), fetch.itag, fetch.lmt);
    let mut output = fs::File::create(&fetch.output_file).await?;
    let mut bytes_written: u64 = 0;

    let outcome = drive(
        http,
        config,
        &mut session,
        po_token,
        ustreamer_config,
        &mut output,
        &mut bytes_written,
    )
    .await;

    let flushed = output.flush().await;
    drop(output);

    match outcome {
        Ok(()) if bytes_written > 0 => {
            flushed?;
            tracing::info!(
                "[sabr] fetch complete: {bytes_written} bytes in {} requests -> {}",
                session.request_number,
                fetch.output_file.display(),
            );
            Ok(FetchResult {
                bytes_written,
                output_file: fetch.output_file.clone(),
            })
        }
        Ok(()) => {
            let _ = fs::remove_file(&fetch.output_file).await;
            Err(SabrError::EmptyStream)
        }
        Err(e) => {
            if bytes_written == 0 {
                let _ = fs::remove_file(&fetch.output_file).await;
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::MessageWriter;

    fn session() -> SabrSession {
        SabrSession::new("https://example.test/videoplayback".to_owned(), 251, 0)
    }

    fn payload(build: impl FnOnce(&mut MessageWriter)) -> Bytes {
        let mut w = MessageWriter::new();
        build(&mut w);
        Bytes::from(w.into_bytes())
    }

    fn init_audio(session: &mut SabrSession, itag: u64, total_segments: u64, end_time_ms: u64) {
        let data = payload(|w| {
            w.message_field(2, |w| w.varint_field(1, itag));
            if end_time_ms > 0 {
                w.varint_field(3, end_time_ms);
            }
            if total_segments > 0 {
                w.varint_field(4, total_segments);
            }
            w.string_field(5, "audio/webm; codecs=\"opus\"");
        });
        handle_format_init_metadata(session, &data);
    }

    fn init_video(session: &mut SabrSession, itag: u64) {
        let data = payload(|w| {
            w.message_field(2, |w| w.varint_field(1, itag));
            w.string_field(5, "video/mp4");
        });
        handle_format_init_metadata(session, &data);
    }

    fn media_header(session: &mut SabrSession, header_id: u64, itag: u64, seq: u64, start_ms: u64, duration_ms: u64) {
        let data = payload(|w| {
            w.varint_field(1, header_id);
            w.varint_field(3, itag);
            w.varint_field(9, seq);
            w.varint_field(11, start_ms);
            w.varint_field(12, duration_ms);
        });
        handle_media_header(session, &data);
    }

    fn media(session: &mut SabrSession, header_id: u32, bytes: &[u8]) -> Option<Bytes> {
        let mut data = Vec::new();
        ump::write_varint(&mut data, header_id);
        data.extend_from_slice(bytes);
        handle_media(session, &Bytes::from(data))
    }

    fn media_end(session: &mut SabrSession, header_id: u32) {
        let mut data = Vec::new();
        ump::write_varint(&mut data, header_id);
        handle_media_end(session, &Bytes::from(data));
    }

    // -- format initialization -----------------------------------------------

    #[test]
    fn audio_format_registers_and_freezes_key() {
        let mut s = session();
        init_audio(&mut s, 251, 10, 100_000);
        assert_eq!(s.audio_format_key.as_deref(), Some("251"));

        let fmt = &s.initialized_formats["251"];
        assert!(!fmt.discard);
        assert_eq!(fmt.total_segments, 10);
        assert_eq!(fmt.end_time_ms, 100_000);
        assert!(fmt.consumed_ranges.is_empty());

        // A second audio format never takes over the key.
        init_audio(&mut s, 140, 0, 0);
        assert_eq!(s.audio_format_key.as_deref(), Some("251"));
    }

    #[test]
    fn video_format_seeds_sentinel_range() {
        let mut s = session();
        init_video(&mut s, 137);
        assert_eq!(s.audio_format_key, None);

        let fmt = &s.initialized_formats["137"];
        assert!(fmt.discard);
        assert_eq!(fmt.consumed_ranges.len(), 1);
        let sentinel = &fmt.consumed_ranges[0];
        assert_eq!(sentinel.start_sequence_number, 0);
        assert_eq!(sentinel.end_sequence_number, i32::MAX as i64);
        assert_eq!(sentinel.duration_ms, i64::MAX / 2);
    }

    #[test]
    fn duplicate_format_init_ignored() {
        let mut s = session();
        init_audio(&mut s, 251, 3, 0);
        let data = payload(|w| {
            w.message_field(2, |w| w.varint_field(1, 251));
            w.varint_field(4, 99);
            w.string_field(5, "audio/webm");
        });
        handle_format_init_metadata(&mut s, &data);
        assert_eq!(s.initialized_formats["251"].total_segments, 3);
    }

    #[test]
    fn format_init_without_format_id_ignored() {
        let mut s = session();
        let data = payload(|w| w.string_field(5, "audio/webm"));
        handle_format_init_metadata(&mut s, &data);
        assert!(s.initialized_formats.is_empty());
    }

    // -- media flow ----------------------------------------------------------

    #[test]
    fn media_flow_appends_consumed_range() {
        let mut s = session();
        init_audio(&mut s, 251, 3, 0);

        media_header(&mut s, 0, 251, 1, 0, 10_000);
        let audio = media(&mut s, 0, b"AAAA").expect("audio bytes");
        assert_eq!(&audio[..], b"AAAA");
        media_end(&mut s, 0);

        assert!(s.activity_in_request);
        let ranges = &s.initialized_formats["251"].consumed_ranges;
        assert_eq!(
            ranges,
            &vec![ConsumedRange {
                start_sequence_number: 1,
                end_sequence_number: 1,
                start_time_ms: 0,
                duration_ms: 10_000,
            }]
        );
    }

    #[test]
    fn adjacent_segment_extends_range() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);

        media_header(&mut s, 0, 251, 1, 0, 10_000);
        media(&mut s, 0, b"AAAA");
        media_end(&mut s, 0);
        media_header(&mut s, 1, 251, 2, 10_000, 9_500);
        media(&mut s, 1, b"BBBB");
        media_end(&mut s, 1);

        let ranges = &s.initialized_formats["251"].consumed_ranges;
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_sequence_number, 1);
        assert_eq!(ranges[0].end_sequence_number, 2);
        assert_eq!(ranges[0].duration_ms, 19_500);
    }

    #[test]
    fn non_adjacent_segment_opens_new_range() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);

        media_header(&mut s, 0, 251, 1, 0, 10_000);
        media_end(&mut s, 0);
        media_header(&mut s, 1, 251, 5, 40_000, 10_000);
        media_end(&mut s, 1);

        let ranges = &s.initialized_formats["251"].consumed_ranges;
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].start_sequence_number, 5);
        assert_eq!(ranges[1].end_sequence_number, 5);
    }

    #[test]
    fn init_segment_marks_format_not_ranges() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);

        let data = payload(|w| {
            w.varint_field(1, 0);
            w.varint_field(3, 251);
            w.varint_field(8, 1); // init segment
        });
        handle_media_header(&mut s, &data);
        media(&mut s, 0, b"moov");
        media_end(&mut s, 0);

        let fmt = &s.initialized_formats["251"];
        assert!(fmt.init_segment_received);
        assert!(fmt.consumed_ranges.is_empty());
        assert!(s.activity_in_request);
    }

    #[test]
    fn uninitialized_format_media_is_discarded() {
        let mut s = session();
        media_header(&mut s, 0, 999, 1, 0, 5_000);
        assert!(media(&mut s, 0, b"junk").is_none());
        // Bytes still counted on the partial segment.
        assert_eq!(s.partial_segments[&0].received_bytes, 4);
        media_end(&mut s, 0);
        assert!(!s.activity_in_request);
    }

    #[test]
    fn discarded_video_media_is_dropped() {
        let mut s = session();
        init_video(&mut s, 137);
        media_header(&mut s, 0, 137, 1, 0, 5_000);
        assert!(media(&mut s, 0, b"vid").is_none());
        media_end(&mut s, 0);
        assert!(!s.activity_in_request);
    }

    #[test]
    fn media_with_unknown_header_id_ignored() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);
        assert!(media(&mut s, 42, b"data").is_none());
    }

    #[test]
    fn media_with_empty_payload_ignored() {
        let mut s = session();
        assert!(handle_media(&mut s, &Bytes::new()).is_none());
    }

    // -- policy parts --------------------------------------------------------

    #[test]
    fn next_request_policy_stores_cookie_and_backoff() {
        let mut s = session();
        let data = payload(|w| {
            w.varint_field(4, 250);
            w.bytes_field(7, &[1, 2, 3]);
        });
        handle_next_request_policy(&mut s, &data);
        assert_eq!(s.backoff_time_ms, 250);
        assert_eq!(s.playback_cookie.as_deref(), Some(&[1u8, 2, 3][..]));

        // Cookie persists until replaced.
        let data = payload(|w| w.varint_field(4, 0));
        handle_next_request_policy(&mut s, &data);
        assert_eq!(s.playback_cookie.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn redirect_replaces_url() {
        let mut s = session();
        let data = payload(|w| w.string_field(1, "https://other.test/vp"));
        handle_sabr_redirect(&mut s, &data);
        assert_eq!(s.url, "https://other.test/vp");

        // Repeated redirects simply replace again.
        let data = payload(|w| w.string_field(1, "https://third.test/vp"));
        handle_sabr_redirect(&mut s, &data);
        assert_eq!(s.url, "https://third.test/vp");
    }

    #[test]
    fn sabr_error_decodes_fields() {
        let data = payload(|w| {
            w.string_field(1, "FORBIDDEN");
            w.varint_field(2, 4);
            w.message_field(3, |w| w.varint_field(1, 403));
        });
        match handle_sabr_error(&data) {
            SabrError::Server {
                error_type,
                action,
                status_code,
            } => {
                assert_eq!(error_type, "FORBIDDEN");
                assert_eq!(action, 4);
                assert_eq!(status_code, 403);
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn stream_protection_codes() {
        let ok = payload(|w| w.varint_field(1, 1));
        assert!(handle_stream_protection(&ok).is_ok());

        let pending = payload(|w| w.varint_field(1, 2));
        assert!(handle_stream_protection(&pending).is_ok());

        let required = payload(|w| w.varint_field(1, 3));
        match handle_stream_protection(&required) {
            Err(SabrError::AttestationRequired) => {}
            other => panic!("expected attestation error, got {other:?}"),
        }
    }

    // -- contexts ------------------------------------------------------------

    fn context_update(ctx_type: u64, value: &'static [u8], send: bool, policy: u64) -> Bytes {
        payload(move |w| {
            w.varint_field(1, ctx_type);
            w.bytes_field(3, value);
            w.varint_field(4, send as u64);
            w.varint_field(5, policy);
        })
    }

    #[test]
    fn context_keep_first_write_policy() {
        let mut s = session();
        handle_context_update(&mut s, &context_update(3, b"first", true, 2));
        handle_context_update(&mut s, &context_update(3, b"second", false, 2));

        assert_eq!(&s.sabr_context_updates[&3].value[..], b"first");
        assert!(s.sabr_contexts_to_send.contains(&3));
    }

    #[test]
    fn context_keep_first_ignores_second_send_flag() {
        let mut s = session();
        handle_context_update(&mut s, &context_update(3, b"first", false, 2));
        handle_context_update(&mut s, &context_update(3, b"second", true, 2));

        assert_eq!(&s.sabr_context_updates[&3].value[..], b"first");
        assert!(!s.sabr_contexts_to_send.contains(&3));
    }

    #[test]
    fn context_overwrite_policy_replaces() {
        let mut s = session();
        handle_context_update(&mut s, &context_update(3, b"first", true, 0));
        handle_context_update(&mut s, &context_update(3, b"second", false, 0));
        assert_eq!(&s.sabr_context_updates[&3].value[..], b"second");
    }

    #[test]
    fn sending_policy_discard_leaves_send_set() {
        let mut s = session();
        handle_context_update(&mut s, &context_update(3, b"blob", true, 0));

        let data = payload(|w| {
            w.varint_field(1, 8); // start sending 8
            w.varint_field(2, 99); // stop 99 (not present, no-op)
            w.varint_field(3, 3); // drop the stored value for 3
        });
        handle_context_sending_policy(&mut s, &data);

        assert!(s.sabr_contexts_to_send.contains(&8));
        assert!(s.sabr_contexts_to_send.contains(&3));
        assert!(!s.sabr_context_updates.contains_key(&3));
    }

    // -- completion and player time ------------------------------------------

    #[test]
    fn complete_by_total_segments() {
        let mut s = session();
        init_audio(&mut s, 251, 3, 0);
        for (id, seq) in [(0u32, 1u64), (1, 2), (2, 3)] {
            media_header(&mut s, id as u64, 251, seq, (seq - 1) * 10_000, 10_000);
            media_end(&mut s, id);
        }
        s.check_stream_complete();
        assert!(s.stream_complete);
    }

    #[test]
    fn sentinel_never_completes_stream() {
        let mut s = session();
        // Only a discarded video format: no audio, nothing to complete.
        init_video(&mut s, 137);
        s.check_stream_complete();
        assert!(!s.stream_complete);
    }

    #[test]
    fn complete_by_end_time() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 30_000);

        media_header(&mut s, 0, 251, 1, 0, 30_000);
        media_end(&mut s, 0);

        s.check_stream_complete();
        assert!(!s.stream_complete);

        s.advance_player_time();
        assert_eq!(s.player_time_ms, 30_000);
        s.check_stream_complete();
        assert!(s.stream_complete);
    }

    #[test]
    fn player_time_follows_covering_range() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);

        media_header(&mut s, 0, 251, 1, 0, 10_000);
        media_end(&mut s, 0);
        s.advance_player_time();
        assert_eq!(s.player_time_ms, 10_000);

        media_header(&mut s, 1, 251, 2, 10_000, 10_000);
        media_end(&mut s, 1);
        s.advance_player_time();
        assert_eq!(s.player_time_ms, 20_000);
    }

    #[test]
    fn player_time_jumps_to_max_when_uncovered() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);

        // A range that does not cover t=0 after a gap.
        media_header(&mut s, 0, 251, 5, 40_000, 10_000);
        media_end(&mut s, 0);
        s.advance_player_time();
        assert_eq!(s.player_time_ms, 50_000);
    }

    #[test]
    fn player_time_never_decreases() {
        let mut s = session();
        init_audio(&mut s, 251, 0, 0);
        s.player_time_ms = 60_000;

        media_header(&mut s, 0, 251, 1, 0, 10_000);
        media_end(&mut s, 0);
        s.advance_player_time();
        assert_eq!(s.player_time_ms, 60_000);
    }
}
