//! SABR request body construction.
//!
//! Serializes the session's current state into the protobuf body POSTed on
//! every round-trip: player position, the formats the server has initialized,
//! the segment ranges already consumed (so the server does not re-send them),
//! the opaque blobs the server expects echoed back, and the client identity.

use crate::protobuf::MessageWriter;
use crate::stream::SabrSession;
use crate::ClientConfig;

/// TimeRange ticks per second; all times in this protocol are milliseconds.
const TIMESCALE: u64 = 1000;

pub(crate) fn build_body(
    session: &SabrSession,
    config: &ClientConfig,
    po_token: &[u8],
    ustreamer_config: &[u8],
) -> Vec<u8> {
    let mut w = MessageWriter::new();

    // field 1: client_abr_state
    w.message_field(1, |w| {
        w.varint_field(28, session.player_time_ms as u64);
        w.varint_field(40, 1);
        w.varint_field(46, 1);
        w.varint_field(76, 1);
    });

    // field 2: one FormatId per initialized format
    for format in session.initialized_formats.values() {
        w.message_field(2, |w| {
            write_format_id(w, format.itag, format.lmt, format.xtags.as_deref());
        });
    }

    // field 3: one BufferedRange per (format, consumed range)
    for format in session.initialized_formats.values() {
        for range in &format.consumed_ranges {
            w.message_field(3, |w| {
                w.message_field(1, |w| {
                    write_format_id(w, format.itag, format.lmt, format.xtags.as_deref());
                });
                w.varint_field(2, range.start_time_ms as u64);
                w.varint_field(3, range.duration_ms as u64);
                w.varint_field(4, range.start_sequence_number as u64);
                w.varint_field(5, range.end_sequence_number as u64);
                w.message_field(6, |w| {
                    w.varint_field(1, range.start_time_ms as u64);
                    w.varint_field(2, range.duration_ms as u64);
                    w.varint_field(3, TIMESCALE);
                });
            });
        }
    }

    // field 5: opaque per-video streaming config, passed through verbatim
    if !ustreamer_config.is_empty() {
        w.bytes_field(5, ustreamer_config);
    }

    // field 16: preferred audio format
    w.message_field(16, |w| {
        write_format_id(w, session.preferred_itag, session.preferred_lmt, None);
    });

    // field 19: streamer_context
    w.message_field(19, |w| {
        w.message_field(1, |w| write_client_info(w, config));
        if !po_token.is_empty() {
            w.bytes_field(2, po_token);
        }
        if let Some(cookie) = &session.playback_cookie {
            w.bytes_field(3, cookie);
        }
        for ctx_type in &session.sabr_contexts_to_send {
            if let Some(ctx) = session.sabr_context_updates.get(ctx_type) {
                w.message_field(5, |w| {
                    w.varint_field(1, *ctx_type as u64);
                    w.bytes_field(2, &ctx.value);
                });
            }
        }
        // Send-set entries whose value the server has withdrawn (or never
        // supplied) go out as bare type numbers.
        for ctx_type in &session.sabr_contexts_to_send {
            if !session.sabr_context_updates.contains_key(ctx_type) {
                w.varint_field(6, *ctx_type as u64);
            }
        }
    });

    w.into_bytes()
}

fn write_format_id(w: &mut MessageWriter, itag: i32, lmt: u64, xtags: Option<&str>) {
    w.varint_field(1, itag as u64);
    if lmt > 0 {
        w.varint_field(2, lmt);
    }
    if let Some(xtags) = xtags {
        w.string_field(3, xtags);
    }
}

fn write_client_info(w: &mut MessageWriter, config: &ClientConfig) {
    if let Some(hl) = &config.hl {
        w.string_field(1, hl);
    }
    if let Some(gl) = &config.gl {
        w.string_field(2, gl);
    }
    if let Some(visitor_data) = &config.visitor_data {
        w.string_field(14, visitor_data);
    }
    if let Some(user_agent) = &config.user_agent {
        w.string_field(15, user_agent);
    }
    w.varint_field(16, config.client_name as u64);
    if let Some(client_version) = &config.client_version {
        w.string_field(17, client_version);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
