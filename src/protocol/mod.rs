/// PostgreSQL wire-protocol primitives consumed by the relay engine.
///
/// Everything here operates on raw frames: a one-byte type tag, a big-endian
/// i32 length covering the length field and payload, and the payload itself.
/// Startup-family messages (startup, SSL request) have no type tag; their
/// first four bytes are the total length and the next four the version code.
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Version code of a regular protocol 3.0 startup message.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Version code a client sends to request an encrypted transport.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Single-byte SSL negotiation responses.
pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';

/// Frame type tags.
pub const AUTHENTICATION_MESSAGE_TYPE: u8 = b'R';
pub const ERROR_MESSAGE_TYPE: u8 = b'E';
pub const QUERY_MESSAGE_TYPE: u8 = b'Q';
pub const TERMINATE_MESSAGE_TYPE: u8 = b'X';
pub const READY_FOR_QUERY_MESSAGE_TYPE: u8 = b'Z';
pub const PASSWORD_MESSAGE_TYPE: u8 = b'p';

/// Authentication request codes carried by 'R' frames.
pub const AUTHENTICATION_OK: i32 = 0;
pub const AUTHENTICATION_CLEARTEXT_PASSWORD: i32 = 3;
pub const AUTHENTICATION_MD5_PASSWORD: i32 = 5;

pub const ERROR_SEVERITY_FATAL: &str = "FATAL";
/// SQLSTATE 28000, invalid authorization specification.
pub const ERROR_CODE_INVALID_AUTHORIZATION: &str = "28000";

/// Read the version code of a startup-family message (bytes 4..8).
/// Returns -1 when the buffer is too short to carry one.
pub fn get_version(message: &[u8]) -> i32 {
    read_i32(message, 4)
}

/// Type tag of a regular frame. Returns 0 on an empty buffer.
pub fn get_message_type(message: &[u8]) -> u8 {
    message.first().copied().unwrap_or(0)
}

/// Length field of a regular frame (bytes 1..5): payload length plus the
/// four length bytes, excluding the type tag. Returns -1 when truncated.
pub fn get_message_length(message: &[u8]) -> i32 {
    read_i32(message, 1)
}

/// Authentication code of an 'R' frame (bytes 5..9). Returns -1 when
/// truncated.
pub fn get_authentication_type(message: &[u8]) -> i32 {
    read_i32(message, 5)
}

/// Whether the frame at the front of the buffer is AuthenticationOk.
pub fn is_authentication_ok(message: &[u8]) -> bool {
    get_message_type(message) == AUTHENTICATION_MESSAGE_TYPE
        && get_authentication_type(message) == AUTHENTICATION_OK
}

fn read_i32(buffer: &[u8], offset: usize) -> i32 {
    match buffer.get(offset..offset + 4) {
        Some(bytes) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => -1,
    }
}

/// One step of the frame scanner: the type tag of the frame starting at
/// `offset` and the offset of the frame after it. `None` when fewer than a
/// full header (tag + length) remains.
pub fn next_frame(buffer: &[u8], offset: usize) -> Option<(u8, usize)> {
    if offset + 5 > buffer.len() {
        return None;
    }
    let tag = buffer[offset];
    let length = get_message_length(&buffer[offset..]);
    if length < 4 {
        return None;
    }
    Some((tag, offset + 1 + length as usize))
}

/// Scan a batch of frames and return the type tag of the last one whose
/// header fits in the buffer. A response drain terminates when this is the
/// ready-for-query tag; a batch merely containing one earlier is not enough.
pub fn last_message_type(buffer: &[u8]) -> Option<u8> {
    let mut last = None;
    let mut offset = 0;
    while let Some((tag, next)) = next_frame(buffer, offset) {
        last = Some(tag);
        offset = next;
    }
    last
}

/// Read/write and block-boundary annotations extracted from a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryAnnotations {
    /// Query opens a multi-statement block.
    pub begin: bool,
    /// Query closes the current block.
    pub end: bool,
    /// Query only reads and may go to a replica.
    pub read_only: bool,
}

/// Extract annotations from the first `/* ... */` comment of a 'Q' frame.
/// Recognized tokens are `start`, `end` and `read`, case-insensitive,
/// separated by whitespace or commas. Anything else in the comment is
/// ignored; this is the full extent of SQL inspection performed.
pub fn query_annotations(message: &[u8]) -> QueryAnnotations {
    let mut annotations = QueryAnnotations::default();

    if get_message_type(message) != QUERY_MESSAGE_TYPE || message.len() <= 5 {
        return annotations;
    }

    let query = String::from_utf8_lossy(&message[5..]);
    let comment = match (query.find("/*"), query.find("*/")) {
        (Some(open), Some(close)) if close > open + 1 => &query[open + 2..close],
        _ => return annotations,
    };

    for token in comment.split(|c: char| c.is_whitespace() || c == ',') {
        if token.eq_ignore_ascii_case("start") {
            annotations.begin = true;
        } else if token.eq_ignore_ascii_case("end") {
            annotations.end = true;
        } else if token.eq_ignore_ascii_case("read") {
            annotations.read_only = true;
        }
    }

    annotations
}

/// Build the 8-byte SSL negotiation request sent ahead of any protocol
/// traffic when dialing a backend with SSL enabled.
pub fn create_ssl_request() -> Bytes {
    let mut message = BytesMut::with_capacity(8);
    message.put_i32(8);
    message.put_i32(SSL_REQUEST_CODE);
    message.freeze()
}

/// Build a startup message carrying the configured user, database and
/// connection options.
pub fn create_startup_message(
    username: &str,
    database: &str,
    options: &HashMap<String, String>,
) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    put_cstr(&mut body, "user");
    put_cstr(&mut body, username);
    put_cstr(&mut body, "database");
    put_cstr(&mut body, database);
    for (key, value) in options {
        put_cstr(&mut body, key);
        put_cstr(&mut body, value);
    }
    body.put_u8(0);

    let mut message = BytesMut::with_capacity(body.len() + 4);
    message.put_i32((body.len() + 4) as i32);
    message.extend_from_slice(&body);
    message.freeze()
}

/// Build a 'p' password response frame.
pub fn create_password_message(password: &str) -> Bytes {
    let mut message = BytesMut::with_capacity(password.len() + 6);
    message.put_u8(PASSWORD_MESSAGE_TYPE);
    message.put_i32((password.len() + 5) as i32);
    put_cstr(&mut message, password);
    message.freeze()
}

/// Build an 'E' error response with severity, SQLSTATE code and message
/// fields.
pub fn create_error_message(severity: &str, code: &str, text: &str) -> Bytes {
    let mut fields = BytesMut::new();
    fields.put_u8(b'S');
    put_cstr(&mut fields, severity);
    fields.put_u8(b'C');
    put_cstr(&mut fields, code);
    fields.put_u8(b'M');
    put_cstr(&mut fields, text);
    fields.put_u8(0);

    let mut message = BytesMut::with_capacity(fields.len() + 5);
    message.put_u8(ERROR_MESSAGE_TYPE);
    message.put_i32((fields.len() + 4) as i32);
    message.extend_from_slice(&fields);
    message.freeze()
}

fn put_cstr(buffer: &mut BytesMut, value: &str) {
    buffer.put_slice(value.as_bytes());
    buffer.put_u8(0);
}
