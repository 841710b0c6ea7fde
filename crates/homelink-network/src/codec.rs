//! Wire codec for the chip protocol.
//!
//! One serial frame is one newline-terminated line:
//!
//! ```text
//! !r_p[<path>]_b[<json body>]_\n
//! ```
//!
//! The body is a JSON object with exactly four keys: `session_id`, `sender`,
//! `receiver` and `payload`. MQTT traffic carries the body alone; the topic
//! is the path.
//!
//! Deployed chip firmware parses these bytes with a hand-written scanner, so
//! the encoder reproduces the separator style the firmware expects (`", "`
//! between entries, `": "` after keys) instead of serde_json's compact
//! default. The decoder mirrors the firmware's tokenizer: all `_<letter>[..]`
//! groups are collected non-greedily, which means body JSON containing a `]`
//! cannot travel over the serial framing. That is a wire-format limitation
//! shared with the peers, not something this side can lift alone.

use std::io;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use homelink_core::{Error as CoreError, Request};

/// Frame marker every protocol line starts with.
pub const FRAME_PREFIX: &str = "!r_";

/// Lines starting with this signal that the remote client crashed.
pub const REMOTE_FAULT_PREFIX: &str = "Backtrace: 0x";

/// Result of decoding one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A well-formed protocol frame.
    Request(Request),
    /// Not a protocol frame at all (log output, boot chatter). Ignored.
    Noise,
    /// Crash signature from the peer. Distinct from a decode failure: the
    /// line is well understood, it just means the client is gone.
    RemoteFault(String),
}

/// Ways a line that claims to be a frame can fail to decode.
///
/// None of these are fatal: the connector logs them and drops the line.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The same group letter appeared twice in one frame.
    #[error("duplicate key '{0}' in frame")]
    DuplicateKey(char),

    /// A required group letter (`p` or `b`) was absent.
    #[error("missing key '{0}' in frame")]
    MissingKey(char),

    /// The body group did not parse as JSON.
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The body parsed as JSON but a required field was absent or mistyped.
    #[error("missing or invalid body field '{0}'")]
    MissingField(&'static str),

    /// The raw message bytes were not UTF-8.
    #[error("message payload is not valid UTF-8")]
    NotUtf8,
}

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"_([a-z])\[(.+?)\]").expect("token pattern is valid"))
}

/// JSON formatter matching the separator style the chip firmware parses:
/// `", "` between entries and array items, `": "` after object keys.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }
}

/// Serialize the four-key wire body of a request.
///
/// This is the payload published over MQTT and the content of the `b` group
/// on the serial framing. An absent receiver serializes as `null`.
pub fn encode_body(req: &Request) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    req.body()
        .serialize(&mut ser)
        .expect("serializing an in-memory body cannot fail");
    String::from_utf8(buf).expect("serde_json emits UTF-8")
}

/// Encode a request as one complete serial frame, newline terminator
/// included.
pub fn encode_frame(req: &Request) -> String {
    format!("!r_p[{}]_b[{}]_\n", req.path(), encode_body(req))
}

/// Decode one line read from the serial port.
///
/// Trailing line terminators are tolerated. Returns [`Decoded::Noise`] for
/// anything that does not claim to be a frame.
pub fn decode_frame(line: &str) -> Result<Decoded, CodecError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.starts_with(REMOTE_FAULT_PREFIX) {
        return Ok(Decoded::RemoteFault(line.to_string()));
    }
    if !line.starts_with(FRAME_PREFIX) {
        return Ok(Decoded::Noise);
    }

    let mut path: Option<&str> = None;
    let mut body: Option<&str> = None;
    let mut seen: Vec<char> = Vec::new();

    for caps in token_re().captures_iter(line) {
        let letter = caps[1].chars().next().expect("group matched one letter");
        if seen.contains(&letter) {
            return Err(CodecError::DuplicateKey(letter));
        }
        seen.push(letter);
        let content = caps.get(2).expect("content group always present").as_str();
        match letter {
            'p' => path = Some(content),
            'b' => body = Some(content),
            // Unknown letters are collected for the duplicate check but
            // otherwise ignored, as the original peers do.
            _ => {}
        }
    }

    let path = path.ok_or(CodecError::MissingKey('p'))?;
    let body = body.ok_or(CodecError::MissingKey('b'))?;

    let body: Value = serde_json::from_str(body)?;
    request_from_body(path, &body).map(Decoded::Request)
}

/// Decode an MQTT message into a request; the topic is the path.
///
/// Strict JSON is tried first. Old Python peers publish `repr`-style bodies
/// (`'` quotes, `None`), so a strict-parse failure gets one normalized retry
/// before the message is rejected.
pub fn decode_body(topic: &str, payload: &[u8]) -> Result<Request, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::NotUtf8)?;

    let body: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(strict_err) => {
            let normalized = text.replace('\'', "\"").replace("None", "null");
            match serde_json::from_str(&normalized) {
                Ok(v) => {
                    debug!(topic, "accepted legacy-normalized message body");
                    v
                }
                Err(_) => return Err(CodecError::InvalidJson(strict_err)),
            }
        }
    };

    request_from_body(topic, &body)
}

fn request_from_body(path: &str, body: &Value) -> Result<Request, CodecError> {
    let session_id = body
        .get("session_id")
        .and_then(Value::as_u64)
        .ok_or(CodecError::MissingField("session_id"))?;
    let sender = body
        .get("sender")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("sender"))?;
    let receiver = match body.get("receiver") {
        None => return Err(CodecError::MissingField("receiver")),
        Some(Value::Null) => None,
        Some(v) => Some(
            v.as_str()
                .ok_or(CodecError::MissingField("receiver"))?
                .to_string(),
        ),
    };
    let payload = body
        .get("payload")
        .cloned()
        .ok_or(CodecError::MissingField("payload"))?;

    // An empty sender or zero session id in the body is a peer bug; surface
    // it as the matching missing-field condition.
    Request::new(path, session_id, sender, receiver, payload).map_err(|e| match e {
        CoreError::EmptyField(field) => CodecError::MissingField(field),
        _ => CodecError::MissingField("payload"),
    })
}
