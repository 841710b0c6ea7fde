//! The [`Request`] value object.
//!
//! A `Request` is the unit everything in the bridge exchanges: an opaque
//! JSON payload tagged with routing metadata. It is immutable once built;
//! responses are new `Request` values created through [`Request::respond`],
//! never mutations of the original.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One protocol message: a request or a response to one.
///
/// Responses are correlated to requests by `session_id` alone; the payload is
/// never inspected by the transport layer. The optional response markers
/// (`ack`, `status_msg`) travel inside the payload object so the wire body
/// keeps its fixed four-key shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    path: String,
    session_id: u64,
    sender: String,
    receiver: Option<String>,
    payload: Value,
}

/// Borrowed view of the four-key wire body of a [`Request`].
///
/// Field order matters: it is the order the bytes appear in on the wire.
#[derive(Debug, Serialize)]
pub struct RequestBody<'a> {
    pub session_id: u64,
    pub sender: &'a str,
    pub receiver: Option<&'a str>,
    pub payload: &'a Value,
}

impl Request {
    /// Create a new request.
    ///
    /// `path` and `sender` must be non-empty and `session_id` non-zero; a
    /// `receiver` of `None` marks broadcast traffic.
    pub fn new(
        path: impl Into<String>,
        session_id: u64,
        sender: impl Into<String>,
        receiver: Option<String>,
        payload: Value,
    ) -> Result<Self> {
        let path = path.into();
        let sender = sender.into();

        if path.is_empty() {
            return Err(Error::EmptyField("path"));
        }
        if session_id == 0 {
            return Err(Error::EmptyField("session_id"));
        }
        if sender.is_empty() {
            return Err(Error::EmptyField("sender"));
        }

        Ok(Self {
            path,
            session_id,
            sender,
            receiver,
            payload,
        })
    }

    /// The hierarchical routing path (used directly as the MQTT topic).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The caller-generated id correlating this exchange.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Identity of the originator.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Identity of the intended recipient, `None` for broadcasts.
    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    /// The opaque payload object.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The `ack` marker, if this is a response carrying one.
    pub fn ack(&self) -> Option<bool> {
        self.payload.get("ack").and_then(Value::as_bool)
    }

    /// The human-readable status detail, if this is a response carrying one.
    pub fn status_msg(&self) -> Option<&str> {
        self.payload.get("status_msg").and_then(Value::as_str)
    }

    /// The four-key wire body.
    pub fn body(&self) -> RequestBody<'_> {
        RequestBody {
            session_id: self.session_id,
            sender: &self.sender,
            receiver: self.receiver.as_deref(),
            payload: &self.payload,
        }
    }

    /// Build a response on the same path: same session id, sender and
    /// receiver swapped, `ack` injected into the payload when given.
    ///
    /// Fails if this request has no receiver to respond as.
    pub fn respond(&self, ack: Option<bool>, payload: Value) -> Result<Request> {
        self.respond_at(&self.path, ack, payload)
    }

    /// Build a response on a different path.
    pub fn respond_at(&self, path: &str, ack: Option<bool>, payload: Value) -> Result<Request> {
        let sender = self
            .receiver
            .clone()
            .ok_or(Error::EmptyField("sender"))?;

        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        if let (Some(ack), Some(map)) = (ack, payload.as_object_mut()) {
            map.insert("ack".to_string(), Value::Bool(ack));
        }

        Request::new(
            path,
            self.session_id,
            sender,
            Some(self.sender.clone()),
            payload,
        )
    }
}

/// Generate a random non-zero session id.
///
/// Kept within 32 bits so embedded peers with narrow integer parsers stay
/// happy.
pub fn random_session_id() -> u64 {
    loop {
        let id = rand::random::<u32>() as u64;
        if id != 0 {
            return id;
        }
    }
}
