//! Transport layer of the Homelink smarthome bridge.
//!
//! Moves [`homelink_core::Request`]s between the bridge and its embedded
//! clients over two interchangeable transports:
//!
//! - [`SerialConnector`]: a line-framed byte stream on an exclusively-owned
//!   serial port
//! - [`MqttConnector`]: topic-based pub/sub through a broker, fed through a
//!   shared [`InboundQueue`]
//!
//! Both implement [`NetworkConnector`]: unicast request/response correlated
//! by session id, and broadcast discovery collecting many responses. Inbound
//! traffic that no pending call claims is handed to the orchestrator through
//! [`dispatch`].
//!
//! This layer treats payloads as opaque JSON. It interprets routing metadata
//! only and persists nothing: unmatched or expired responses are dropped.

pub mod codec;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod mqtt;
pub mod serial;

pub use connector::{
    await_broadcast, await_unicast, NetworkConnector, RequestOutcome, DEFAULT_BROADCAST_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, MAX_POLL_SLICE,
};
pub use dispatch::{spawn_dispatcher, HandlerSubscriber, RequestHandler};
pub use error::{NetworkError, Result};
pub use inbound::{InboundQueue, InboundReceiver, SessionClaim, DEFAULT_QUEUE_CAPACITY};
pub use mqtt::{MqttConfig, MqttConnector};
pub use serial::{SerialConfig, SerialConnector};
