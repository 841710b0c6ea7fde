//! Core types for the Homelink smarthome bridge.
//!
//! This crate holds the pieces every other component exchanges:
//!
//! - [`Request`]: the immutable routing envelope carried over every transport
//! - [`Publisher`]/[`Subscriber`]: the fan-out base connectors use to hand
//!   inbound traffic to interested parties
//! - [`paths`]: the well-known protocol path constants shared by all peers
//!
//! Transport implementations live in `homelink-network`; this crate knows
//! nothing about serial ports or brokers.

pub mod error;
pub mod paths;
pub mod pubsub;
pub mod request;

pub use error::{Error, Result};
pub use pubsub::{Publisher, Subscriber};
pub use request::{random_session_id, Request, RequestBody};
