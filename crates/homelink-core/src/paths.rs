//! Well-known protocol paths.
//!
//! These constants are shared by every transport and every peer on the wire.
//! Changing any of them is a protocol-breaking change: deployed chip firmware
//! has them baked in.

/// Root of the protocol namespace. Every request path starts with this.
pub const PROTOCOL_ROOT: &str = "smarthome";

/// Path broadcast discovery requests are sent to.
pub const BROADCAST_REQUEST_PATH: &str = "smarthome/broadcast/req";

/// Path peers answer broadcasts on.
pub const BROADCAST_RESPONSE_PATH: &str = "smarthome/broadcast/res";

/// MQTT subscription filter covering the whole protocol namespace.
pub const PROTOCOL_TOPIC_FILTER: &str = "smarthome/#";
