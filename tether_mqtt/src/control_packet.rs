// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Control packet types shared with the wire codec.

// Re-export codec types so user code does not take the codec dependency.

/// Connect return code delivered by the broker in CONNACK
pub use mqtt::control::variable_header::ConnectReturnCode;
/// Per-filter grant (or failure) delivered by the broker in SUBACK
pub use mqtt::packet::suback::SubscribeReturnCode;
/// MQTT delivery tier: at-most-once / at-least-once / exactly-once
pub use mqtt::QualityOfService as QoS;

use bytes::Bytes;

/// An application message dispatched to publish handlers.
#[derive(Clone, Debug)]
pub struct Publication {
    /// Topic name the message was published to
    pub topic: String,
    /// Message payload
    pub payload: Bytes,
    /// Delivery tier the broker used
    pub qos: QoS,
    /// Whether the broker flagged this as a retained message
    pub retain: bool,
    /// Whether the broker flagged this as a redelivery
    pub dup: bool,
}
