// Copyright (c) Tetherline.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT 3.1.1 client library providing a managed session with automatic
//! reconnection.
//!
//! A [`Connection`](connection::Connection) maintains an MQTT session with a
//! broker across transient disconnections: requests queue while the channel
//! is down, QoS 1/2 publishes are re-sent as duplicates after a reconnect,
//! and subscriptions route inbound publications to per-filter handlers
//! through a wildcard-aware topic tree.

pub use crate::client::Client;
pub use crate::connection_settings::{
    ConnectOptions, ConnectOptionsBuilder, ConnectOptionsBuilderError, TlsOptions,
};
pub use crate::transport::{HttpProxyOptions, WebSocketOptions};

mod client;
mod codec;
pub mod connection;
mod connection_settings;
pub mod control_packet;
pub mod error;
pub mod topic;
pub mod transport;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that
/// the code in the README can compile to verify that it has not rotted.
/// Note that any code that requires network setup cannot run here and is
/// annotated by "no_run" in the README.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
