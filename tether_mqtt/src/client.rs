// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Client bootstrap handle.

use tokio::runtime::Handle;

use crate::connection::Connection;

/// Entry point tying connections to a tokio runtime.
///
/// Cheap to clone. The runtime handle is released when the last clone (and
/// every connection created from it) is dropped.
#[derive(Clone)]
pub struct Client {
    runtime: Handle,
}

impl Client {
    /// Create a client bound to the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime; use
    /// [`Client::with_runtime`] from synchronous contexts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runtime: Handle::current(),
        }
    }

    /// Create a client bound to an explicit runtime handle.
    #[must_use]
    pub fn with_runtime(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Create a new, disconnected [`Connection`].
    #[must_use]
    pub fn connection(&self) -> Connection {
        Connection::new(self.runtime.clone())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
