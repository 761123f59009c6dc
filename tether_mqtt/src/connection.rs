// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! The MQTT connection: public operations and the shared state regions
//! behind them.
//!
//! A [`Connection`] is partitioned into three regions with distinct mutation
//! disciplines: the config region (endpoint, credentials, handlers; mutable
//! only while disconnected or connected), the synced region (lifecycle state
//! plus the request registry, behind one mutex shared with caller threads),
//! and the worker region (subscription tree, backoff counters; held
//! exclusively by the single live I/O worker task).

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::connection_settings::{generate_client_id, ConnectOptions};
use crate::control_packet::{ConnectReturnCode, Publication, QoS, SubscribeReturnCode};
use crate::error::{ClientError, ErrorKind};
use crate::topic::{TopicFilter, TopicName};
use crate::transport::{HttpProxyOptions, WebSocketOptions};

use self::reconnect::ReconnectBackoff;
use self::registry::{Completion, RequestKind, RequestRegistry, SubscriptionSpec};
use self::tree::SubscriptionTree;

mod reconnect;
mod registry;
mod state;
mod tree;
mod worker;

pub use self::state::ConnectionState;

/// Identifier correlating a request with its broker acknowledgement.
/// Opaque to callers beyond matching against completion callbacks.
pub type PacketId = u16;

/// Completion callback for operations that yield no data (publish,
/// unsubscribe).
pub type OnOperationComplete = Box<dyn FnOnce(PacketId, Result<(), ClientError>) + Send>;
/// Completion callback for subscribe-style operations, delivering the
/// broker's per-filter grants.
pub type OnSubscribeComplete =
    Box<dyn FnOnce(PacketId, Result<Vec<SubscribeReturnCode>, ClientError>) + Send>;
/// Completion callback for a connect attempt.
pub type OnConnectionComplete = Box<dyn FnOnce(Result<ConnectionAck, ClientError>) + Send>;
/// Callback fired when a user-requested disconnect has completed.
pub type OnDisconnect = Box<dyn FnOnce() + Send>;
/// Handler fired when an established connection is lost unexpectedly.
pub type OnInterrupted = Box<dyn FnMut(ClientError) + Send>;
/// Handler fired when a lost connection has been re-established. The
/// argument is the broker's session-present flag.
pub type OnResumed = Box<dyn FnMut(bool) + Send>;
/// Handler fired for publications matching a subscription.
pub type PublishHandler = Box<dyn FnMut(&Publication) + Send>;

/// Outcome of an accepted CONNACK.
#[derive(Clone, Debug)]
pub struct ConnectionAck {
    /// Whether the broker retained session state from a prior connection
    pub session_present: bool,
    /// The broker's connect return code
    pub return_code: ConnectReturnCode,
}

/// One filter of a multi-topic subscribe.
pub struct SubscriptionRequest {
    filter: String,
    qos: QoS,
    on_publish: PublishHandler,
}

impl SubscriptionRequest {
    /// Bundle a filter, requested QoS and publish handler.
    #[must_use]
    pub fn new(
        filter: impl Into<String>,
        qos: QoS,
        on_publish: impl FnMut(&Publication) + Send + 'static,
    ) -> Self {
        Self {
            filter: filter.into(),
            qos,
            on_publish: Box::new(on_publish),
        }
    }

    fn into_spec(self) -> Result<SubscriptionSpec, ClientError> {
        let filter = TopicFilter::from_str(&self.filter)
            .map_err(|e| ClientError::with_source(ErrorKind::InvalidTopic, e))?;
        Ok(SubscriptionSpec {
            filter,
            qos: self.qos,
            handler: Some(self.on_publish),
        })
    }
}

/// Will message registered with the broker at connect time.
pub(crate) struct Will {
    pub topic: TopicName,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// Credentials presented in CONNECT.
pub(crate) struct Login {
    pub username: String,
    pub password: Option<String>,
}

/// Config region: read lock-free by the worker once a handshake begins,
/// mutated only while the state allows it.
#[derive(Default)]
pub(crate) struct ConnectionConfig {
    pub options: Option<ConnectOptions>,
    pub will: Option<Will>,
    pub login: Option<Login>,
    pub reconnect_min: Option<Duration>,
    pub reconnect_max: Option<Duration>,
    pub websockets: Option<WebSocketOptions>,
    pub http_proxy: Option<HttpProxyOptions>,
}

/// Handlers that outlive individual operations. Kept apart from the config
/// so the worker can take one out, invoke it unlocked, and put it back.
#[derive(Default)]
pub(crate) struct Handlers {
    pub on_interrupted: Option<OnInterrupted>,
    pub on_resumed: Option<OnResumed>,
    pub on_any_publish: Option<PublishHandler>,
}

/// Synced region: one mutex over the lifecycle state and the registry.
pub(crate) struct Synced {
    pub state: ConnectionState,
    pub registry: RequestRegistry,
    pub on_disconnect: Option<OnDisconnect>,
    pub destroy_requested: bool,
}

/// Worker region: handed to the live worker task for the duration of its
/// run and returned when it exits, so subscriptions and backoff counters
/// survive disconnect/connect cycles.
#[derive(Default)]
pub(crate) struct WorkerRegion {
    pub tree: SubscriptionTree,
    pub backoff: ReconnectBackoff,
    pub inbound_qos2: HashSet<PacketId>,
}

pub(crate) struct ConnectionCore {
    pub config: Mutex<ConnectionConfig>,
    pub handlers: Mutex<Handlers>,
    pub synced: Mutex<Synced>,
    pub worker_region: Mutex<Option<WorkerRegion>>,
    /// Nudges the worker: new pending requests, disconnect, destroy.
    pub wake: Notify,
    pub runtime: Handle,
}

impl ConnectionCore {
    fn lock_synced(&self) -> MutexGuard<'_, Synced> {
        self.synced.lock().unwrap()
    }
}

/// Keeps score of live user handles. When the last one drops while the
/// connection is not disconnected, an implicit disconnect is issued and the
/// worker finishes the teardown.
struct UserPin {
    core: Weak<ConnectionCore>,
}

impl Drop for UserPin {
    fn drop(&mut self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let mut synced = core.lock_synced();
        match synced.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                synced.destroy_requested = true;
                synced.state = ConnectionState::Disconnecting;
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                synced.destroy_requested = true;
            }
        }
        drop(synced);
        core.wake.notify_one();
    }
}

/// A client-side MQTT 3.1.1 connection.
///
/// Cheap to clone; all clones drive the same connection. Dropping the last
/// clone while connected issues an implicit disconnect, and in-flight
/// operations complete with [`ErrorKind::ConnectionDestroyed`].
#[derive(Clone)]
pub struct Connection {
    core: Arc<ConnectionCore>,
    _pin: Arc<UserPin>,
}

impl Connection {
    pub(crate) fn new(runtime: Handle) -> Self {
        let core = Arc::new(ConnectionCore {
            config: Mutex::new(ConnectionConfig::default()),
            handlers: Mutex::new(Handlers::default()),
            synced: Mutex::new(Synced {
                state: ConnectionState::Disconnected,
                registry: RequestRegistry::new(),
                on_disconnect: None,
                destroy_requested: false,
            }),
            worker_region: Mutex::new(Some(WorkerRegion::default())),
            wake: Notify::new(),
            runtime,
        });
        let pin = Arc::new(UserPin {
            core: Arc::downgrade(&core),
        });
        Self { core, _pin: pin }
    }

    /// The connection's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.lock_synced().state
    }

    /// Register the will message sent in CONNECT.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] for a malformed topic name;
    /// [`ErrorKind::InvalidState`] while a handshake or teardown is in flight.
    pub fn set_will(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let topic = TopicName::from_str(topic)
            .map_err(|e| ClientError::with_source(ErrorKind::InvalidTopic, e))?;
        self.mutate_config(|config| {
            config.will = Some(Will {
                topic,
                qos,
                retain,
                payload: Bytes::copy_from_slice(payload),
            });
        })
    }

    /// Register credentials presented in CONNECT.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidState`] while a handshake or teardown is in flight.
    pub fn set_login(&self, username: &str, password: Option<&str>) -> Result<(), ClientError> {
        let login = Login {
            username: username.to_string(),
            password: password.map(ToString::to_string),
        };
        self.mutate_config(|config| config.login = Some(login))
    }

    /// Bound the reconnect backoff delays.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidState`] for a zero or inverted range, or while a
    /// handshake or teardown is in flight.
    pub fn set_reconnect_timeout(&self, min_secs: u64, max_secs: u64) -> Result<(), ClientError> {
        if min_secs == 0 || min_secs > max_secs {
            return Err(ClientError::new(ErrorKind::InvalidState));
        }
        self.mutate_config(|config| {
            config.reconnect_min = Some(Duration::from_secs(min_secs));
            config.reconnect_max = Some(Duration::from_secs(max_secs));
        })
    }

    /// Register handlers fired when the connection is lost unexpectedly and
    /// when it is subsequently re-established.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidState`] while a handshake or teardown is in flight.
    pub fn set_interruption_handlers(
        &self,
        on_interrupted: impl FnMut(ClientError) + Send + 'static,
        on_resumed: impl FnMut(bool) + Send + 'static,
    ) -> Result<(), ClientError> {
        let synced = self.core.lock_synced();
        if !synced.state.allows_config_mutation() {
            return Err(ClientError::new(ErrorKind::InvalidState));
        }
        let mut handlers = self.core.handlers.lock().unwrap();
        handlers.on_interrupted = Some(Box::new(on_interrupted));
        handlers.on_resumed = Some(Box::new(on_resumed));
        Ok(())
    }

    /// Register a handler fired for every inbound publication, matched or
    /// not. Refused once connected.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidState`] unless the connection is disconnected.
    pub fn set_on_any_publish(
        &self,
        handler: impl FnMut(&Publication) + Send + 'static,
    ) -> Result<(), ClientError> {
        let synced = self.core.lock_synced();
        if synced.state != ConnectionState::Disconnected {
            return Err(ClientError::new(ErrorKind::InvalidState));
        }
        self.core.handlers.lock().unwrap().on_any_publish = Some(Box::new(handler));
        Ok(())
    }

    /// Tunnel the connection over WebSockets.
    ///
    /// # Errors
    /// [`ErrorKind::BuiltWithoutWebsockets`] when the `websockets` feature is
    /// not compiled in; [`ErrorKind::InvalidState`] while a handshake or
    /// teardown is in flight.
    pub fn use_websockets(&self, options: WebSocketOptions) -> Result<(), ClientError> {
        #[cfg(feature = "websockets")]
        {
            self.mutate_config(|config| config.websockets = Some(options))
        }
        #[cfg(not(feature = "websockets"))]
        {
            let _ = options;
            Err(ClientError::new(ErrorKind::BuiltWithoutWebsockets))
        }
    }

    /// Tunnel the connection through an HTTP proxy via CONNECT. Takes effect
    /// on the next channel establishment.
    pub fn set_http_proxy(&self, options: HttpProxyOptions) {
        self.core.config.lock().unwrap().http_proxy = Some(options);
    }

    /// Open the connection. `on_complete` fires once with the outcome of the
    /// initial connect attempt.
    ///
    /// # Errors
    /// [`ErrorKind::AlreadyConnected`] unless the connection is disconnected.
    pub fn connect(
        &self,
        options: ConnectOptions,
        on_complete: impl FnOnce(Result<ConnectionAck, ClientError>) + Send + 'static,
    ) -> Result<(), ClientError> {
        let mut options = options;
        if options.client_id.is_empty() {
            options.client_id = generate_client_id();
        }

        let mut synced = self.core.lock_synced();
        if synced.state != ConnectionState::Disconnected {
            return Err(ClientError::new(ErrorKind::AlreadyConnected));
        }
        synced.state = ConnectionState::Connecting;
        self.core.config.lock().unwrap().options = Some(options);
        drop(synced);

        self.core.runtime.spawn(worker::run(
            Arc::clone(&self.core),
            Box::new(on_complete) as OnConnectionComplete,
        ));
        Ok(())
    }

    /// Close the connection. `on_disconnect` fires once teardown completes.
    ///
    /// # Errors
    /// [`ErrorKind::NotConnected`] unless the connection is connected or
    /// reconnecting.
    pub fn disconnect(
        &self,
        on_disconnect: impl FnOnce() + Send + 'static,
    ) -> Result<(), ClientError> {
        let mut synced = self.core.lock_synced();
        match synced.state {
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                synced.state = ConnectionState::Disconnecting;
                synced.on_disconnect = Some(Box::new(on_disconnect));
                drop(synced);
                self.core.wake.notify_one();
                Ok(())
            }
            _ => Err(ClientError::new(ErrorKind::NotConnected)),
        }
    }

    /// Publish a message. The payload is copied before this returns, so the
    /// caller may release its buffer immediately.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] for a malformed topic name;
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
        on_complete: impl FnOnce(PacketId, Result<(), ClientError>) + Send + 'static,
    ) -> Result<PacketId, ClientError> {
        let topic = TopicName::from_str(topic)
            .map_err(|e| ClientError::with_source(ErrorKind::InvalidTopic, e))?;
        self.enqueue(
            RequestKind::Publish {
                topic,
                qos,
                retain,
                payload: Bytes::copy_from_slice(payload),
                dup: false,
                released: false,
            },
            Some(Completion::Operation(Box::new(on_complete))),
            qos == QoS::Level0,
        )
    }

    /// Subscribe to a topic filter. `on_publish` fires for every matching
    /// publication until the filter is unsubscribed.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] for a malformed topic filter;
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        on_publish: impl FnMut(&Publication) + Send + 'static,
        on_complete: impl FnOnce(PacketId, Result<Vec<SubscribeReturnCode>, ClientError>)
            + Send
            + 'static,
    ) -> Result<PacketId, ClientError> {
        let spec = SubscriptionRequest::new(filter, qos, on_publish).into_spec()?;
        self.enqueue(
            RequestKind::Subscribe {
                entries: vec![spec],
                committed: false,
            },
            Some(Completion::Subscribe(Box::new(on_complete))),
            false,
        )
    }

    /// Subscribe to several topic filters as one request; the topic tree
    /// applies all of them or none.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] if any filter is malformed;
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn subscribe_multiple(
        &self,
        requests: Vec<SubscriptionRequest>,
        on_complete: impl FnOnce(PacketId, Result<Vec<SubscribeReturnCode>, ClientError>)
            + Send
            + 'static,
    ) -> Result<PacketId, ClientError> {
        let entries = requests
            .into_iter()
            .map(SubscriptionRequest::into_spec)
            .collect::<Result<Vec<_>, _>>()?;
        if entries.is_empty() {
            return Err(ClientError::new(ErrorKind::InvalidTopic));
        }
        self.enqueue(
            RequestKind::Subscribe {
                entries,
                committed: false,
            },
            Some(Completion::Subscribe(Box::new(on_complete))),
            false,
        )
    }

    /// Subscribe without sending SUBSCRIBE to the broker: matching inbound
    /// publications are routed to `on_publish`, nothing goes on the wire.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] for a malformed topic filter;
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn subscribe_local(
        &self,
        filter: &str,
        on_publish: impl FnMut(&Publication) + Send + 'static,
        on_complete: impl FnOnce(PacketId, Result<Vec<SubscribeReturnCode>, ClientError>)
            + Send
            + 'static,
    ) -> Result<PacketId, ClientError> {
        let spec = SubscriptionRequest::new(filter, QoS::Level0, on_publish).into_spec()?;
        self.enqueue(
            RequestKind::SubscribeLocal { entry: Some(spec) },
            Some(Completion::Subscribe(Box::new(on_complete))),
            false,
        )
    }

    /// Unsubscribe from a topic filter. For a local subscription nothing
    /// goes on the wire.
    ///
    /// # Errors
    /// [`ErrorKind::InvalidTopic`] for a malformed topic filter;
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn unsubscribe(
        &self,
        filter: &str,
        on_complete: impl FnOnce(PacketId, Result<(), ClientError>) + Send + 'static,
    ) -> Result<PacketId, ClientError> {
        let filter = TopicFilter::from_str(filter)
            .map_err(|e| ClientError::with_source(ErrorKind::InvalidTopic, e))?;
        self.enqueue(
            RequestKind::Unsubscribe { filter },
            Some(Completion::Operation(Box::new(on_complete))),
            false,
        )
    }

    /// Re-send a single batched SUBSCRIBE for every live remote subscription.
    /// Intended for `on_resumed` when the broker reports no session present.
    ///
    /// # Errors
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn resubscribe_existing(
        &self,
        on_complete: impl FnOnce(PacketId, Result<Vec<SubscribeReturnCode>, ClientError>)
            + Send
            + 'static,
    ) -> Result<PacketId, ClientError> {
        self.enqueue(
            RequestKind::Resubscribe,
            Some(Completion::Subscribe(Box::new(on_complete))),
            false,
        )
    }

    /// Send a PINGREQ outside the keep-alive schedule.
    ///
    /// # Errors
    /// [`ErrorKind::OutOfMemory`] when no packet id is free.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.enqueue(RequestKind::Ping, None, true)?;
        Ok(())
    }

    fn enqueue(
        &self,
        kind: RequestKind,
        completion: Option<Completion>,
        discard_on_reconnect: bool,
    ) -> Result<PacketId, ClientError> {
        let mut synced = self.core.lock_synced();
        let id = synced
            .registry
            .create(kind, completion, discard_on_reconnect)?;
        drop(synced);
        self.core.wake.notify_one();
        Ok(id)
    }

    /// Apply a config mutation under the state rule: only while disconnected
    /// or connected.
    fn mutate_config(
        &self,
        mutation: impl FnOnce(&mut ConnectionConfig),
    ) -> Result<(), ClientError> {
        let synced = self.core.lock_synced();
        if !synced.state.allows_config_mutation() {
            return Err(ClientError::new(ErrorKind::InvalidState));
        }
        mutation(&mut self.core.config.lock().unwrap());
        Ok(())
    }

    #[cfg(test)]
    fn set_state_for_test(&self, state: ConnectionState) {
        self.core.lock_synced().state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn connection() -> Connection {
        Connection::new(Handle::current())
    }

    #[tokio::test]
    async fn new_connection_is_disconnected() {
        assert_eq!(connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_requires_a_connection() {
        let conn = connection();
        let err = conn.disconnect(|| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn connect_refused_unless_disconnected() {
        let conn = connection();
        conn.set_state_for_test(ConnectionState::Connecting);
        let options = crate::connection_settings::ConnectOptionsBuilder::default()
            .hostname("localhost")
            .build()
            .unwrap();
        let err = conn.connect(options, |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyConnected);
    }

    #[tokio::test]
    async fn config_mutation_refused_while_reconnecting() {
        let conn = connection();
        conn.set_state_for_test(ConnectionState::Reconnecting);
        let err = conn.set_login("user", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = conn.set_will("a/b", QoS::Level0, false, b"bye").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn any_publish_handler_refused_while_connected() {
        let conn = connection();
        conn.set_state_for_test(ConnectionState::Connected);
        let err = conn.set_on_any_publish(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        conn.set_state_for_test(ConnectionState::Disconnected);
        assert!(conn.set_on_any_publish(|_| {}).is_ok());
    }

    #[tokio::test]
    async fn invalid_topics_are_rejected_up_front() {
        let conn = connection();
        let err = conn
            .publish("bad/+/topic", QoS::Level0, false, b"x", |_, _| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTopic);
        let err = conn
            .subscribe("bad/#/filter", QoS::Level1, |_| {}, |_, _| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTopic);
        let err = conn.unsubscribe("", |_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTopic);
    }

    #[tokio::test]
    async fn reconnect_bounds_are_validated() {
        let conn = connection();
        assert_err!(conn.set_reconnect_timeout(0, 10));
        assert_err!(conn.set_reconnect_timeout(10, 1));
        assert_ok!(conn.set_reconnect_timeout(1, 128));
    }

    #[tokio::test]
    async fn packet_ids_are_assigned_at_enqueue_time() {
        let conn = connection();
        let first = conn
            .publish("a/b", QoS::Level1, false, b"one", |_, _| {})
            .unwrap();
        let second = conn
            .subscribe("a/#", QoS::Level1, |_| {}, |_, _| {})
            .unwrap();
        assert_ne!(first, 0);
        assert_ne!(second, 0);
        assert_ne!(first, second);
    }
}
