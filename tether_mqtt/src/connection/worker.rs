// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! The connection's I/O worker.
//!
//! One task per connection lifetime. It establishes the channel, performs
//! the CONNECT/CONNACK handshake under a deadline, then serves a single
//! select loop: inbound packets, send-loop wakeups, per-operation timeouts,
//! keep-alive pings and teardown requests. When the channel goes away it
//! applies the state-machine shutdown transition and either finalizes,
//! reports the failed connect, or sleeps out the reconnect backoff and
//! tries again.

use std::future::poll_fn;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::{
    ConnackPacket, ConnectPacket, DisconnectPacket, PingreqPacket, PubackPacket, PubcompPacket,
    PublishPacket, PubrecPacket, PubrelPacket, SubscribePacket, UnsubscribePacket, VariablePacket,
};
use mqtt::Encodable;
use mqtt::{TopicFilter as WireTopicFilter, TopicName as WireTopicName};
use tokio::time::{sleep_until, Instant};
use tokio_util::time::DelayQueue;

use super::reconnect::{DEFAULT_MAX_RECONNECT, DEFAULT_MIN_RECONNECT};
use super::registry::{Request, RequestKind};
use super::state::{on_channel_shutdown, ShutdownOutcome};
use super::tree::{Subscription, TreeTransaction};
use super::{
    ConnectionAck, ConnectionConfig, ConnectionCore, ConnectionState, OnConnectionComplete,
    OnDisconnect, PacketId, WorkerRegion,
};
use crate::codec::{encode_packet, PacketFramer};
use crate::connection_settings::ConnectOptions;
use crate::control_packet::{Publication, QoS, SubscribeReturnCode};
use crate::error::{ClientError, ErrorKind};
use crate::topic::{TopicFilter, TopicName};
use crate::transport::{establish, Endpoint, Transport};

/// Why the channel stopped serving.
enum ChannelEnd {
    /// User-requested disconnect or handle teardown; DISCONNECT was sent
    Disconnect,
    /// Establishment failure, hangup, protocol error or timeout
    Error(ClientError),
}

/// An established channel plus its inbound framing state.
struct Channel {
    transport: Transport,
    framer: PacketFramer,
}

impl Channel {
    async fn read_packet(&mut self) -> Result<VariablePacket, ClientError> {
        loop {
            if let Some(packet) = self.framer.next_packet()? {
                return Ok(packet);
            }
            let n = self.transport.read_some(self.framer.buffer_mut()).await?;
            if n == 0 {
                return Err(ClientError::new(ErrorKind::UnexpectedHangup));
            }
        }
    }

    async fn write_packet<P: Encodable>(&mut self, packet: &P) -> Result<(), ClientError> {
        let bytes = encode_packet(packet)?;
        Ok(self.transport.write_chunked(&bytes).await?)
    }
}

/// Keep-alive bookkeeping for the current channel.
struct PingState {
    waiting_on_response: bool,
    deadline: Instant,
}

/// Events the serve loop multiplexes over.
enum Event {
    Wake,
    Inbound(Result<VariablePacket, ClientError>),
    OperationTimeout(PacketId),
    KeepAlive,
    PingTimeout,
}

/// Events during the CONNACK wait.
enum HandshakeEvent {
    Wake,
    Inbound(Result<VariablePacket, ClientError>),
    Deadline,
}

/// Work detached from the pending queue, with everything the send needs
/// cloned out so no lock is held across channel I/O.
enum SendJob {
    Publish {
        id: PacketId,
        topic: TopicName,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        dup: bool,
    },
    /// Re-drive of a QoS 2 publish that already saw its PUBREC
    PubRel { id: PacketId },
    Subscribe {
        id: PacketId,
        filters: Vec<(TopicFilter, QoS)>,
        to_install: Vec<Subscription>,
        committed: bool,
    },
    SubscribeLocal {
        id: PacketId,
        subscription: Subscription,
    },
    Unsubscribe {
        id: PacketId,
        filter: TopicFilter,
    },
    Resubscribe { id: PacketId },
    Ping { id: PacketId },
}

pub(super) async fn run(core: Arc<ConnectionCore>, on_complete: OnConnectionComplete) {
    let region = core.worker_region.lock().unwrap().take();
    let Some(region) = region else {
        log::error!("i/o worker already active; rejecting connect attempt");
        on_complete(Err(ClientError::new(ErrorKind::InvalidState)));
        return;
    };
    let worker = Worker { core, region };
    worker.run(on_complete).await;
}

struct Worker {
    core: Arc<ConnectionCore>,
    region: WorkerRegion,
}

impl Worker {
    async fn run(mut self, on_complete: OnConnectionComplete) {
        let mut on_connect_complete = Some(on_complete);
        loop {
            if self.teardown_requested() {
                self.finish_channel(ChannelEnd::Disconnect, &mut on_connect_complete);
                break;
            }

            let end = self.run_channel(&mut on_connect_complete).await;
            self.region.backoff.on_channel_loss(Instant::now());

            if !self.finish_channel(end, &mut on_connect_complete) {
                break;
            }
            self.backoff_sleep().await;
        }
    }

    /// Apply the channel-shutdown transition and its callbacks. Returns true
    /// if the worker should attempt to reconnect.
    fn finish_channel(
        &mut self,
        end: ChannelEnd,
        on_connect_complete: &mut Option<OnConnectionComplete>,
    ) -> bool {
        let cause = match end {
            ChannelEnd::Disconnect => ClientError::new(ErrorKind::ConnectionDestroyed),
            ChannelEnd::Error(e) => e,
        };
        let (outcome, drained, drain_kind, on_disconnect) = self.shutdown_transition();
        for mut request in drained {
            request.complete_err(ClientError::new(drain_kind));
        }
        match outcome {
            ShutdownOutcome::FinalizeDisconnect => {
                log::info!("connection closed");
                if let Some(callback) = on_disconnect {
                    callback();
                }
                false
            }
            ShutdownOutcome::ConnectFailed => {
                log::warn!("connect attempt failed: {cause}");
                if let Some(callback) = on_connect_complete.take() {
                    callback(Err(cause));
                }
                false
            }
            ShutdownOutcome::BeginReconnect => {
                log::warn!("connection interrupted: {cause}");
                self.invoke_on_interrupted(cause);
                true
            }
            ShutdownOutcome::ContinueReconnect => {
                log::info!("reconnect attempt failed: {cause}");
                true
            }
        }
    }

    /// The state transition and request drain of a channel shutdown, all
    /// under one acquisition of the synced lock. Completion callbacks for the
    /// drained requests run at the caller, after release.
    fn shutdown_transition(
        &mut self,
    ) -> (ShutdownOutcome, Vec<Request>, ErrorKind, Option<OnDisconnect>) {
        let clean_session = {
            let config = self.core.config.lock().unwrap();
            config.options.as_ref().map_or(true, |o| o.clean_session)
        };
        let mut synced = self.core.lock_synced();
        let destroyed = synced.destroy_requested;
        let outcome = on_channel_shutdown(&mut synced.state);
        if matches!(
            outcome,
            ShutdownOutcome::FinalizeDisconnect | ShutdownOutcome::ConnectFailed
        ) {
            // Terminal: hand the worker region back before the Disconnected
            // state becomes observable, so an immediate re-connect finds it
            *self.core.worker_region.lock().unwrap() = Some(std::mem::take(&mut self.region));
        }
        let (drained, drain_kind) = if destroyed {
            (synced.registry.drain_all(), ErrorKind::ConnectionDestroyed)
        } else if clean_session {
            (
                synced.registry.drain_all(),
                ErrorKind::CancelledForCleanSession,
            )
        } else {
            (
                synced.registry.drain_for_reconnect(),
                ErrorKind::NotConnected,
            )
        };
        let on_disconnect = if matches!(outcome, ShutdownOutcome::FinalizeDisconnect) {
            synced.on_disconnect.take()
        } else {
            None
        };
        (outcome, drained, drain_kind, on_disconnect)
    }

    /// Establish a channel, run the handshake, and serve it until it ends.
    async fn run_channel(
        &mut self,
        on_connect_complete: &mut Option<OnConnectionComplete>,
    ) -> ChannelEnd {
        let (options, endpoint) = {
            let config = self.core.config.lock().unwrap();
            let Some(options) = config.options.clone() else {
                return ChannelEnd::Error(ClientError::new(ErrorKind::InvalidState));
            };
            let endpoint = Endpoint {
                hostname: options.hostname.clone(),
                port: options.port,
                connect_timeout: options.connect_timeout,
                tls: options.tls.clone(),
                proxy: config.http_proxy.clone(),
            };
            (options, endpoint)
        };

        // The websocket options hold the handshake callbacks; borrow them
        // for the upgrade and put them back afterwards.
        let mut ws_options = self.core.config.lock().unwrap().websockets.take();
        let established = establish(&endpoint, ws_options.as_mut()).await;
        if let Some(ws) = ws_options {
            let mut config = self.core.config.lock().unwrap();
            if config.websockets.is_none() {
                config.websockets = Some(ws);
            }
        }
        let transport = match established {
            Ok(transport) => transport,
            Err(e) => return ChannelEnd::Error(e),
        };
        let mut channel = Channel {
            transport,
            framer: PacketFramer::new(),
        };
        log::debug!("channel up to {}:{}", endpoint.hostname, endpoint.port);

        let connect_packet = {
            let config = self.core.config.lock().unwrap();
            match build_connect(&options, &config) {
                Ok(packet) => packet,
                Err(e) => return ChannelEnd::Error(e),
            }
        };
        if let Err(e) = channel.write_packet(&connect_packet).await {
            return ChannelEnd::Error(e);
        }

        let connack = match self.await_connack(&mut channel, options.ping_timeout).await {
            Ok(Some(ack)) => ack,
            Ok(None) => return ChannelEnd::Disconnect,
            Err(e) => {
                channel.transport.shutdown().await;
                return ChannelEnd::Error(e);
            }
        };
        let return_code = connack.connect_return_code();
        if return_code != ConnectReturnCode::ConnectionAccepted {
            log::warn!("broker refused connection: {return_code:?}");
            channel.transport.shutdown().await;
            return ChannelEnd::Error(ClientError::with_source(
                ErrorKind::TransportFailure,
                io::Error::other(format!("broker refused connection: {return_code:?}")),
            ));
        }
        let session_present = connack.connack_flags().session_present;

        let resumed = {
            let mut synced = self.core.lock_synced();
            match synced.state {
                ConnectionState::Connecting => {
                    synced.state = ConnectionState::Connected;
                    Some(false)
                }
                ConnectionState::Reconnecting => {
                    synced.state = ConnectionState::Connected;
                    Some(true)
                }
                // Teardown raced the handshake
                _ => None,
            }
        };
        let Some(resumed) = resumed else {
            let _ = channel.write_packet(&DisconnectPacket::new()).await;
            channel.transport.shutdown().await;
            return ChannelEnd::Disconnect;
        };
        log::info!(
            "connected to {}:{} (session_present={session_present})",
            endpoint.hostname,
            endpoint.port
        );
        self.region.backoff.on_connected(Instant::now());

        if let Some(callback) = on_connect_complete.take() {
            callback(Ok(ConnectionAck {
                session_present,
                return_code,
            }));
        }
        if resumed {
            self.invoke_on_resumed(session_present);
        }

        self.serve(&mut channel, &options).await
    }

    /// Wait for CONNACK under the handshake deadline. `Ok(None)` means a
    /// teardown request interrupted the wait.
    async fn await_connack(
        &mut self,
        channel: &mut Channel,
        ping_timeout: Duration,
    ) -> Result<Option<ConnackPacket>, ClientError> {
        let deadline = Instant::now() + ping_timeout;
        loop {
            let event = tokio::select! {
                biased;
                () = self.core.wake.notified() => HandshakeEvent::Wake,
                packet = channel.read_packet() => HandshakeEvent::Inbound(packet),
                () = sleep_until(deadline) => HandshakeEvent::Deadline,
            };
            match event {
                HandshakeEvent::Wake => {
                    if self.teardown_requested() {
                        let _ = channel.write_packet(&DisconnectPacket::new()).await;
                        channel.transport.shutdown().await;
                        return Ok(None);
                    }
                }
                HandshakeEvent::Inbound(Ok(VariablePacket::ConnackPacket(ack))) => {
                    return Ok(Some(ack));
                }
                HandshakeEvent::Inbound(Ok(other)) => {
                    log::error!("expected CONNACK, received {other:?}");
                    return Err(ClientError::new(ErrorKind::ProtocolViolation));
                }
                HandshakeEvent::Inbound(Err(e)) => return Err(e),
                HandshakeEvent::Deadline => {
                    log::warn!("CONNACK did not arrive within {ping_timeout:?}");
                    return Err(ClientError::new(ErrorKind::Timeout));
                }
            }
        }
    }

    /// The serve loop for an established channel.
    async fn serve(&mut self, channel: &mut Channel, options: &ConnectOptions) -> ChannelEnd {
        let mut timeouts: DelayQueue<PacketId> = DelayQueue::new();
        // PINGREQ goes out one second ahead of the keep-alive interval
        let keep_alive_period = options.keep_alive.saturating_sub(Duration::from_secs(1));
        let mut ping_interval =
            tokio::time::interval_at(Instant::now() + keep_alive_period, keep_alive_period);
        let mut ping = PingState {
            waiting_on_response: false,
            deadline: Instant::now() + options.ping_timeout,
        };

        // Drive anything queued while the channel was down
        if let Err(end) = self
            .drive_sends(channel, &mut timeouts, &mut ping, options)
            .await
        {
            return end;
        }

        loop {
            let event = tokio::select! {
                biased;
                () = self.core.wake.notified() => Event::Wake,
                packet = channel.read_packet() => Event::Inbound(packet),
                Some(expired) = poll_fn(|cx| timeouts.poll_expired(cx)), if !timeouts.is_empty() => {
                    Event::OperationTimeout(expired.into_inner())
                }
                _ = ping_interval.tick() => Event::KeepAlive,
                () = sleep_until(ping.deadline), if ping.waiting_on_response => Event::PingTimeout,
            };

            match event {
                Event::Wake => {
                    if self.teardown_requested() {
                        let _ = channel.write_packet(&DisconnectPacket::new()).await;
                        channel.transport.shutdown().await;
                        return ChannelEnd::Disconnect;
                    }
                    if let Err(end) = self
                        .drive_sends(channel, &mut timeouts, &mut ping, options)
                        .await
                    {
                        return end;
                    }
                }
                Event::Inbound(Ok(packet)) => {
                    if let Err(end) = self
                        .handle_packet(channel, packet, &mut timeouts, &mut ping)
                        .await
                    {
                        return end;
                    }
                }
                Event::Inbound(Err(e)) => return ChannelEnd::Error(e),
                Event::OperationTimeout(id) => {
                    log::warn!("operation {id} timed out awaiting its ack");
                    fail_request(
                        &self.core,
                        id,
                        &mut timeouts,
                        ClientError::new(ErrorKind::Timeout),
                    );
                }
                Event::KeepAlive => {
                    if !ping.waiting_on_response {
                        if let Err(e) = channel.write_packet(&PingreqPacket::new()).await {
                            return ChannelEnd::Error(e);
                        }
                        ping.waiting_on_response = true;
                        ping.deadline = Instant::now() + options.ping_timeout;
                    }
                }
                Event::PingTimeout => {
                    log::warn!(
                        "no PINGRESP within {:?}; dropping the channel",
                        options.ping_timeout
                    );
                    channel.transport.shutdown().await;
                    return ChannelEnd::Error(ClientError::new(ErrorKind::Timeout));
                }
            }
        }
    }

    /// Detach pending requests one at a time and submit them to the channel.
    async fn drive_sends(
        &mut self,
        channel: &mut Channel,
        timeouts: &mut DelayQueue<PacketId>,
        ping: &mut PingState,
        options: &ConnectOptions,
    ) -> Result<(), ChannelEnd> {
        loop {
            let job = {
                let mut synced = self.core.lock_synced();
                if synced.state != ConnectionState::Connected {
                    return Ok(());
                }
                let Some(id) = synced.registry.detach_next_pending() else {
                    return Ok(());
                };
                match prepare_job(&mut synced, id) {
                    Some(job) => job,
                    None => continue,
                }
            };
            self.execute_job(channel, timeouts, ping, options, job)
                .await?;
        }
    }

    async fn execute_job(
        &mut self,
        channel: &mut Channel,
        timeouts: &mut DelayQueue<PacketId>,
        ping: &mut PingState,
        options: &ConnectOptions,
        job: SendJob,
    ) -> Result<(), ChannelEnd> {
        match job {
            SendJob::Publish {
                id,
                topic,
                qos,
                retain,
                payload,
                dup,
            } => {
                let wire_topic = match WireTopicName::new(topic.as_str().to_string()) {
                    Ok(topic) => topic,
                    Err(e) => {
                        fail_request(
                            &self.core,
                            id,
                            timeouts,
                            ClientError::with_source(ErrorKind::InvalidTopic, e),
                        );
                        return Ok(());
                    }
                };
                let wire_qos = match qos {
                    QoS::Level0 => QoSWithPacketIdentifier::Level0,
                    QoS::Level1 => QoSWithPacketIdentifier::Level1(id),
                    QoS::Level2 => QoSWithPacketIdentifier::Level2(id),
                };
                let mut packet = PublishPacket::new(wire_topic, wire_qos, payload.to_vec());
                packet.set_dup(dup);
                packet.set_retain(retain);
                channel.write_packet(&packet).await.map_err(ChannelEnd::Error)?;
                if qos == QoS::Level0 {
                    // No ack expected; the operation is complete on submission
                    succeed_request(&self.core, id, timeouts);
                } else {
                    self.arm_timeout(id, timeouts, options);
                }
            }
            SendJob::PubRel { id } => {
                channel
                    .write_packet(&PubrelPacket::new(id))
                    .await
                    .map_err(ChannelEnd::Error)?;
                self.arm_timeout(id, timeouts, options);
            }
            SendJob::Subscribe {
                id,
                filters,
                to_install,
                committed,
            } => {
                let mut txn = TreeTransaction::begin(&mut self.region.tree);
                for subscription in to_install {
                    txn.insert(subscription);
                }
                let wire_entries: Result<Vec<_>, _> = filters
                    .iter()
                    .map(|(filter, qos)| {
                        WireTopicFilter::new(filter.as_str().to_string()).map(|wf| (wf, *qos))
                    })
                    .collect();
                let packet = match wire_entries {
                    Ok(entries) => SubscribePacket::new(id, entries),
                    Err(e) => {
                        txn.roll_back();
                        fail_request(
                            &self.core,
                            id,
                            timeouts,
                            ClientError::with_source(ErrorKind::InvalidTopic, e),
                        );
                        return Ok(());
                    }
                };
                txn.commit();
                if !committed {
                    let mut synced = self.core.lock_synced();
                    if let Some(request) = synced.registry.get_mut(id) {
                        if let RequestKind::Subscribe { committed, .. } = &mut request.kind {
                            *committed = true;
                        }
                    }
                }
                channel.write_packet(&packet).await.map_err(ChannelEnd::Error)?;
                self.arm_timeout(id, timeouts, options);
            }
            SendJob::SubscribeLocal { id, subscription } => {
                let granted = granted_code(subscription.qos);
                self.region.tree.insert(subscription);
                // Local subscriptions never touch the wire
                if let Some(mut request) = take_request(&self.core, id, timeouts) {
                    request.complete_suback(vec![granted]);
                }
            }
            SendJob::Unsubscribe { id, filter } => {
                let mut txn = TreeTransaction::begin(&mut self.region.tree);
                let removed_local = txn.remove(&filter);
                if removed_local == Some(true) {
                    // The removed subscription was local; nothing on the wire
                    txn.commit();
                    succeed_request(&self.core, id, timeouts);
                    return Ok(());
                }
                let wire_filter = match WireTopicFilter::new(filter.as_str().to_string()) {
                    Ok(filter) => filter,
                    Err(e) => {
                        txn.roll_back();
                        fail_request(
                            &self.core,
                            id,
                            timeouts,
                            ClientError::with_source(ErrorKind::InvalidTopic, e),
                        );
                        return Ok(());
                    }
                };
                let packet = UnsubscribePacket::new(id, vec![wire_filter]);
                match channel.write_packet(&packet).await {
                    Ok(()) => {
                        txn.commit();
                        self.arm_timeout(id, timeouts, options);
                    }
                    Err(e) => {
                        // A failed send rolls the removal back; the request
                        // is re-driven on the next channel
                        txn.roll_back();
                        return Err(ChannelEnd::Error(e));
                    }
                }
            }
            SendJob::Resubscribe { id } => {
                let filters = self.region.tree.remote_filters();
                if filters.is_empty() {
                    if let Some(mut request) = take_request(&self.core, id, timeouts) {
                        request.complete_suback(Vec::new());
                    }
                    return Ok(());
                }
                let wire_entries: Result<Vec<_>, _> = filters
                    .iter()
                    .map(|(filter, qos)| {
                        WireTopicFilter::new(filter.as_str().to_string()).map(|wf| (wf, *qos))
                    })
                    .collect();
                let packet = match wire_entries {
                    Ok(entries) => SubscribePacket::new(id, entries),
                    Err(e) => {
                        fail_request(
                            &self.core,
                            id,
                            timeouts,
                            ClientError::with_source(ErrorKind::InvalidTopic, e),
                        );
                        return Ok(());
                    }
                };
                channel.write_packet(&packet).await.map_err(ChannelEnd::Error)?;
                self.arm_timeout(id, timeouts, options);
            }
            SendJob::Ping { id } => {
                channel
                    .write_packet(&PingreqPacket::new())
                    .await
                    .map_err(ChannelEnd::Error)?;
                ping.waiting_on_response = true;
                ping.deadline = Instant::now() + options.ping_timeout;
                // PINGREQ completes on submission; the response is tracked by
                // the keep-alive deadline
                succeed_request(&self.core, id, timeouts);
            }
        }
        Ok(())
    }

    /// Arm the per-operation timeout if one is configured. Timeouts are armed
    /// at send submission rather than write completion.
    fn arm_timeout(
        &self,
        id: PacketId,
        timeouts: &mut DelayQueue<PacketId>,
        options: &ConnectOptions,
    ) {
        if let Some(timeout) = options.operation_timeout {
            let key = timeouts.insert(id, timeout);
            if let Some(request) = self.core.lock_synced().registry.get_mut(id) {
                request.timeout_key = Some(key);
            }
        }
    }

    async fn handle_packet(
        &mut self,
        channel: &mut Channel,
        packet: VariablePacket,
        timeouts: &mut DelayQueue<PacketId>,
        ping: &mut PingState,
    ) -> Result<(), ChannelEnd> {
        match packet {
            VariablePacket::PublishPacket(publish) => {
                self.handle_inbound_publish(channel, &publish).await
            }
            VariablePacket::PubackPacket(ack) => {
                succeed_request(&self.core, ack.packet_identifier(), timeouts);
                Ok(())
            }
            VariablePacket::SubackPacket(ack) => {
                let grants = ack.subscribes().to_vec();
                match take_request(&self.core, ack.packet_identifier(), timeouts) {
                    Some(mut request) => request.complete_suback(grants),
                    None => log::warn!(
                        "SUBACK for packet id {} not outstanding; dropping",
                        ack.packet_identifier()
                    ),
                }
                Ok(())
            }
            VariablePacket::UnsubackPacket(ack) => {
                succeed_request(&self.core, ack.packet_identifier(), timeouts);
                Ok(())
            }
            VariablePacket::PubrecPacket(rec) => {
                self.handle_pubrec(channel, rec.packet_identifier()).await
            }
            VariablePacket::PubcompPacket(comp) => {
                succeed_request(&self.core, comp.packet_identifier(), timeouts);
                Ok(())
            }
            VariablePacket::PubrelPacket(rel) => {
                let id = rel.packet_identifier();
                self.region.inbound_qos2.remove(&id);
                channel
                    .write_packet(&PubcompPacket::new(id))
                    .await
                    .map_err(ChannelEnd::Error)
            }
            VariablePacket::PingrespPacket(_) => {
                ping.waiting_on_response = false;
                Ok(())
            }
            other => {
                log::error!("unexpected inbound packet: {other:?}");
                Err(ChannelEnd::Error(ClientError::new(
                    ErrorKind::ProtocolViolation,
                )))
            }
        }
    }

    /// PUBREC for an outbound QoS 2 publish: answer with PUBREL and keep the
    /// request ongoing until PUBCOMP.
    async fn handle_pubrec(
        &mut self,
        channel: &mut Channel,
        id: PacketId,
    ) -> Result<(), ChannelEnd> {
        let known = {
            let mut synced = self.core.lock_synced();
            match synced.registry.get_mut(id) {
                Some(request) => {
                    if let RequestKind::Publish { released, .. } = &mut request.kind {
                        *released = true;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if known {
            channel
                .write_packet(&PubrelPacket::new(id))
                .await
                .map_err(ChannelEnd::Error)
        } else {
            log::warn!("PUBREC for packet id {id} not outstanding; dropping");
            Ok(())
        }
    }

    async fn handle_inbound_publish(
        &mut self,
        channel: &mut Channel,
        publish: &PublishPacket,
    ) -> Result<(), ChannelEnd> {
        let (qos, packet_id) = match publish.qos() {
            QoSWithPacketIdentifier::Level0 => (QoS::Level0, None),
            QoSWithPacketIdentifier::Level1(id) => (QoS::Level1, Some(id)),
            QoSWithPacketIdentifier::Level2(id) => (QoS::Level2, Some(id)),
        };
        let Ok(topic) = TopicName::from_str(publish.topic_name()) else {
            log::error!("inbound publish carries an invalid topic name");
            return Err(ChannelEnd::Error(ClientError::new(
                ErrorKind::ProtocolViolation,
            )));
        };
        let publication = Publication {
            topic: topic.as_str().to_string(),
            payload: Bytes::copy_from_slice(publish.payload()),
            qos,
            retain: publish.retain(),
            dup: publish.dup(),
        };

        // A QoS 2 redelivery whose id is still being released was already
        // handed to handlers; it only needs its ack
        let deliver = match (qos, packet_id) {
            (QoS::Level2, Some(id)) => self.region.inbound_qos2.insert(id),
            _ => true,
        };
        if deliver {
            self.invoke_any_publish(&publication);
            let hits = self.region.tree.dispatch(&topic, &publication);
            log::debug!(
                "publish on '{}' matched {hits} subscription handler(s)",
                topic.as_str()
            );
        }

        match (qos, packet_id) {
            (QoS::Level1, Some(id)) => channel
                .write_packet(&PubackPacket::new(id))
                .await
                .map_err(ChannelEnd::Error),
            (QoS::Level2, Some(id)) => channel
                .write_packet(&PubrecPacket::new(id))
                .await
                .map_err(ChannelEnd::Error),
            _ => Ok(()),
        }
    }

    /// Sleep out the reconnect backoff, cut short by teardown requests.
    async fn backoff_sleep(&mut self) {
        {
            let config = self.core.config.lock().unwrap();
            self.region.backoff.set_bounds(
                config.reconnect_min.unwrap_or(DEFAULT_MIN_RECONNECT),
                config.reconnect_max.unwrap_or(DEFAULT_MAX_RECONNECT),
            );
        }
        let delay = self.region.backoff.next_delay();
        log::info!("next reconnect attempt in {delay:?}");
        let deadline = Instant::now() + delay;
        loop {
            let woke = tokio::select! {
                biased;
                () = self.core.wake.notified() => true,
                () = sleep_until(deadline) => false,
            };
            if !woke {
                // Backoff elapsed; attempt the reconnect
                return;
            }
            if self.teardown_requested() {
                return;
            }
        }
    }

    fn teardown_requested(&self) -> bool {
        let synced = self.core.lock_synced();
        synced.state == ConnectionState::Disconnecting || synced.destroy_requested
    }

    fn invoke_any_publish(&self, publication: &Publication) {
        let handler = self.core.handlers.lock().unwrap().on_any_publish.take();
        if let Some(mut handler) = handler {
            handler(publication);
            let mut handlers = self.core.handlers.lock().unwrap();
            if handlers.on_any_publish.is_none() {
                handlers.on_any_publish = Some(handler);
            }
        }
    }

    fn invoke_on_interrupted(&self, cause: ClientError) {
        let handler = self.core.handlers.lock().unwrap().on_interrupted.take();
        if let Some(mut handler) = handler {
            handler(cause);
            let mut handlers = self.core.handlers.lock().unwrap();
            if handlers.on_interrupted.is_none() {
                handlers.on_interrupted = Some(handler);
            }
        }
    }

    fn invoke_on_resumed(&self, session_present: bool) {
        let handler = self.core.handlers.lock().unwrap().on_resumed.take();
        if let Some(mut handler) = handler {
            handler(session_present);
            let mut handlers = self.core.handlers.lock().unwrap();
            if handlers.on_resumed.is_none() {
                handlers.on_resumed = Some(handler);
            }
        }
    }
}

/// Clone everything a send needs out of the registry so the lock is not held
/// across channel I/O. Returns `None` if the entry vanished.
fn prepare_job(synced: &mut super::Synced, id: PacketId) -> Option<SendJob> {
    let request = synced.registry.get_mut(id)?;
    let job = match &mut request.kind {
        RequestKind::Publish {
            topic,
            qos,
            retain,
            payload,
            dup,
            released,
        } => {
            if *released {
                SendJob::PubRel { id }
            } else {
                SendJob::Publish {
                    id,
                    topic: topic.clone(),
                    qos: *qos,
                    retain: *retain,
                    payload: payload.clone(),
                    dup: *dup,
                }
            }
        }
        RequestKind::Subscribe { entries, committed } => {
            let filters = entries
                .iter()
                .map(|entry| (entry.filter.clone(), entry.qos))
                .collect();
            let to_install = if *committed {
                Vec::new()
            } else {
                entries
                    .iter_mut()
                    .map(|entry| Subscription {
                        filter: entry.filter.clone(),
                        qos: entry.qos,
                        handler: entry.handler.take(),
                        local: false,
                    })
                    .collect()
            };
            SendJob::Subscribe {
                id,
                filters,
                to_install,
                committed: *committed,
            }
        }
        RequestKind::SubscribeLocal { entry } => match entry.take() {
            Some(spec) => SendJob::SubscribeLocal {
                id,
                subscription: spec.into_subscription(true),
            },
            None => {
                synced.registry.take(id);
                return None;
            }
        },
        RequestKind::Unsubscribe { filter } => SendJob::Unsubscribe {
            id,
            filter: filter.clone(),
        },
        RequestKind::Resubscribe => SendJob::Resubscribe { id },
        RequestKind::Ping => SendJob::Ping { id },
    };
    Some(job)
}

/// Remove a request from the registry and disarm its timeout.
fn take_request(
    core: &ConnectionCore,
    id: PacketId,
    timeouts: &mut DelayQueue<PacketId>,
) -> Option<Request> {
    let mut synced = core.lock_synced();
    let mut request = synced.registry.take(id)?;
    if let Some(key) = request.timeout_key.take() {
        timeouts.try_remove(&key);
    }
    Some(request)
}

fn succeed_request(core: &ConnectionCore, id: PacketId, timeouts: &mut DelayQueue<PacketId>) {
    match take_request(core, id, timeouts) {
        Some(mut request) => request.complete_ok(),
        None => log::warn!("ack for packet id {id} not outstanding; dropping"),
    }
}

fn fail_request(
    core: &ConnectionCore,
    id: PacketId,
    timeouts: &mut DelayQueue<PacketId>,
    err: ClientError,
) {
    match take_request(core, id, timeouts) {
        Some(mut request) => request.complete_err(err),
        None => log::debug!("packet id {id} already completed"),
    }
}

fn granted_code(qos: QoS) -> SubscribeReturnCode {
    match qos {
        QoS::Level0 => SubscribeReturnCode::MaximumQoSLevel0,
        QoS::Level1 => SubscribeReturnCode::MaximumQoSLevel1,
        QoS::Level2 => SubscribeReturnCode::MaximumQoSLevel2,
    }
}

/// Build the CONNECT packet from the endpoint options and connection config.
fn build_connect(
    options: &ConnectOptions,
    config: &ConnectionConfig,
) -> Result<ConnectPacket, ClientError> {
    let mut packet = ConnectPacket::new(options.client_id.clone());
    packet.set_clean_session(options.clean_session);
    packet.set_keep_alive(u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX));
    if let Some(login) = &config.login {
        packet.set_user_name(Some(login.username.clone()));
        packet.set_password(login.password.clone());
    }
    if let Some(will) = &config.will {
        let topic = WireTopicName::new(will.topic.as_str().to_string())
            .map_err(|e| ClientError::with_source(ErrorKind::InvalidTopic, e))?;
        packet.set_will(Some((topic, will.payload.to_vec())));
        packet.set_will_qos(match will.qos {
            QoS::Level0 => 0,
            QoS::Level1 => 1,
            QoS::Level2 => 2,
        });
        packet.set_will_retain(will.retain);
    }
    Ok(packet)
}
