// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! In-flight request bookkeeping keyed by 16-bit packet id.
//!
//! Every live request sits in the `outstanding` table and in exactly one of
//! the `pending` queue (not yet handed to the channel) or the `ongoing` queue
//! (submitted and awaiting its ack). The send loop detaches requests from
//! pending into ongoing; acks, timeouts and drains remove them from all
//! structures before the completion callback runs.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio_util::time::delay_queue;

use super::tree::Subscription;
use super::{OnOperationComplete, OnSubscribeComplete, PacketId};
use crate::control_packet::{QoS, SubscribeReturnCode};
use crate::error::{ClientError, ErrorKind};
use crate::topic::{TopicFilter, TopicName};

/// The protocol operation a request drives.
pub(super) enum RequestKind {
    Publish {
        topic: TopicName,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        /// Set when re-sent after a reconnect
        dup: bool,
        /// Set once PUBREC has been answered with PUBREL (QoS 2 only)
        released: bool,
    },
    Subscribe {
        entries: Vec<SubscriptionSpec>,
        /// Set once the tree transaction has been committed; retries re-use
        /// the committed entries
        committed: bool,
    },
    SubscribeLocal {
        entry: Option<SubscriptionSpec>,
    },
    Unsubscribe {
        filter: TopicFilter,
    },
    Resubscribe,
    Ping,
}

/// One filter of a (multi-)subscribe, with the handler that will be installed
/// into the topic tree when the transaction commits.
pub(super) struct SubscriptionSpec {
    pub filter: TopicFilter,
    pub qos: QoS,
    pub handler: Option<super::PublishHandler>,
}

impl SubscriptionSpec {
    /// Move the handler out into a tree entry.
    pub(super) fn into_subscription(self, local: bool) -> Subscription {
        Subscription {
            filter: self.filter,
            qos: self.qos,
            handler: self.handler,
            local,
        }
    }
}

/// Completion callback variants, matched to what the operation yields.
pub(super) enum Completion {
    Operation(OnOperationComplete),
    Subscribe(OnSubscribeComplete),
}

/// A protocol operation in flight.
pub(super) struct Request {
    pub id: PacketId,
    pub kind: RequestKind,
    /// Requests that make no sense after a channel loss (QoS 0 publishes,
    /// pings) are completed with `NotConnected` instead of being re-driven.
    pub discard_on_reconnect: bool,
    pub completion: Option<Completion>,
    /// Key of the armed operation timeout, if any. Present exactly when the
    /// timer wheel holds a live entry for this request.
    pub timeout_key: Option<delay_queue::Key>,
}

impl Request {
    /// Complete the request with an error. At most one completion ever fires.
    pub(super) fn complete_err(&mut self, err: ClientError) {
        match self.completion.take() {
            Some(Completion::Operation(callback)) => callback(self.id, Err(err)),
            Some(Completion::Subscribe(callback)) => callback(self.id, Err(err)),
            None => {}
        }
    }

    /// Complete an operation-style request successfully.
    pub(super) fn complete_ok(&mut self) {
        match self.completion.take() {
            Some(Completion::Operation(callback)) => callback(self.id, Ok(())),
            Some(Completion::Subscribe(callback)) => callback(self.id, Ok(Vec::new())),
            None => {}
        }
    }

    /// Complete a subscribe-style request with the broker's grants.
    pub(super) fn complete_suback(&mut self, grants: Vec<SubscribeReturnCode>) {
        match self.completion.take() {
            Some(Completion::Subscribe(callback)) => callback(self.id, Ok(grants)),
            Some(Completion::Operation(callback)) => callback(self.id, Ok(())),
            None => {}
        }
    }
}

/// Owner of all in-flight requests for one connection.
pub(super) struct RequestRegistry {
    outstanding: HashMap<PacketId, Request>,
    pending: VecDeque<PacketId>,
    ongoing: VecDeque<PacketId>,
    next_id: PacketId,
}

impl RequestRegistry {
    pub(super) fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
            pending: VecDeque::new(),
            ongoing: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Allocate an id, link the request into pending and register it in the
    /// outstanding table.
    ///
    /// # Errors
    /// [`ErrorKind::OutOfMemory`] when all 65535 ids are in flight.
    pub(super) fn create(
        &mut self,
        kind: RequestKind,
        completion: Option<Completion>,
        discard_on_reconnect: bool,
    ) -> Result<PacketId, ClientError> {
        let id = self.allocate_id()?;
        self.outstanding.insert(
            id,
            Request {
                id,
                kind,
                discard_on_reconnect,
                completion,
                timeout_key: None,
            },
        );
        self.pending.push_back(id);
        Ok(id)
    }

    /// Lowest free id ≥ 1, wrapping and skipping ids still outstanding.
    fn allocate_id(&mut self) -> Result<PacketId, ClientError> {
        if self.outstanding.len() >= usize::from(u16::MAX) {
            return Err(ClientError::new(ErrorKind::OutOfMemory));
        }
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.outstanding.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Detach the head of pending into ongoing for the send loop.
    pub(super) fn detach_next_pending(&mut self) -> Option<PacketId> {
        let id = self.pending.pop_front()?;
        self.ongoing.push_back(id);
        Some(id)
    }

    pub(super) fn get_mut(&mut self, id: PacketId) -> Option<&mut Request> {
        self.outstanding.get_mut(&id)
    }

    /// Remove a request from every structure; the caller runs its completion.
    pub(super) fn take(&mut self, id: PacketId) -> Option<Request> {
        let request = self.outstanding.remove(&id)?;
        self.pending.retain(|p| *p != id);
        self.ongoing.retain(|p| *p != id);
        Some(request)
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(super) fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Remove every request. Used for clean-session and teardown drains.
    pub(super) fn drain_all(&mut self) -> Vec<Request> {
        self.pending.clear();
        self.ongoing.clear();
        let mut drained: Vec<Request> = self.outstanding.drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.id);
        drained
    }

    /// Prepare the registry for a session-preserving reconnect: ongoing
    /// requests move back to the front of pending (QoS ≥ 1 publishes flagged
    /// as duplicates), and requests that must not be re-driven are removed
    /// and returned for completion with `NotConnected`.
    pub(super) fn drain_for_reconnect(&mut self) -> Vec<Request> {
        let mut dropped = Vec::new();

        let mut requeue = VecDeque::new();
        while let Some(id) = self.ongoing.pop_front() {
            let Some(request) = self.outstanding.get_mut(&id) else {
                continue;
            };
            if request.discard_on_reconnect {
                if let Some(request) = self.outstanding.remove(&id) {
                    dropped.push(request);
                }
            } else {
                if let RequestKind::Publish { qos, dup, .. } = &mut request.kind {
                    if *qos != QoS::Level0 {
                        *dup = true;
                    }
                }
                // Any armed timeout died with the channel's timer wheel
                request.timeout_key = None;
                requeue.push_back(id);
            }
        }

        while let Some(id) = self.pending.pop_front() {
            match self.outstanding.get(&id) {
                Some(request) if request.discard_on_reconnect => {
                    if let Some(request) = self.outstanding.remove(&id) {
                        dropped.push(request);
                    }
                }
                Some(_) => requeue.push_back(id),
                None => {}
            }
        }

        // Requests that had already been submitted precede ones that had not
        self.pending = requeue;
        dropped
    }

    /// Every outstanding id is in exactly one of pending or ongoing, and the
    /// table holds their union.
    #[cfg(test)]
    pub(super) fn invariants_hold(&self) -> bool {
        let queued = self.pending.len() + self.ongoing.len();
        if queued != self.outstanding.len() {
            return false;
        }
        self.outstanding.keys().all(|id| {
            let in_pending = self.pending.contains(id);
            let in_ongoing = self.ongoing.contains(id);
            in_pending != in_ongoing
        })
    }
}
