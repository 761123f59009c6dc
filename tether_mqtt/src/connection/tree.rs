// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Subscription storage and wildcard dispatch.
//!
//! Subscriptions live in a radix tree keyed by `/`-separated filter levels,
//! with `+` and `#` stored as ordinary levels and given their wildcard
//! meaning at dispatch time. Batch mutations go through [`TreeTransaction`]
//! so a multi-topic subscribe either fully applies or fully rolls back.

use std::collections::HashMap;

use super::PublishHandler;
use crate::control_packet::{Publication, QoS};
use crate::topic::{TopicFilter, TopicName};

/// MQTT topic multi-level wildcard
const MULTI_LEVEL_WILDCARD: &str = "#";
/// MQTT topic single-level wildcard
const SINGLE_LEVEL_WILDCARD: &str = "+";

/// An active subscription.
pub(super) struct Subscription {
    pub filter: TopicFilter,
    pub qos: QoS,
    pub handler: Option<PublishHandler>,
    /// Local subscriptions route matched publications without ever sending
    /// SUBSCRIBE to the broker.
    pub local: bool,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    subscription: Option<Subscription>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscription.is_none()
    }
}

/// Radix tree of active subscriptions.
#[derive(Default)]
pub(super) struct SubscriptionTree {
    root: Node,
    len: usize,
}

impl SubscriptionTree {
    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a subscription, replacing (and returning) any existing entry
    /// for the same filter.
    pub(super) fn insert(&mut self, subscription: Subscription) -> Option<Subscription> {
        let mut node = &mut self.root;
        for level in subscription.filter.levels() {
            node = node.children.entry(level.clone()).or_default();
        }
        let previous = node.subscription.replace(subscription);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Remove the subscription for an exact filter, pruning empty branches.
    pub(super) fn remove(&mut self, filter: &TopicFilter) -> Option<Subscription> {
        fn remove_at(node: &mut Node, levels: &[String]) -> Option<Subscription> {
            match levels.split_first() {
                None => node.subscription.take(),
                Some((head, rest)) => {
                    let child = node.children.get_mut(head)?;
                    let removed = remove_at(child, rest);
                    if removed.is_some() && child.is_empty() {
                        node.children.remove(head);
                    }
                    removed
                }
            }
        }
        let removed = remove_at(&mut self.root, filter.levels());
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub(super) fn contains(&self, filter: &TopicFilter) -> bool {
        let mut node = &self.root;
        for level in filter.levels() {
            match node.children.get(level) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.subscription.is_some()
    }

    /// Invoke the handler of every subscription whose filter matches the
    /// topic. Returns the number of handlers invoked.
    pub(super) fn dispatch(&mut self, topic: &TopicName, publication: &Publication) -> usize {
        fn fire(subscription: &mut Subscription, publication: &Publication, hits: &mut usize) {
            if let Some(handler) = subscription.handler.as_mut() {
                handler(publication);
                *hits += 1;
            }
        }

        fn walk(node: &mut Node, levels: &[String], publication: &Publication, hits: &mut usize) {
            // A `#` child matches everything from here down, including the
            // parent level itself
            if let Some(multi) = node.children.get_mut(MULTI_LEVEL_WILDCARD) {
                if let Some(subscription) = multi.subscription.as_mut() {
                    fire(subscription, publication, hits);
                }
            }
            match levels.split_first() {
                None => {
                    if let Some(subscription) = node.subscription.as_mut() {
                        fire(subscription, publication, hits);
                    }
                }
                Some((head, rest)) => {
                    if let Some(child) = node.children.get_mut(head.as_str()) {
                        walk(child, rest, publication, hits);
                    }
                    if let Some(child) = node.children.get_mut(SINGLE_LEVEL_WILDCARD) {
                        walk(child, rest, publication, hits);
                    }
                }
            }
        }

        let mut hits = 0;
        walk(&mut self.root, topic.levels(), publication, &mut hits);
        hits
    }

    /// Filters of every non-local subscription, for resubscribe-all.
    pub(super) fn remote_filters(&self) -> Vec<(TopicFilter, QoS)> {
        fn collect(node: &Node, out: &mut Vec<(TopicFilter, QoS)>) {
            if let Some(subscription) = &node.subscription {
                if !subscription.local {
                    out.push((subscription.filter.clone(), subscription.qos));
                }
            }
            for child in node.children.values() {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        out
    }

    /// All filters currently in the tree, sorted. Used for equality checks.
    #[cfg(test)]
    pub(super) fn all_filters(&self) -> Vec<String> {
        fn collect(node: &Node, out: &mut Vec<String>) {
            if let Some(subscription) = &node.subscription {
                out.push(subscription.filter.as_str().to_string());
            }
            for child in node.children.values() {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out.sort();
        out
    }
}

/// Journaled batch mutation: either [`commit`](TreeTransaction::commit) keeps
/// every staged change, or [`roll_back`](TreeTransaction::roll_back) undoes
/// them in reverse order.
pub(super) struct TreeTransaction<'a> {
    tree: &'a mut SubscriptionTree,
    journal: Vec<Action>,
}

enum Action {
    Inserted {
        filter: TopicFilter,
        previous: Option<Subscription>,
    },
    Removed {
        subscription: Subscription,
    },
}

impl<'a> TreeTransaction<'a> {
    pub(super) fn begin(tree: &'a mut SubscriptionTree) -> Self {
        Self {
            tree,
            journal: Vec::new(),
        }
    }

    /// Stage an insert.
    pub(super) fn insert(&mut self, subscription: Subscription) {
        let filter = subscription.filter.clone();
        let previous = self.tree.insert(subscription);
        self.journal.push(Action::Inserted { filter, previous });
    }

    /// Stage a removal. Returns whether the removed entry was a local
    /// subscription, or `None` if the filter was not in the tree.
    pub(super) fn remove(&mut self, filter: &TopicFilter) -> Option<bool> {
        let removed = self.tree.remove(filter)?;
        let local = removed.local;
        self.journal.push(Action::Removed {
            subscription: removed,
        });
        Some(local)
    }

    /// Keep every staged change.
    pub(super) fn commit(self) {}

    /// Undo every staged change, newest first.
    pub(super) fn roll_back(self) {
        let TreeTransaction { tree, journal } = self;
        for action in journal.into_iter().rev() {
            match action {
                Action::Inserted { filter, previous } => {
                    tree.remove(&filter);
                    if let Some(previous) = previous {
                        tree.insert(previous);
                    }
                }
                Action::Removed { subscription } => {
                    tree.insert(subscription);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    fn subscription(filter: &str, hits: &Arc<AtomicUsize>) -> Subscription {
        let hits = hits.clone();
        Subscription {
            filter: TopicFilter::from_str(filter).unwrap(),
            qos: QoS::Level1,
            handler: Some(Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })),
            local: false,
        }
    }

    fn publication(topic: &str) -> Publication {
        Publication {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"payload"),
            qos: QoS::Level0,
            retain: false,
            dup: false,
        }
    }

    fn dispatch(tree: &mut SubscriptionTree, topic: &str) -> usize {
        let topic = TopicName::from_str(topic).unwrap();
        tree.dispatch(&topic, &publication(topic.as_str()))
    }

    #[test]
    fn exact_and_wildcard_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        tree.insert(subscription("sport/tennis/player1", &hits));
        tree.insert(subscription("sport/+/player1", &hits));
        tree.insert(subscription("sport/#", &hits));
        tree.insert(subscription("finance/#", &hits));
        assert_eq!(tree.len(), 4);

        assert_eq!(dispatch(&mut tree, "sport/tennis/player1"), 3);
        assert_eq!(dispatch(&mut tree, "sport/hockey/player1"), 2);
        assert_eq!(dispatch(&mut tree, "sport"), 1);
        assert_eq!(dispatch(&mut tree, "news"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        assert!(tree.insert(subscription("a/b", &hits)).is_none());
        assert!(tree.insert(subscription("a/b", &hits)).is_some());
        assert_eq!(tree.len(), 1);
        assert_eq!(dispatch(&mut tree, "a/b"), 1);
    }

    #[test]
    fn remove_prunes_empty_branches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        tree.insert(subscription("a/b/c", &hits));
        tree.insert(subscription("a/d", &hits));

        let filter = TopicFilter::from_str("a/b/c").unwrap();
        assert!(tree.remove(&filter).is_some());
        assert!(tree.remove(&filter).is_none());
        assert_eq!(tree.len(), 1);
        assert!(!tree.root.children["a"].children.contains_key("b"));
        assert!(tree.contains(&TopicFilter::from_str("a/d").unwrap()));
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_prior_tree() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        tree.insert(subscription("keep/this", &hits));
        let before = tree.all_filters();

        tree.insert(subscription("fleeting/+", &hits));
        tree.remove(&TopicFilter::from_str("fleeting/+").unwrap());
        assert_eq!(tree.all_filters(), before);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn transaction_commit_keeps_changes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        let mut txn = TreeTransaction::begin(&mut tree);
        txn.insert(subscription("x/1", &hits));
        txn.insert(subscription("x/2", &hits));
        txn.commit();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn transaction_rollback_restores_prior_tree() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        tree.insert(subscription("x/1", &hits));
        let before = tree.all_filters();

        let mut txn = TreeTransaction::begin(&mut tree);
        txn.insert(subscription("x/2", &hits));
        txn.insert(subscription("x/1", &hits)); // replaces the existing entry
        txn.remove(&TopicFilter::from_str("x/1").unwrap());
        txn.roll_back();

        assert_eq!(tree.all_filters(), before);
        assert_eq!(tree.len(), 1);
        // The surviving entry is the original, still wired to the counter
        assert_eq!(dispatch(&mut tree, "x/1"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transaction_remove_reports_local_flag() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        let mut local = subscription("quiet/topic", &hits);
        local.local = true;
        tree.insert(local);

        let mut txn = TreeTransaction::begin(&mut tree);
        assert_eq!(
            txn.remove(&TopicFilter::from_str("quiet/topic").unwrap()),
            Some(true)
        );
        assert_eq!(txn.remove(&TopicFilter::from_str("absent").unwrap()), None);
        txn.commit();
        assert!(tree.is_empty());
    }

    #[test]
    fn remote_filters_skip_local_subscriptions() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tree = SubscriptionTree::default();
        tree.insert(subscription("remote/a", &hits));
        let mut local = subscription("local/b", &hits);
        local.local = true;
        tree.insert(local);

        let filters = tree.remote_filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].0.as_str(), "remote/a");
    }
}
