//! In-process message bus.
//!
//! The [`Subscriber`] stands between the upstream feed and the connection
//! manager. It tracks which `(class, instance, recipient)` triples the server
//! listens to upstream, saves incoming messages to the store, and hands each
//! saved message to the manager together with the users it was delivered to.
//! Subscription changes made through the API are also announced here so the
//! manager can tell the user's other sockets.

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use parking_lot::RwLock;
use roost_types::{Message, MessageRecord, Subscription, User, downcase};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    manager::{BusEvent, ManagerHandle},
    store::{MessageStore, StoreError},
};

/// Upstream triple. `None` instance is the `*` wildcard.
type Triple = (String, Option<String>, String);

fn triple(subscription: &Subscription) -> Triple {
    (
        downcase(&subscription.class),
        subscription.instance.as_deref().map(downcase),
        subscription.recipient.clone(),
    )
}

pub struct Subscriber {
    store: Arc<dyn MessageStore>,
    manager: ManagerHandle,
    upstream: RwLock<BTreeSet<Triple>>,
    /// Held from id assignment until the message is queued for the manager,
    /// so message events arrive in id order.
    publish_lock: Mutex<()>,
}

impl Subscriber {
    pub fn new(store: Arc<dyn MessageStore>, manager: ManagerHandle) -> Arc<Self> {
        Arc::new(Self {
            store,
            manager,
            upstream: RwLock::new(BTreeSet::new()),
            publish_lock: Mutex::new(()),
        })
    }

    /// Listen for the given triples upstream. Returns how many were new.
    pub fn subscribe_to(&self, subscriptions: &[Subscription]) -> usize {
        let mut upstream = self.upstream.write();
        let added = subscriptions
            .iter()
            .filter(|sub| upstream.insert(triple(sub)))
            .count();
        debug!(added, total = upstream.len(), "Subscribed upstream");
        added
    }

    /// Drop every upstream subscription.
    pub fn cancel_subscriptions(&self) -> usize {
        let mut upstream = self.upstream.write();
        let count = upstream.len();
        upstream.clear();
        info!(count, "Cancelled upstream subscriptions");
        count
    }

    pub fn upstream_count(&self) -> usize {
        self.upstream.read().len()
    }

    fn is_subscribed(&self, record: &MessageRecord) -> bool {
        let class = downcase(&record.class);
        let instance = downcase(&record.instance);
        self.upstream.read().iter().any(|(c, i, r)| {
            *c == class
                && *r == record.recipient
                && i.as_ref().map(|i| *i == instance).unwrap_or(true)
        })
    }

    /// Accept a message from upstream. Messages outside the upstream
    /// subscriptions, or that no user is subscribed to, are dropped and
    /// `None` is returned.
    pub async fn publish(&self, mut record: MessageRecord) -> Result<Option<Message>, StoreError> {
        if !self.is_subscribed(&record) {
            debug!(class = %record.class, "Ignoring message outside upstream subscriptions");
            return Ok(None);
        }
        if record.receive_time == 0 {
            record.receive_time = Utc::now().timestamp_millis();
        }

        let _ordered = self.publish_lock.lock().await;
        let Some(delivery) = self.store.save_message(record).await? else {
            return Ok(None);
        };
        self.manager.publish(BusEvent::Message {
            message: delivery.message.clone(),
            user_ids: delivery.user_ids,
        });
        Ok(Some(delivery.message))
    }

    /// Subscribe `user` upstream and in the store, then announce it.
    pub async fn subscribe(
        &self,
        user: &User,
        client_id: Option<String>,
        subscriptions: Vec<Subscription>,
    ) -> Result<(), StoreError> {
        self.subscribe_to(&subscriptions);
        for sub in &subscriptions {
            self.store.add_user_subscription(user.id, sub).await?;
        }
        self.notify_subscribed(user, client_id, subscriptions);
        Ok(())
    }

    /// Remove a subscription from the store and announce it. The upstream
    /// triple stays; other users may share it.
    pub async fn unsubscribe(
        &self,
        user: &User,
        client_id: Option<String>,
        subscription: Subscription,
    ) -> Result<bool, StoreError> {
        let removed = self
            .store
            .remove_user_subscription(user.id, &subscription)
            .await?;
        self.notify_unsubscribed(user, client_id, subscription);
        Ok(removed)
    }

    pub fn notify_subscribed(
        &self,
        user: &User,
        client_id: Option<String>,
        subscriptions: Vec<Subscription>,
    ) {
        self.manager.publish(BusEvent::Subscribed {
            user: user.id,
            client_id,
            subs: subscriptions,
        });
    }

    pub fn notify_unsubscribed(&self, user: &User, client_id: Option<String>, subscription: Subscription) {
        self.manager.publish(BusEvent::Unsubscribed {
            user: user.id,
            client_id,
            sub: subscription,
        });
    }
}
