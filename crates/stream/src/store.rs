//! Message storage.
//!
//! [`MessageStore`] is the durable side of delivery: it assigns message ids,
//! remembers which users a message was delivered to, answers bounded history
//! queries and keeps each user's subscription list. [`MemoryStore`] is a
//! thread-safe in-memory implementation.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use roost_types::{Message, MessageId, MessageRecord, Subscription, UserId, downcase};
use tracing::{debug, info};

use crate::filter::Filter;

/// Hard cap on the number of messages returned by one query.
pub const MAX_MESSAGES_RETURNED: u64 = 100;

/// Error types for store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),
}

/// Options for a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Requested number of messages; capped by the store
    pub limit: u64,
    /// Walk backwards from the anchor instead of forwards
    pub reverse: bool,
}

impl QueryOptions {
    pub fn forward(limit: u64) -> Self {
        Self {
            limit,
            reverse: false,
        }
    }

    pub fn reverse(limit: u64) -> Self {
        Self {
            limit,
            reverse: true,
        }
    }
}

/// Result of a history query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Messages in query order: ascending ids forward, descending in reverse
    pub messages: Vec<Message>,
    /// No further matching messages existed in the query direction
    pub is_done: bool,
}

/// A saved message and the users whose subscriptions covered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    pub user_ids: Vec<UserId>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages delivered to `user` that match `filter`, strictly after
    /// `after` (or strictly before it, in reverse).
    async fn get_messages(
        &self,
        user: UserId,
        after: MessageId,
        filter: &Filter,
        options: QueryOptions,
    ) -> Result<QueryResult, StoreError>;

    /// Persist a message for every user subscribed to it. Returns `None`
    /// when nobody is subscribed; such messages are not stored.
    async fn save_message(&self, record: MessageRecord) -> Result<Option<Delivery>, StoreError>;

    /// Returns false if an equivalent subscription already existed.
    async fn add_user_subscription(
        &self,
        user: UserId,
        subscription: &Subscription,
    ) -> Result<bool, StoreError>;

    /// Returns false if no matching subscription existed.
    async fn remove_user_subscription(
        &self,
        user: UserId,
        subscription: &Subscription,
    ) -> Result<bool, StoreError>;

    async fn get_user_subscriptions(&self, user: UserId) -> Result<Vec<Subscription>, StoreError>;

    /// Distinct subscription keys across all users, for the upstream feed.
    async fn load_active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;
}

/// Case-folded identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SubscriptionKey {
    class: String,
    instance: Option<String>,
    recipient: String,
}

impl SubscriptionKey {
    fn of(subscription: &Subscription) -> Self {
        Self {
            class: downcase(&subscription.class),
            instance: subscription.instance.as_deref().map(downcase),
            recipient: subscription.recipient.clone(),
        }
    }

    fn into_subscription(self) -> Subscription {
        Subscription::new(self.class, self.instance, self.recipient)
    }
}

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<MessageId, Message>,
    /// Per-user delivery index
    user_messages: HashMap<UserId, BTreeSet<MessageId>>,
    subscriptions: HashMap<UserId, Vec<Subscription>>,
    last_id: MessageId,
}

/// In-memory message store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    max_messages_returned: u64,
}

impl MemoryStore {
    /// Create an empty store with the default result cap.
    pub fn new() -> Arc<Self> {
        Self::with_max_messages(MAX_MESSAGES_RETURNED)
    }

    /// Create an empty store returning at most `max` messages per query.
    pub fn with_max_messages(max: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            max_messages_returned: max.max(1),
        })
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_messages(
        &self,
        user: UserId,
        after: MessageId,
        filter: &Filter,
        options: QueryOptions,
    ) -> Result<QueryResult, StoreError> {
        let limit = options.limit.min(self.max_messages_returned);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let inner = self.inner.read();
        let Some(ids) = inner.user_messages.get(&user) else {
            return Ok(QueryResult {
                messages: Vec::new(),
                is_done: true,
            });
        };

        let matching = |id: &MessageId| {
            inner
                .messages
                .get(id)
                .filter(|m| filter.matches(&m.record))
                .cloned()
        };
        // One extra row tells whether the query reached the end.
        let mut messages: Vec<Message> = if options.reverse {
            ids.range(..after)
                .rev()
                .filter_map(matching)
                .take(limit.saturating_add(1))
                .collect()
        } else {
            ids.range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .filter_map(matching)
                .take(limit.saturating_add(1))
                .collect()
        };

        let is_done = messages.len() <= limit;
        messages.truncate(limit);
        debug!(
            user,
            after,
            reverse = options.reverse,
            count = messages.len(),
            is_done,
            "Queried messages"
        );
        Ok(QueryResult { messages, is_done })
    }

    async fn save_message(&self, record: MessageRecord) -> Result<Option<Delivery>, StoreError> {
        let mut inner = self.inner.write();

        let mut user_ids: Vec<UserId> = inner
            .subscriptions
            .iter()
            .filter(|(_, subs)| subs.iter().any(|sub| sub.covers(&record)))
            .map(|(user, _)| *user)
            .collect();
        if user_ids.is_empty() {
            debug!(class = %record.class, instance = %record.instance, "Dropping message with no subscribers");
            return Ok(None);
        }
        user_ids.sort_unstable();

        inner.last_id += 1;
        let message = Message {
            id: inner.last_id,
            record,
        };
        inner.messages.insert(message.id, message.clone());
        for user in &user_ids {
            inner
                .user_messages
                .entry(*user)
                .or_default()
                .insert(message.id);
        }

        debug!(id = message.id, users = user_ids.len(), "Saved message");
        Ok(Some(Delivery { message, user_ids }))
    }

    async fn add_user_subscription(
        &self,
        user: UserId,
        subscription: &Subscription,
    ) -> Result<bool, StoreError> {
        if subscription.class.is_empty() {
            return Err(StoreError::InvalidSubscription(
                "class must not be empty".to_string(),
            ));
        }
        let key = SubscriptionKey::of(subscription);
        let mut inner = self.inner.write();
        let subs = inner.subscriptions.entry(user).or_default();
        if subs.iter().any(|sub| SubscriptionKey::of(sub) == key) {
            return Ok(false);
        }
        subs.push(subscription.clone());
        info!(user, class = %subscription.class, "Added subscription");
        Ok(true)
    }

    async fn remove_user_subscription(
        &self,
        user: UserId,
        subscription: &Subscription,
    ) -> Result<bool, StoreError> {
        let key = SubscriptionKey::of(subscription);
        let mut inner = self.inner.write();
        let Some(subs) = inner.subscriptions.get_mut(&user) else {
            return Ok(false);
        };
        let before = subs.len();
        subs.retain(|sub| SubscriptionKey::of(sub) != key);
        let removed = subs.len() != before;
        if subs.is_empty() {
            inner.subscriptions.remove(&user);
        }
        if removed {
            info!(user, class = %subscription.class, "Removed subscription");
        }
        Ok(removed)
    }

    async fn get_user_subscriptions(&self, user: UserId) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .subscriptions
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.read();
        let keys: BTreeSet<SubscriptionKey> = inner
            .subscriptions
            .values()
            .flatten()
            .map(SubscriptionKey::of)
            .collect();
        Ok(keys
            .into_iter()
            .map(SubscriptionKey::into_subscription)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: &str, instance: &str, recipient: &str) -> MessageRecord {
        MessageRecord {
            class: class.to_string(),
            instance: instance.to_string(),
            sender: "alice@ATHENA.MIT.EDU".to_string(),
            recipient: recipient.to_string(),
            realm: "ATHENA.MIT.EDU".to_string(),
            opcode: String::new(),
            signature: String::new(),
            message: "hi".to_string(),
            time: 0,
            receive_time: 0,
            auth: 1,
        }
    }

    fn ids(result: &QueryResult) -> Vec<MessageId> {
        result.messages.iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn test_save_fans_out_to_subscribers() {
        let store = MemoryStore::new();
        store
            .add_user_subscription(1, &Subscription::new("help", None, ""))
            .await
            .unwrap();
        store
            .add_user_subscription(2, &Subscription::new("HELP", Some("Test".into()), ""))
            .await
            .unwrap();

        let delivery = store
            .save_message(record("Help", "test", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.id, 1);
        assert_eq!(delivery.user_ids, vec![1, 2]);

        let delivery = store
            .save_message(record("help", "other", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.user_ids, vec![1]);

        // Nobody subscribed: nothing stored.
        assert_eq!(store.save_message(record("misc", "x", "")).await.unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_queries_are_scoped_to_user() {
        let store = MemoryStore::new();
        store
            .add_user_subscription(1, &Subscription::new("help", None, ""))
            .await
            .unwrap();
        store
            .add_user_subscription(2, &Subscription::new("other", None, ""))
            .await
            .unwrap();
        store.save_message(record("help", "a", "")).await.unwrap();
        store.save_message(record("other", "a", "")).await.unwrap();
        store.save_message(record("help", "b", "")).await.unwrap();

        let result = store
            .get_messages(1, 0, &Filter::default(), QueryOptions::forward(10))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![1, 3]);
        assert!(result.is_done);

        let result = store
            .get_messages(3, 0, &Filter::default(), QueryOptions::forward(10))
            .await
            .unwrap();
        assert!(result.messages.is_empty());
        assert!(result.is_done);
    }

    #[tokio::test]
    async fn test_forward_and_reverse_bounds() {
        let store = MemoryStore::new();
        store
            .add_user_subscription(1, &Subscription::new("help", None, ""))
            .await
            .unwrap();
        for _ in 0..5 {
            store.save_message(record("help", "a", "")).await.unwrap();
        }

        let result = store
            .get_messages(1, 2, &Filter::default(), QueryOptions::forward(2))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![3, 4]);
        assert!(!result.is_done);

        let result = store
            .get_messages(1, 3, &Filter::default(), QueryOptions::forward(2))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![4, 5]);
        assert!(result.is_done);

        let result = store
            .get_messages(1, 4, &Filter::default(), QueryOptions::reverse(10))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![3, 2, 1]);
        assert!(result.is_done);
    }

    #[tokio::test]
    async fn test_filter_applies_to_queries() {
        let store = MemoryStore::new();
        store
            .add_user_subscription(1, &Subscription::new("help", None, ""))
            .await
            .unwrap();
        store.save_message(record("help", "a", "")).await.unwrap();
        store.save_message(record("help", "b", "")).await.unwrap();
        store.save_message(record("help", "A", "")).await.unwrap();

        let filter = Filter::new(Some("HELP"), Some("a"), None);
        let result = store
            .get_messages(1, 0, &filter, QueryOptions::forward(10))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_result_cap() {
        let store = MemoryStore::with_max_messages(3);
        store
            .add_user_subscription(1, &Subscription::new("help", None, ""))
            .await
            .unwrap();
        for _ in 0..5 {
            store.save_message(record("help", "a", "")).await.unwrap();
        }

        let result = store
            .get_messages(1, 0, &Filter::default(), QueryOptions::forward(1000))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec![1, 2, 3]);
        assert!(!result.is_done);
    }

    #[tokio::test]
    async fn test_subscription_crud_is_case_insensitive() {
        let store = MemoryStore::new();
        let wildcard = Subscription::new("Help", None, "");
        let exact = Subscription::new("help", Some("Test".into()), "");

        assert!(store.add_user_subscription(1, &wildcard).await.unwrap());
        assert!(!store
            .add_user_subscription(1, &Subscription::new("HELP", None, ""))
            .await
            .unwrap());
        assert!(store.add_user_subscription(1, &exact).await.unwrap());
        assert!(store.add_user_subscription(2, &exact).await.unwrap());

        // Stored as given
        assert_eq!(
            store.get_user_subscriptions(1).await.unwrap(),
            vec![wildcard.clone(), exact.clone()]
        );

        // Wildcard and exact instance are distinct subscriptions.
        assert!(store
            .remove_user_subscription(1, &Subscription::new("HELP", None, ""))
            .await
            .unwrap());
        assert_eq!(store.get_user_subscriptions(1).await.unwrap(), vec![exact]);
        assert!(!store.remove_user_subscription(1, &wildcard).await.unwrap());

        // Deduplicated and case-folded across users
        assert_eq!(
            store.load_active_subscriptions().await.unwrap(),
            vec![Subscription::new("help", Some("test".into()), "")]
        );
    }

    #[tokio::test]
    async fn test_empty_class_rejected() {
        let store = MemoryStore::new();
        let result = store
            .add_user_subscription(1, &Subscription::new("", None, ""))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidSubscription(_))));
    }
}
