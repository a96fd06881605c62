//! Local topic fan-out.
//!
//! Maps a topic name to the local subscribers registered on it. `publish`
//! resolves every subscriber, `balance` resolves one chosen uniformly at
//! random. Subscribers are identified by a numeric id so the same value can
//! be registered on many topics.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::debug;

use crate::RouterError;

/// Topic name to subscriber mapping
pub struct TopicRouter<T> {
    topics: RwLock<HashMap<String, Vec<(u64, T)>>>,
}

impl<T: Clone> TopicRouter<T> {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Register subscriber `id` on `topic`.
    ///
    /// Returns `true` when this is the topic's first subscriber.
    pub async fn subscribe(&self, topic: &str, id: u64, value: T) -> Result<bool, RouterError> {
        let mut topics = self.topics.write().await;
        let subscribers = topics.entry(topic.to_string()).or_default();
        if subscribers.iter().any(|(existing, _)| *existing == id) {
            return Err(RouterError::AlreadySubscribed {
                topic: topic.to_string(),
                id,
            });
        }
        subscribers.push((id, value));
        debug!(topic, id, count = subscribers.len(), "Subscriber added");
        Ok(subscribers.len() == 1)
    }

    /// Remove subscriber `id` from `topic`.
    ///
    /// Returns `true` when the topic has no subscribers left.
    pub async fn unsubscribe(&self, topic: &str, id: u64) -> Result<bool, RouterError> {
        let mut topics = self.topics.write().await;
        let not_subscribed = || RouterError::NotSubscribed {
            topic: topic.to_string(),
            id,
        };

        let subscribers = topics.get_mut(topic).ok_or_else(not_subscribed)?;
        let index = subscribers
            .iter()
            .position(|(existing, _)| *existing == id)
            .ok_or_else(not_subscribed)?;
        subscribers.swap_remove(index);

        let empty = subscribers.is_empty();
        if empty {
            topics.remove(topic);
        }
        debug!(topic, id, "Subscriber removed");
        Ok(empty)
    }

    /// Every subscriber of `topic`, empty for unknown topics
    pub async fn publish(&self, topic: &str) -> Vec<T> {
        let topics = self.topics.read().await;
        match topics.get(topic) {
            Some(subscribers) => subscribers.iter().map(|(_, v)| v.clone()).collect(),
            None => {
                debug!(topic, "Publish to topic without subscribers");
                Vec::new()
            }
        }
    }

    /// One subscriber of `topic` chosen uniformly at random
    pub async fn balance(&self, topic: &str) -> Option<T> {
        let topics = self.topics.read().await;
        let chosen = topics
            .get(topic)
            .and_then(|subscribers| subscribers.choose(&mut rand::thread_rng()))
            .map(|(_, v)| v.clone());
        if chosen.is_none() {
            debug!(topic, "Balance to topic without subscribers");
        }
        chosen
    }

    /// Number of subscribers on `topic`
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Number of topics with at least one subscriber
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

impl<T: Clone> Default for TopicRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}
