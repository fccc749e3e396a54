//! Pub/sub topic backed by a broadcast channel.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::access::{AccessPolicy, Permission, Principal, Resource};
use crate::error::NotifyError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Messages retained for late readers.
const HISTORY_LIMIT: usize = 100;

/// A published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub subject: String,
    pub body: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// A named pub/sub topic.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: TopicMessage) -> Result<(), NotifyError>;
}

/// In-process topic: fan-out to subscribers plus a bounded history.
pub struct BroadcastTopic {
    name: String,
    tx: broadcast::Sender<TopicMessage>,
    history: RwLock<VecDeque<TopicMessage>>,
}

impl BroadcastTopic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            tx,
            history: RwLock::new(VecDeque::new()),
        })
    }

    /// Subscribe to messages published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }

    /// Recently published messages, oldest first.
    pub async fn history(&self) -> Vec<TopicMessage> {
        self.history.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Topic for BroadcastTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: TopicMessage) -> Result<(), NotifyError> {
        {
            let mut history = self.history.write().await;
            history.push_back(message.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        info!(topic = %self.name, subject = %message.subject, "Published to topic");

        // ok if nobody is subscribed; history keeps it
        if self.tx.send(message).is_err() {
            debug!(topic = %self.name, "No live subscribers");
        }
        Ok(())
    }
}

/// A topic seen through one principal's grants.
#[derive(Clone)]
pub struct TopicHandle {
    topic: Arc<dyn Topic>,
    policy: Arc<AccessPolicy>,
    principal: Principal,
}

impl TopicHandle {
    pub fn new(topic: Arc<dyn Topic>, policy: Arc<AccessPolicy>, principal: Principal) -> Self {
        Self {
            topic,
            policy,
            principal,
        }
    }

    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    pub async fn publish(&self, subject: &str, body: serde_json::Value) -> Result<(), NotifyError> {
        self.policy.authorize(
            self.principal,
            Permission::TopicPublish,
            &Resource::Topic(self.topic.name()),
        )?;
        self.topic
            .publish(TopicMessage {
                subject: subject.to_string(),
                body,
                published_at: Utc::now(),
            })
            .await
    }
}
