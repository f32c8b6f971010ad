// Copyright (c) 2025 Saorsa Labs Limited

// This file is part of the Saorsa P2P network.

// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Gossip pubsub facade.
//!
//! The host transport provides topic-based gossip with
//! subscribe/unsubscribe/publish; publish reports which remote peers
//! received the message. `emitSelf` semantics are tolerated — the group
//! receive path drops its own echoes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, thiserror::Error)]
pub enum PubsubError {
    /// The topic had no remote subscribers; nothing left the node.
    #[error("PublishError.NoPeersSubscribedToTopic")]
    NoPeersSubscribed,
    #[error("pubsub error: {0}")]
    Other(String),
}

/// An incoming pubsub frame.
#[derive(Debug, Clone)]
pub struct PubsubMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub from: String,
}

/// Result of a publish that reached the mesh.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// Remote peers the message was handed to.
    pub recipients: Vec<String>,
}

/// The slice of the host pubsub the messaging core depends on.
#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), PubsubError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), PubsubError>;
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<PublishOutcome, PubsubError>;
    async fn topics(&self) -> Vec<String>;
    /// Subscribe to the node's incoming message firehose.
    fn messages(&self) -> broadcast::Receiver<PubsubMessage>;
}

type TopicMap = HashMap<String, HashMap<String, broadcast::Sender<PubsubMessage>>>;

/// Shared mesh connecting `MemoryPubsub` nodes in one process.
pub struct MemoryPubsubHub {
    topics: RwLock<TopicMap>,
}

impl MemoryPubsubHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
        })
    }

    /// Create a node attached to this hub.
    pub fn node(self: &Arc<Self>, peer_id: &str, emit_self: bool) -> MemoryPubsub {
        let (tx, _) = broadcast::channel(256);
        MemoryPubsub {
            peer_id: peer_id.to_string(),
            emit_self,
            hub: Arc::clone(self),
            tx,
            subscribed: RwLock::new(HashSet::new()),
        }
    }
}

/// In-memory pubsub node, for local development and tests.
pub struct MemoryPubsub {
    peer_id: String,
    emit_self: bool,
    hub: Arc<MemoryPubsubHub>,
    tx: broadcast::Sender<PubsubMessage>,
    subscribed: RwLock<HashSet<String>>,
}

#[async_trait]
impl Pubsub for MemoryPubsub {
    async fn subscribe(&self, topic: &str) -> Result<(), PubsubError> {
        self.subscribed.write().await.insert(topic.to_string());
        self.hub
            .topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(self.peer_id.clone(), self.tx.clone());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PubsubError> {
        self.subscribed.write().await.remove(topic);
        let mut topics = self.hub.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&self.peer_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<PublishOutcome, PubsubError> {
        let message = PubsubMessage {
            topic: topic.to_string(),
            data,
            from: self.peer_id.clone(),
        };

        let topics = self.hub.topics.read().await;
        let subscribers = topics.get(topic);

        let mut recipients = Vec::new();
        if let Some(subscribers) = subscribers {
            for (peer, tx) in subscribers {
                if peer == &self.peer_id {
                    continue;
                }
                let _ = tx.send(message.clone());
                recipients.push(peer.clone());
            }
            if self.emit_self && subscribers.contains_key(&self.peer_id) {
                let _ = self.tx.send(message.clone());
            }
        }

        if recipients.is_empty() {
            return Err(PubsubError::NoPeersSubscribed);
        }
        Ok(PublishOutcome { recipients })
    }

    async fn topics(&self) -> Vec<String> {
        self.subscribed.read().await.iter().cloned().collect()
    }

    fn messages(&self) -> broadcast::Receiver<PubsubMessage> {
        self.tx.subscribe()
    }
}
