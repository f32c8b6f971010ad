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


//! DHT facade and put plumbing.
//!
//! The host transport provides a Kademlia-style DHT with registerable
//! record validators and selectors; the core only sees this trait. The
//! in-memory implementation mirrors the host's validator hooks so the
//! full write-validation path is exercised in tests.

mod putter;
mod republisher;

pub use putter::{put_json_record, put_record};
pub use republisher::DhtRepublisher;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// A registered validator rejected the write.
    #[error("{0}")]
    Validation(String),
    /// The local node has no live connections; the put was not issued.
    #[error("no connected peers")]
    NoConnectedPeers,
    /// The put query finished without a single peer accepting the record.
    #[error("no peer stored the record ({errors} query errors)")]
    NoPeerResponses { errors: usize },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("dht error: {0}")]
    Other(String),
}

/// One event from an iterative put query.
#[derive(Debug, Clone)]
pub enum PutQueryEvent {
    /// A remote peer acknowledged storing the record.
    PeerResponse { peer: String },
    /// A remote peer failed or rejected the record.
    QueryError { peer: String, message: String },
}

/// The slice of the host DHT the messaging core depends on.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Start an iterative put and surface its per-peer events. Local
    /// validation failures surface as an immediate error.
    async fn put_query(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<BoxStream<'static, PutQueryEvent>, DhtError>;

    /// Fetch the best locally known copy of a record.
    async fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, DhtError>;

    /// Number of live peer connections.
    async fn connected_peer_count(&self) -> usize;
}

/// Validator callbacks for one key namespace, in the shape the host DHT
/// registers them.
pub struct RecordRules {
    /// Key prefix the rules apply to.
    pub prefix: String,
    /// Gatekeeps every incoming PUT.
    pub validate: Box<dyn Fn(&[u8], &[u8]) -> Result<(), String> + Send + Sync>,
    /// Called when a record already exists; errors reject the overwrite.
    pub validate_update: Option<Box<dyn Fn(&[u8], &[u8], &[u8]) -> Result<(), String> + Send + Sync>>,
    /// Picks among competing copies of the same key.
    pub select: Option<Box<dyn Fn(&[u8], &[Vec<u8>]) -> usize + Send + Sync>>,
}

/// In-memory DHT with validator hooks, for local development and tests.
pub struct MemoryDht {
    store: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    rules: RwLock<Vec<Arc<RecordRules>>>,
    peers: RwLock<Vec<String>>,
    /// When false, simulated peers return query errors instead of
    /// acknowledgements.
    accept_puts: AtomicBool,
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDht {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            peers: RwLock::new(Vec::new()),
            accept_puts: AtomicBool::new(true),
        }
    }

    pub async fn register_rules(&self, rules: RecordRules) {
        self.rules.write().await.push(Arc::new(rules));
    }

    pub async fn add_peer(&self, peer_id: &str) {
        let mut peers = self.peers.write().await;
        if !peers.iter().any(|p| p == peer_id) {
            peers.push(peer_id.to_string());
        }
    }

    pub async fn clear_peers(&self) {
        self.peers.write().await.clear();
    }

    /// Test control: make simulated peers reject every put.
    pub fn set_accept_puts(&self, accept: bool) {
        self.accept_puts.store(accept, Ordering::SeqCst);
    }

    /// Test helper: raw record bytes currently stored for `key`.
    pub async fn raw_record(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.read().await.get(key).cloned()
    }

    async fn rules_for(&self, key: &[u8]) -> Option<Arc<RecordRules>> {
        let key_str = String::from_utf8_lossy(key).to_string();
        self.rules
            .read()
            .await
            .iter()
            .find(|r| key_str.starts_with(&r.prefix))
            .cloned()
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put_query(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<BoxStream<'static, PutQueryEvent>, DhtError> {
        if let Some(rules) = self.rules_for(&key).await {
            (rules.validate)(&key, &value).map_err(DhtError::Validation)?;
            if let Some(validate_update) = &rules.validate_update {
                if let Some(existing) = self.store.read().await.get(&key) {
                    validate_update(&key, existing, &value).map_err(DhtError::Validation)?;
                }
            }
        }
        self.store.write().await.insert(key, value);

        let accept = self.accept_puts.load(Ordering::SeqCst);
        let events: Vec<PutQueryEvent> = self
            .peers
            .read()
            .await
            .iter()
            .map(|peer| {
                if accept {
                    PutQueryEvent::PeerResponse { peer: peer.clone() }
                } else {
                    PutQueryEvent::QueryError {
                        peer: peer.clone(),
                        message: "put rejected".to_string(),
                    }
                }
            })
            .collect();
        Ok(stream::iter(events).boxed())
    }

    async fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, DhtError> {
        Ok(self.store.read().await.get(&key).cloned())
    }

    async fn connected_peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn put_runs_registered_validator() {
        let dht = MemoryDht::new();
        dht.add_peer("peer-b").await;
        dht.register_rules(RecordRules {
            prefix: "/guarded/".into(),
            validate: Box::new(|_, value| {
                if value == b"bad" {
                    Err("value rejected".into())
                } else {
                    Ok(())
                }
            }),
            validate_update: None,
            select: None,
        })
        .await;

        let err = dht
            .put_query(b"/guarded/x".to_vec(), b"bad".to_vec())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DhtError::Validation(_)));

        let mut events = dht
            .put_query(b"/guarded/x".to_vec(), b"good".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            events.next().await,
            Some(PutQueryEvent::PeerResponse { .. })
        ));
        assert_eq!(dht.raw_record(b"/guarded/x").await.unwrap(), b"good");
    }

    #[tokio::test]
    async fn update_hook_blocks_overwrite() {
        let dht = MemoryDht::new();
        dht.add_peer("peer-b").await;
        dht.register_rules(RecordRules {
            prefix: "/guarded/".into(),
            validate: Box::new(|_, _| Ok(())),
            validate_update: Some(Box::new(|_, existing, incoming| {
                if incoming.len() < existing.len() {
                    Err("stale record rejected".into())
                } else {
                    Ok(())
                }
            })),
            select: None,
        })
        .await;

        dht.put_query(b"/guarded/x".to_vec(), b"longer".to_vec())
            .await
            .unwrap();
        let err = dht
            .put_query(b"/guarded/x".to_vec(), b"sh".to_vec())
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "stale record rejected");
    }
}
