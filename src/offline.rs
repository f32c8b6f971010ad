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


//! Offline bucket manager.
//!
//! Owns the read-modify-write cycle of the local node's per-sender
//! offline buckets: load the current store, drop expired entries, insert
//! or remove messages, bump the version, re-sign the envelope and push
//! the gzipped record back into the DHT. Updated buckets are handed to
//! the republisher so they outlive DHT record TTLs.

use std::sync::Arc;

use chrono::Utc;
use kiyeovo_dht::{
    DhtSchemaError, OfflineBucketKey, OfflineMessage, OfflineMessageSignedPayload, StoreEnvelope,
    StoreLimits, StoreSignedPayload, validate_store, validate_store_update,
};
use tracing::{debug, info, warn};

use crate::PeerIdentity;
use crate::config::GroupConfig;
use crate::crypto::{b64_encode, sha256_b64};
use crate::dht::{Dht, DhtError, DhtRepublisher, MemoryDht, RecordRules, put_record};

#[derive(Debug, thiserror::Error)]
pub enum OfflineError {
    #[error("schema error: {0}")]
    Schema(#[from] DhtSchemaError),
    #[error("dht error: {0}")]
    Dht(#[from] DhtError),
}

/// A message to park in one of the local node's buckets.
#[derive(Debug, Clone)]
pub struct OutgoingOffline {
    pub message_id: String,
    /// Ciphertext (or signed message JSON) the recipient will process.
    pub content: Vec<u8>,
    /// Opaque sender info blob, encrypted by the caller.
    pub sender_info: Vec<u8>,
    pub expires_at: i64,
    /// Sender's highest group sequence at write time, if applicable.
    pub highest_seq: Option<u64>,
}

/// Mutates and publishes the local node's offline buckets.
pub struct OfflineBucketManager {
    dht: Arc<dyn Dht>,
    republisher: Arc<DhtRepublisher>,
    identity: Arc<PeerIdentity>,
    config: GroupConfig,
}

impl OfflineBucketManager {
    pub fn new(
        dht: Arc<dyn Dht>,
        republisher: Arc<DhtRepublisher>,
        identity: Arc<PeerIdentity>,
        config: GroupConfig,
    ) -> Self {
        Self {
            dht,
            republisher,
            identity,
            config,
        }
    }

    /// DHT key of the local node's bucket in `scope`.
    pub fn bucket_key(&self, scope: &str) -> String {
        OfflineBucketKey::key_string(scope, &self.identity.verifying_key())
    }

    /// Insert `outgoing` into the bucket for `scope`, re-signing and
    /// publishing the updated store.
    pub async fn store_message(
        &self,
        scope: &str,
        outgoing: OutgoingOffline,
    ) -> Result<(), OfflineError> {
        let key_str = self.bucket_key(scope);
        let now = Utc::now().timestamp_millis();

        let existing = self.load_own_bucket(&key_str).await;
        let (prev_version, prev_highest_seq, mut messages) = match existing {
            Some(env) => (
                env.version,
                env.store_signed_payload.highest_seq,
                env.messages,
            ),
            None => (0, None, Vec::new()),
        };

        // Expired entries never survive a rewrite.
        messages.retain(|m| {
            m.signed_payload.expires_at > now
                && now - m.signed_payload.timestamp <= self.config.message_ttl_ms
        });
        messages.retain(|m| m.id != outgoing.message_id);

        let mut message = OfflineMessage {
            id: outgoing.message_id.clone(),
            content: b64_encode(&outgoing.content),
            sender_info: b64_encode(&outgoing.sender_info),
            signed_payload: OfflineMessageSignedPayload {
                message_id: outgoing.message_id,
                bucket_key: key_str.clone(),
                content_hash: sha256_b64(&outgoing.content),
                sender_info_hash: sha256_b64(&outgoing.sender_info),
                timestamp: now,
                expires_at: outgoing.expires_at,
            },
            signature: String::new(),
        };
        message.seal(self.identity.signing_key())?;
        messages.push(message);

        // Oldest entries make room once the cap is hit.
        while messages.len() > self.config.max_messages_per_store {
            let oldest = messages
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.signed_payload.timestamp)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    let evicted = messages.remove(i);
                    warn!(id = %evicted.id, bucket = %key_str, "bucket full, evicting oldest message");
                }
                None => break,
            }
        }

        let highest_seq = match (outgoing.highest_seq, prev_highest_seq) {
            (Some(new), Some(old)) => Some(new.max(old)),
            (new, old) => new.or(old),
        };
        self.publish_envelope(&key_str, messages, prev_version + 1, now, highest_seq)
            .await?;
        Ok(())
    }

    /// Drop delivered messages from the bucket for `scope` and publish
    /// the shrunken store. A missing bucket is a no-op.
    pub async fn remove_messages(&self, scope: &str, ids: &[String]) -> Result<(), OfflineError> {
        let key_str = self.bucket_key(scope);
        let Some(envelope) = self.load_own_bucket(&key_str).await else {
            return Ok(());
        };

        let before = envelope.messages.len();
        let mut messages = envelope.messages;
        messages.retain(|m| !ids.contains(&m.id));
        if messages.len() == before {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        self.publish_envelope(
            &key_str,
            messages,
            envelope.version + 1,
            now,
            envelope.store_signed_payload.highest_seq,
        )
        .await?;
        Ok(())
    }

    /// Fetch and validate another sender's bucket in `scope`, returning
    /// its pending messages.
    pub async fn fetch_from(
        &self,
        scope: &str,
        sender: &ed25519_dalek::VerifyingKey,
    ) -> Result<Vec<OfflineMessage>, OfflineError> {
        let key_str = OfflineBucketKey::key_string(scope, sender);
        let Some(raw) = self.dht.get(key_str.clone().into_bytes()).await? else {
            return Ok(Vec::new());
        };
        let now = Utc::now().timestamp_millis();
        let envelope = validate_store(
            key_str.as_bytes(),
            &raw,
            now,
            self.config.store_limits(),
        )?;
        Ok(envelope.messages)
    }

    async fn load_own_bucket(&self, key_str: &str) -> Option<StoreEnvelope> {
        let raw = self
            .dht
            .get(key_str.as_bytes().to_vec())
            .await
            .ok()
            .flatten()?;
        match StoreEnvelope::decode(&raw) {
            Ok(env) => Some(env),
            Err(e) => {
                warn!(bucket = %key_str, error = %e, "ignoring unreadable bucket copy");
                None
            }
        }
    }

    async fn publish_envelope(
        &self,
        key_str: &str,
        messages: Vec<OfflineMessage>,
        version: u64,
        now: i64,
        highest_seq: Option<u64>,
    ) -> Result<(), OfflineError> {
        let mut envelope = StoreEnvelope {
            store_signed_payload: StoreSignedPayload {
                message_ids: messages.iter().map(|m| m.id.clone()).collect(),
                version,
                timestamp: now,
                bucket_key: key_str.to_string(),
                highest_seq,
            },
            messages,
            last_updated: now,
            version,
            store_signature: String::new(),
        };
        envelope.seal(self.identity.signing_key())?;
        let raw = envelope.encode()?;

        put_record(self.dht.as_ref(), key_str.as_bytes().to_vec(), raw.clone()).await?;
        self.republisher
            .track(key_str, key_str.as_bytes().to_vec(), raw);
        info!(
            bucket = %key_str,
            version,
            count = envelope.messages.len(),
            "offline bucket published"
        );
        Ok(())
    }
}

/// Wire the offline-bucket validator/selector into an in-memory DHT the
/// way a host node registers them against its real DHT.
pub async fn register_offline_rules(dht: &MemoryDht, limits: StoreLimits) {
    dht.register_rules(RecordRules {
        prefix: kiyeovo_dht::OFFLINE_BUCKET_PREFIX.to_string(),
        validate: Box::new(move |key, value| {
            let now = Utc::now().timestamp_millis();
            validate_store(key, value, now, limits)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }),
        validate_update: Some(Box::new(|key, existing, incoming| {
            validate_store_update(key, existing, incoming).map_err(|e| e.to_string())
        })),
        select: Some(Box::new(|key, candidates| {
            kiyeovo_dht::select_store(key, candidates)
        })),
    })
    .await;
    debug!("offline bucket rules registered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(name: &str) -> Arc<PeerIdentity> {
        Arc::new(PeerIdentity::generate(name, name))
    }

    async fn manager(id: Arc<PeerIdentity>) -> (OfflineBucketManager, Arc<MemoryDht>) {
        let config = GroupConfig::default();
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-x").await;
        register_offline_rules(&dht, config.store_limits()).await;
        let republisher = Arc::new(DhtRepublisher::new(
            Arc::clone(&dht) as Arc<dyn Dht>,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        (
            OfflineBucketManager::new(Arc::clone(&dht) as Arc<dyn Dht>, republisher, id, config),
            dht,
        )
    }

    fn outgoing(id: &str) -> OutgoingOffline {
        OutgoingOffline {
            message_id: id.to_string(),
            content: format!("ciphertext for {id}").into_bytes(),
            sender_info: b"sender blob".to_vec(),
            expires_at: Utc::now().timestamp_millis() + 60_000,
            highest_seq: None,
        }
    }

    #[tokio::test]
    async fn store_then_fetch_roundtrip() {
        let alice = identity("alice");
        let (mgr, _dht) = manager(Arc::clone(&alice)).await;

        mgr.store_message("SECRET", outgoing("m1")).await.unwrap();
        mgr.store_message("SECRET", outgoing("m2")).await.unwrap();

        let fetched = mgr
            .fetch_from("SECRET", &alice.verifying_key())
            .await
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].id, "m1");
        assert_eq!(fetched[1].id, "m2");
    }

    #[tokio::test]
    async fn versions_increase_across_writes() {
        let alice = identity("alice");
        let (mgr, dht) = manager(Arc::clone(&alice)).await;

        mgr.store_message("SECRET", outgoing("m1")).await.unwrap();
        let key = mgr.bucket_key("SECRET");
        let v1 = StoreEnvelope::decode(&dht.raw_record(key.as_bytes()).await.unwrap())
            .unwrap()
            .version;

        mgr.store_message("SECRET", outgoing("m2")).await.unwrap();
        let v2 = StoreEnvelope::decode(&dht.raw_record(key.as_bytes()).await.unwrap())
            .unwrap()
            .version;
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn cap_evicts_oldest() {
        let alice = identity("alice");
        let config = GroupConfig {
            max_messages_per_store: 2,
            ..GroupConfig::default()
        };
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-x").await;
        register_offline_rules(&dht, config.store_limits()).await;
        let republisher = Arc::new(DhtRepublisher::new(
            Arc::clone(&dht) as Arc<dyn Dht>,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let mgr = OfflineBucketManager::new(
            Arc::clone(&dht) as Arc<dyn Dht>,
            republisher,
            Arc::clone(&alice),
            config,
        );

        mgr.store_message("g1", outgoing("m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.store_message("g1", outgoing("m2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.store_message("g1", outgoing("m3")).await.unwrap();

        let fetched = mgr.fetch_from("g1", &alice.verifying_key()).await.unwrap();
        let ids: Vec<&str> = fetched.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn remove_messages_shrinks_bucket() {
        let alice = identity("alice");
        let (mgr, _dht) = manager(Arc::clone(&alice)).await;

        mgr.store_message("SECRET", outgoing("m1")).await.unwrap();
        mgr.store_message("SECRET", outgoing("m2")).await.unwrap();
        mgr.remove_messages("SECRET", &["m1".to_string()])
            .await
            .unwrap();

        let fetched = mgr
            .fetch_from("SECRET", &alice.verifying_key())
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, "m2");
    }
}
