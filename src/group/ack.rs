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


//! At-least-once delivery of group control messages.
//!
//! Invites, responses, welcomes and state updates sit in the pending-ACK
//! table until the recipient acknowledges them or the row becomes
//! pointless (expired, target already joined, roster changed under us).
//! A periodic cycle walks the table and re-sends what still matters;
//! per-item failures never abort the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::PeerIdentity;
use crate::config::GroupConfig;
use crate::db::{Database, DbError, PendingAck};
use crate::dht::Dht;
use crate::group::types::GroupMessageType;
use crate::offline::{OfflineBucketManager, OfflineError, OutgoingOffline};

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlSendError {
    /// No pairwise channel with the peer; nothing can be delivered.
    #[error("no pairwise channel with {0}")]
    NoChannel(String),
    #[error(transparent)]
    Offline(#[from] OfflineError),
}

/// Source of pairwise shared secrets, owned by the 1:1 messaging layer.
pub trait PairwiseSecrets: Send + Sync {
    fn shared_secret(&self, peer_id: &str) -> Option<String>;
}

/// Fixed secret table, for tests and single-process setups.
#[derive(Debug, Default)]
pub struct StaticPairwiseSecrets {
    secrets: HashMap<String, String>,
}

impl StaticPairwiseSecrets {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

impl PairwiseSecrets for StaticPairwiseSecrets {
    fn shared_secret(&self, peer_id: &str) -> Option<String> {
        self.secrets.get(peer_id).cloned()
    }
}

/// Both control delivery paths. Responses flow responder → creator;
/// everything else flows creator → member.
#[async_trait]
pub trait ControlMessageSender: Send + Sync {
    async fn send_to_member(&self, target: &str, payload: &[u8]) -> Result<(), ControlSendError>;
    async fn send_to_creator(&self, creator: &str, payload: &[u8]) -> Result<(), ControlSendError>;
}

/// Default sender: parks the signed payload in the recipient's pairwise
/// offline bucket, where the offline-bucket validator applies.
pub struct OfflineControlSender {
    offline: Arc<OfflineBucketManager>,
    secrets: Arc<dyn PairwiseSecrets>,
    identity: Arc<PeerIdentity>,
    config: GroupConfig,
}

impl OfflineControlSender {
    pub fn new(
        offline: Arc<OfflineBucketManager>,
        secrets: Arc<dyn PairwiseSecrets>,
        identity: Arc<PeerIdentity>,
        config: GroupConfig,
    ) -> Self {
        Self {
            offline,
            secrets,
            identity,
            config,
        }
    }

    async fn deliver(&self, peer_id: &str, payload: &[u8]) -> Result<(), ControlSendError> {
        let secret = self
            .secrets
            .shared_secret(peer_id)
            .ok_or_else(|| ControlSendError::NoChannel(peer_id.to_string()))?;

        let message_id = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|v| {
                v.get("messageId")
                    .or_else(|| v.get("inviteId"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let sender_info = serde_json::to_vec(&serde_json::json!({
            "peerId": self.identity.peer_id,
            "username": self.identity.username,
        }))
        .unwrap_or_default();

        let now = Utc::now().timestamp_millis();
        self.offline
            .store_message(
                &secret,
                OutgoingOffline {
                    message_id,
                    content: payload.to_vec(),
                    sender_info,
                    expires_at: now + self.config.message_ttl_ms,
                    highest_seq: None,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlMessageSender for OfflineControlSender {
    async fn send_to_member(&self, target: &str, payload: &[u8]) -> Result<(), ControlSendError> {
        self.deliver(target, payload).await
    }

    async fn send_to_creator(&self, creator: &str, payload: &[u8]) -> Result<(), ControlSendError> {
        self.deliver(creator, payload).await
    }
}

/// Counters for one republish cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckCycleStats {
    pub republished: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub errors: usize,
}

enum Disposition {
    Republish,
    Skip,
    Drop(&'static str),
}

/// Walks the pending-ACK table and re-sends whatever still matters.
pub struct GroupAckRepublisher {
    db: Arc<Database>,
    dht: Arc<dyn Dht>,
    identity: Arc<PeerIdentity>,
    sender: Arc<dyn ControlMessageSender>,
    config: GroupConfig,
    in_flight: AtomicBool,
    running: AtomicBool,
    cancel: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl GroupAckRepublisher {
    pub fn new(
        db: Arc<Database>,
        dht: Arc<dyn Dht>,
        identity: Arc<PeerIdentity>,
        sender: Arc<dyn ControlMessageSender>,
        config: GroupConfig,
    ) -> Self {
        Self {
            db,
            dht,
            identity,
            sender,
            config,
            in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// One pass over the pending table. Re-entrant calls are no-ops.
    pub async fn run_cycle(&self) -> Result<AckCycleStats, AckError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("ack cycle already running, skipping");
            return Ok(AckCycleStats::default());
        }
        let result = self.cycle_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn cycle_inner(&self) -> Result<AckCycleStats, AckError> {
        let mut stats = AckCycleStats::default();
        let acks = self.db.get_all_pending_acks()?;
        if acks.is_empty() {
            return Ok(stats);
        }

        // A dead mesh turns the whole cycle into a skip; rows survive.
        let no_peers = self.dht.connected_peer_count().await == 0;
        let now = Utc::now().timestamp_millis();

        for ack in acks {
            if no_peers {
                stats.skipped += 1;
                continue;
            }
            match self.process_one(&ack, now).await {
                Ok(Disposition::Republish) => stats.republished += 1,
                Ok(Disposition::Skip) => stats.skipped += 1,
                Ok(Disposition::Drop(reason)) => {
                    debug!(
                        group_id = %ack.group_id,
                        target = %ack.target_peer_id,
                        message_type = %ack.message_type,
                        reason,
                        "pending ack dropped"
                    );
                    stats.dropped += 1;
                }
                Err(e) => {
                    warn!(
                        group_id = %ack.group_id,
                        target = %ack.target_peer_id,
                        error = %e,
                        "ack item failed, continuing"
                    );
                    stats.errors += 1;
                }
            }
        }
        info!(
            republished = stats.republished,
            skipped = stats.skipped,
            dropped = stats.dropped,
            errors = stats.errors,
            "ack republish cycle done"
        );
        Ok(stats)
    }

    async fn process_one(&self, ack: &PendingAck, now: i64) -> Result<Disposition, AckError> {
        let disposition = self.assess(ack, now)?;
        match disposition {
            Disposition::Republish => {
                let result = if ack.message_type == GroupMessageType::InviteResponse.as_str() {
                    self.sender
                        .send_to_creator(&ack.target_peer_id, &ack.payload)
                        .await
                } else {
                    self.sender
                        .send_to_member(&ack.target_peer_id, &ack.payload)
                        .await
                };
                match result {
                    Ok(()) => {
                        self.db.update_pending_ack_last_published(
                            &ack.group_id,
                            &ack.target_peer_id,
                            &ack.message_type,
                            now,
                        )?;
                        Ok(Disposition::Republish)
                    }
                    Err(e) => {
                        warn!(target = %ack.target_peer_id, error = %e, "control republish failed");
                        Ok(Disposition::Skip)
                    }
                }
            }
            Disposition::Drop(reason) => {
                self.remove(ack)?;
                Ok(Disposition::Drop(reason))
            }
            Disposition::Skip => Ok(Disposition::Skip),
        }
    }

    fn remove(&self, ack: &PendingAck) -> Result<(), AckError> {
        self.db
            .remove_pending_ack(&ack.group_id, &ack.target_peer_id, &ack.message_type)?;
        if ack.message_type == GroupMessageType::Invite.as_str() {
            self.db
                .remove_invite_delivery_acks_for_member(&ack.group_id, &ack.target_peer_id)?;
        }
        Ok(())
    }

    fn assess(&self, ack: &PendingAck, now: i64) -> Result<Disposition, AckError> {
        let Ok(payload) = serde_json::from_slice::<Value>(&ack.payload) else {
            return Ok(Disposition::Drop("invalid_payload"));
        };

        if ack.message_type == GroupMessageType::Invite.as_str() {
            let (Some(invite_id), Some(expires_at)) = (
                payload.get("inviteId").and_then(Value::as_str),
                payload.get("expiresAt").and_then(Value::as_i64),
            ) else {
                return Ok(Disposition::Drop("missing_fields"));
            };
            if now > expires_at {
                return Ok(Disposition::Drop("invite_expired"));
            }
            let Some(chat) = self.db.get_chat_by_group_id(&ack.group_id)? else {
                return Ok(Disposition::Drop("group_missing"));
            };
            if chat.group_creator_peer_id != self.identity.peer_id {
                return Ok(Disposition::Drop("not_creator"));
            }
            if self.db.is_participant(chat.chat_id, &ack.target_peer_id)? {
                return Ok(Disposition::Drop("target_already_member"));
            }
            if self.db.is_invite_delivery_ack_received(
                &ack.group_id,
                &ack.target_peer_id,
                invite_id,
            )? {
                return Ok(Disposition::Skip);
            }
            return Ok(Disposition::Republish);
        }

        if ack.message_type == GroupMessageType::InviteResponse.as_str() {
            let Some(timestamp) = payload.get("timestamp").and_then(Value::as_i64) else {
                return Ok(Disposition::Drop("missing_fields"));
            };
            if now > timestamp + self.config.invite_lifetime_ms {
                return Ok(Disposition::Drop("response_expired"));
            }
            let Some(chat) = self.db.get_chat_by_group_id(&ack.group_id)? else {
                return Ok(Disposition::Drop("group_missing"));
            };
            if chat.group_status.is_terminal() {
                return Ok(Disposition::Drop("group_closed"));
            }
            if chat.group_creator_peer_id != ack.target_peer_id {
                return Ok(Disposition::Drop("target_not_creator"));
            }
            return Ok(Disposition::Republish);
        }

        if ack.message_type == GroupMessageType::Welcome.as_str()
            || ack.message_type == GroupMessageType::StateUpdate.as_str()
        {
            if payload.get("messageId").and_then(Value::as_str).is_none() {
                return Ok(Disposition::Drop("missing_fields"));
            }
            let Some(chat) = self.db.get_chat_by_group_id(&ack.group_id)? else {
                return Ok(Disposition::Drop("group_missing"));
            };
            if chat.group_creator_peer_id != self.identity.peer_id {
                return Ok(Disposition::Drop("not_creator"));
            }
            if !self.db.is_participant(chat.chat_id, &ack.target_peer_id)? {
                return Ok(Disposition::Drop("target_not_member"));
            }
            return Ok(Disposition::Republish);
        }

        Ok(Disposition::Drop("unknown_type"))
    }

    /// Start the periodic cycle. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = oneshot::channel::<()>();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let this = Arc::clone(self);
        let tick = this.config.topic_reconcile_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = sleep(tick) => {}
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.run_cycle().await {
                    warn!(error = %e, "ack cycle failed");
                }
            }
            debug!("ack republisher stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChatStatus, GroupStatus};
    use crate::dht::MemoryDht;
    use crate::group::types::GroupInvite;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ControlMessageSender for RecordingSender {
        async fn send_to_member(
            &self,
            target: &str,
            _payload: &[u8],
        ) -> Result<(), ControlSendError> {
            self.sent
                .lock()
                .unwrap()
                .push(("member".into(), target.into()));
            Ok(())
        }

        async fn send_to_creator(
            &self,
            creator: &str,
            _payload: &[u8],
        ) -> Result<(), ControlSendError> {
            self.sent
                .lock()
                .unwrap()
                .push(("creator".into(), creator.into()));
            Ok(())
        }
    }

    struct Fixture {
        db: Arc<Database>,
        dht: Arc<MemoryDht>,
        sender: Arc<RecordingSender>,
        republisher: GroupAckRepublisher,
        creator: Arc<PeerIdentity>,
    }

    async fn fixture() -> Fixture {
        let creator = Arc::new(PeerIdentity::generate("peer-a", "alice"));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-x").await;
        let sender = Arc::new(RecordingSender::default());
        let republisher = GroupAckRepublisher::new(
            Arc::clone(&db),
            Arc::clone(&dht) as Arc<dyn Dht>,
            Arc::clone(&creator),
            Arc::clone(&sender) as Arc<dyn ControlMessageSender>,
            GroupConfig::default(),
        );
        Fixture {
            db,
            dht,
            sender,
            republisher,
            creator,
        }
    }

    fn seed_chat(fx: &Fixture) -> i64 {
        fx.db
            .create_group_chat(
                "g1",
                "climbing",
                &fx.creator.peer_id,
                ChatStatus::Active,
                GroupStatus::Active,
                1,
                &fx.creator.peer_id,
            )
            .unwrap()
    }

    fn queue_invite(fx: &Fixture, target: &str) -> GroupInvite {
        let now = Utc::now().timestamp_millis();
        let mut invite = GroupInvite::new(
            "g1",
            "climbing",
            &fx.creator.peer_id,
            target,
            now,
            GroupConfig::default().invite_lifetime_ms,
        );
        invite.seal(fx.creator.signing_key()).unwrap();
        fx.db
            .upsert_pending_ack(
                "g1",
                target,
                GroupMessageType::Invite.as_str(),
                &serde_json::to_vec(&invite).unwrap(),
                now,
            )
            .unwrap();
        invite
    }

    #[tokio::test]
    async fn invite_lifecycle() {
        let fx = fixture().await;
        let chat_id = seed_chat(&fx);
        let invite = queue_invite(&fx, "peer-b");

        // Unacked invites republish every cycle.
        for _ in 0..3 {
            let stats = fx.republisher.run_cycle().await.unwrap();
            assert_eq!(stats.republished, 1);
        }
        assert_eq!(fx.sender.sent.lock().unwrap().len(), 3);
        let acks = fx.db.get_all_pending_acks().unwrap();
        assert!(acks[0].last_published_at.is_some());

        // A recorded delivery ACK turns the row into a skip.
        fx.db
            .record_invite_delivery_ack("g1", "peer-b", &invite.invite_id, 0)
            .unwrap();
        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(fx.sender.sent.lock().unwrap().len(), 3);

        // Once the target joins, the row (and its delivery acks) go away.
        fx.db.add_participant(chat_id, "peer-b").unwrap();
        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(fx.db.get_all_pending_acks().unwrap().is_empty());
        assert!(!fx
            .db
            .is_invite_delivery_ack_received("g1", "peer-b", &invite.invite_id)
            .unwrap());
    }

    #[tokio::test]
    async fn expired_invite_drops() {
        let fx = fixture().await;
        seed_chat(&fx);
        let now = Utc::now().timestamp_millis();
        let mut invite =
            GroupInvite::new("g1", "climbing", &fx.creator.peer_id, "peer-b", now - 100, 50);
        invite.seal(fx.creator.signing_key()).unwrap();
        fx.db
            .upsert_pending_ack(
                "g1",
                "peer-b",
                GroupMessageType::Invite.as_str(),
                &serde_json::to_vec(&invite).unwrap(),
                now,
            )
            .unwrap();

        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(fx.db.get_all_pending_acks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_drops() {
        let fx = fixture().await;
        seed_chat(&fx);
        fx.db
            .upsert_pending_ack("g1", "peer-b", "GROUP_INVITE", b"not json", 0)
            .unwrap();
        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn response_goes_to_creator_path() {
        let fx = fixture().await;
        // Local node is the responder; target row points at the creator.
        fx.db
            .create_group_chat(
                "g1",
                "climbing",
                "peer-c",
                ChatStatus::Active,
                GroupStatus::Active,
                1,
                "peer-c",
            )
            .unwrap();
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::json!({
            "type": "GROUP_INVITE_RESPONSE",
            "inviteId": "inv-1",
            "timestamp": now,
        });
        fx.db
            .upsert_pending_ack(
                "g1",
                "peer-c",
                GroupMessageType::InviteResponse.as_str(),
                &serde_json::to_vec(&payload).unwrap(),
                now,
            )
            .unwrap();

        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.republished, 1);
        let sent = fx.sender.sent.lock().unwrap();
        assert_eq!(sent[0], ("creator".into(), "peer-c".into()));
    }

    #[tokio::test]
    async fn welcome_requires_membership() {
        let fx = fixture().await;
        let chat_id = seed_chat(&fx);
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::json!({"type": "GROUP_WELCOME", "messageId": "m-1"});
        fx.db
            .upsert_pending_ack(
                "g1",
                "peer-b",
                GroupMessageType::Welcome.as_str(),
                &serde_json::to_vec(&payload).unwrap(),
                now,
            )
            .unwrap();

        // Not a participant yet: dropped as a stale target.
        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.dropped, 1);

        // Re-queued once they joined: republishes.
        fx.db.add_participant(chat_id, "peer-b").unwrap();
        fx.db
            .upsert_pending_ack(
                "g1",
                "peer-b",
                GroupMessageType::Welcome.as_str(),
                &serde_json::to_vec(&payload).unwrap(),
                now,
            )
            .unwrap();
        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.republished, 1);
    }

    #[tokio::test]
    async fn dead_mesh_skips_everything() {
        let fx = fixture().await;
        seed_chat(&fx);
        queue_invite(&fx, "peer-b");
        fx.dht.clear_peers().await;

        let stats = fx.republisher.run_cycle().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.republished, 0);
        assert_eq!(fx.db.get_all_pending_acks().unwrap().len(), 1);
    }
}
