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


//! Real-time group messaging over gossip pubsub.
//!
//! Topics are derived from the group id and the current epoch key, so a
//! key rotation silently moves the whole group to a fresh topic. The
//! service keeps the subscription set in line with local chat state,
//! publishes signed heartbeats to keep the mesh sticky, and sends every
//! content message twice: over the topic for online members and into the
//! sender's group offline bucket for everyone else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::PeerIdentity;
use crate::config::GroupConfig;
use crate::crypto::{
    self, CryptoError, GROUP_KEY_LEN, NONCE_LEN, b64_decode, b64_encode, decode_group_key,
    decode_verifying_key, sha256_hex,
};
use crate::db::{Chat, ChatStatus, Database, DbError, GroupStatus, MessageRecord, MessageSentStatus};
use crate::group::types::{GroupChatKind, GroupChatMessage, GroupMessageType};
use crate::offline::{OfflineBucketManager, OutgoingOffline};
use crate::pubsub::{Pubsub, PubsubError, PubsubMessage};

/// Debounce window between a `peer:connect` signal and the reconcile it
/// triggers.
const PEER_CONNECT_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("chat for group {0} is not active")]
    ChatNotActive(String),
    #[error("no usable epoch key for group {0}")]
    MissingKey(String),
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("message reached nobody: publish failed ({online}), offline backup failed ({offline})")]
    BothPathsFailed { online: String, offline: String },
    #[error("offline bucket error: {0}")]
    Offline(#[from] crate::offline::OfflineError),
    #[error("no pending offline backup for message {0}")]
    NoPendingBackup(String),
}

/// What the caller learns about a completed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub message_sent_status: MessageSentStatus,
    /// Present when the message went out online but the offline backup
    /// could not be written.
    pub warning: Option<String>,
    /// Handle for `retry_offline_backup` when the backup is still owed.
    pub offline_backup_retry: Option<String>,
}

/// Emitted for every message that lands in the local store, sent or
/// received.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub chat_id: i64,
    pub group_id: String,
    pub message: MessageRecord,
    pub sent_status: MessageSentStatus,
}

#[derive(Debug, Clone)]
struct TopicBinding {
    group_id: String,
    key_version: u64,
}

struct ResolvedContext {
    chat: Chat,
    key: [u8; GROUP_KEY_LEN],
    topic: String,
}

#[derive(Clone)]
struct PendingBackup {
    group_id: String,
    outgoing: OutgoingOffline,
}

/// Derive the pubsub topic for `(group, epoch key)`.
///
/// `sha256(group_id || hex(sha256(key)))`, hex-encoded. Members on
/// different epochs land on different topics and never see each other's
/// traffic.
pub fn derive_topic(group_id: &str, key: &[u8; GROUP_KEY_LEN]) -> String {
    let key_digest = sha256_hex(key);
    let mut input = Vec::with_capacity(group_id.len() + key_digest.len());
    input.extend_from_slice(group_id.as_bytes());
    input.extend_from_slice(key_digest.as_bytes());
    sha256_hex(&input)
}

/// The group messaging service.
pub struct GroupMessenger {
    db: Arc<Database>,
    pubsub: Arc<dyn Pubsub>,
    offline: Arc<OfflineBucketManager>,
    identity: Arc<PeerIdentity>,
    config: GroupConfig,
    topics: RwLock<HashMap<String, TopicBinding>>,
    /// Backups owed after an online-only send. Not persisted; a restart
    /// forfeits queued retries.
    pending_offline_backups: std::sync::Mutex<HashMap<String, PendingBackup>>,
    events: broadcast::Sender<MessageEvent>,
    reconcile_in_flight: AtomicBool,
    heartbeat_in_flight: AtomicBool,
    reconcile_debounce: AtomicBool,
    running: AtomicBool,
    cancels: std::sync::Mutex<Vec<oneshot::Sender<()>>>,
}

impl GroupMessenger {
    pub fn new(
        db: Arc<Database>,
        pubsub: Arc<dyn Pubsub>,
        offline: Arc<OfflineBucketManager>,
        identity: Arc<PeerIdentity>,
        config: GroupConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            db,
            pubsub,
            offline,
            identity,
            config,
            topics: RwLock::new(HashMap::new()),
            pending_offline_backups: std::sync::Mutex::new(HashMap::new()),
            events,
            reconcile_in_flight: AtomicBool::new(false),
            heartbeat_in_flight: AtomicBool::new(false),
            reconcile_debounce: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancels: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to delivered-message events.
    pub fn events(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    // ------------------------- lifecycle -------------------------

    /// Start the reconcile loop, heartbeat loop and the incoming frame
    /// pump. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        let rx = self.register_cancel();
        tokio::spawn(async move { this.reconcile_loop(rx).await });

        let this = Arc::clone(self);
        let rx = self.register_cancel();
        tokio::spawn(async move { this.heartbeat_loop(rx).await });

        let this = Arc::clone(self);
        let rx = self.register_cancel();
        tokio::spawn(async move { this.pump_incoming(rx).await });
    }

    /// Stop the loops and drop every subscription, best-effort.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let cancels: Vec<oneshot::Sender<()>> = {
            let mut guard = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for tx in cancels {
            let _ = tx.send(());
        }

        let topics: Vec<String> = self.topics.write().await.drain().map(|(t, _)| t).collect();
        for topic in topics {
            if let Err(e) = self.pubsub.unsubscribe(&topic).await {
                debug!(%topic, error = %e, "unsubscribe on shutdown failed");
            }
        }
        info!("group messenger stopped");
    }

    fn register_cancel(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    async fn reconcile_loop(self: Arc<Self>, mut cancel: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                _ = sleep(self.config.topic_reconcile_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.reconcile_topics().await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut cancel: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.heartbeat_tick().await;
        }
    }

    async fn pump_incoming(self: Arc<Self>, mut cancel: oneshot::Receiver<()>) {
        let mut frames = self.pubsub.messages();
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if let Err(e) = self.handle_frame(&frame).await {
                            warn!(error = %e, "incoming frame failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "incoming frame pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    // --------------------- topic reconciliation ---------------------

    /// Signal that a peer connected; schedules a debounced reconcile.
    pub fn notify_peer_connected(self: &Arc<Self>) {
        if self.reconcile_debounce.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(PEER_CONNECT_DEBOUNCE).await;
            this.reconcile_debounce.store(false, Ordering::SeqCst);
            this.reconcile_topics().await;
        });
    }

    /// Bring the subscription set in line with local chat state.
    /// Re-entrant calls are no-ops.
    pub async fn reconcile_topics(&self) {
        if self.reconcile_in_flight.swap(true, Ordering::SeqCst) {
            debug!("topic reconcile already running, skipping");
            return;
        }
        if let Err(e) = self.reconcile_inner().await {
            warn!(error = %e, "topic reconcile failed");
        }
        self.reconcile_in_flight.store(false, Ordering::SeqCst);
    }

    async fn reconcile_inner(&self) -> Result<(), SendError> {
        let mut expected: HashMap<String, TopicBinding> = HashMap::new();
        for chat in self.db.group_chats()? {
            if chat.status != ChatStatus::Active || chat.group_status != GroupStatus::Active {
                continue;
            }
            let Some(key_record) = self
                .db
                .get_group_key_for_epoch(&chat.group_id, chat.key_version)?
            else {
                continue;
            };
            let Ok(key) = decode_group_key(&key_record.key_b64) else {
                warn!(group_id = %chat.group_id, "epoch key is not 32 bytes, skipping");
                continue;
            };
            expected.insert(
                derive_topic(&chat.group_id, &key),
                TopicBinding {
                    group_id: chat.group_id.clone(),
                    key_version: chat.key_version,
                },
            );
        }

        let current: Vec<String> = self.topics.read().await.keys().cloned().collect();

        for (topic, binding) in &expected {
            if !current.contains(topic) {
                match self.pubsub.subscribe(topic).await {
                    Ok(()) => {
                        debug!(group_id = %binding.group_id, %topic, "subscribed");
                        self.topics
                            .write()
                            .await
                            .insert(topic.clone(), binding.clone());
                    }
                    Err(e) => warn!(%topic, error = %e, "subscribe failed"),
                }
            }
        }
        for topic in current {
            if !expected.contains_key(&topic) {
                match self.pubsub.unsubscribe(&topic).await {
                    Ok(()) => {
                        debug!(%topic, "unsubscribed");
                        self.topics.write().await.remove(&topic);
                    }
                    Err(e) => warn!(%topic, error = %e, "unsubscribe failed"),
                }
            }
        }
        Ok(())
    }

    async fn ensure_subscribed(&self, topic: &str, binding: TopicBinding) {
        if self.topics.read().await.contains_key(topic) {
            return;
        }
        if let Err(e) = self.pubsub.subscribe(topic).await {
            warn!(%topic, error = %e, "re-subscribe failed");
            return;
        }
        self.topics.write().await.insert(topic.to_string(), binding);
    }

    // --------------------------- heartbeat ---------------------------

    /// Publish one signed heartbeat per subscribed topic. Failures are
    /// swallowed; heartbeats only exist to keep the gossip mesh warm.
    pub async fn heartbeat_tick(&self) {
        if self.heartbeat_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let snapshot: Vec<(String, TopicBinding)> = self
            .topics
            .read()
            .await
            .iter()
            .map(|(t, b)| (t.clone(), b.clone()))
            .collect();
        let now = Utc::now().timestamp_millis();

        for (topic, binding) in snapshot {
            let mut heartbeat = GroupChatMessage::heartbeat(
                &binding.group_id,
                binding.key_version,
                &self.identity.peer_id,
                now,
            );
            let payload = heartbeat
                .seal(self.identity.signing_key())
                .ok()
                .and_then(|_| serde_json::to_vec(&heartbeat).ok());
            let Some(payload) = payload else { continue };
            if let Err(e) = self.pubsub.publish(&topic, payload).await {
                debug!(%topic, error = %e, "heartbeat publish failed");
            }
        }
        self.heartbeat_in_flight.store(false, Ordering::SeqCst);
    }

    // ----------------------------- send -----------------------------

    async fn resolve_context(&self, group_id: &str) -> Result<ResolvedContext, SendError> {
        let chat = self
            .db
            .get_chat_by_group_id(group_id)?
            .ok_or_else(|| SendError::ChatNotActive(group_id.to_string()))?;
        if chat.status != ChatStatus::Active || chat.group_status != GroupStatus::Active {
            return Err(SendError::ChatNotActive(group_id.to_string()));
        }
        let key_record = self
            .db
            .get_group_key_for_epoch(group_id, chat.key_version)?
            .ok_or_else(|| SendError::MissingKey(group_id.to_string()))?;
        let key = decode_group_key(&key_record.key_b64)
            .map_err(|_| SendError::MissingKey(group_id.to_string()))?;
        let topic = derive_topic(group_id, &key);
        Ok(ResolvedContext { chat, key, topic })
    }

    /// Send a text message to the group.
    ///
    /// The message always targets both paths: the live topic and the
    /// sender's group offline bucket. Only the loss of both is an error.
    pub async fn send_message(&self, group_id: &str, text: &str) -> Result<SendOutcome, SendError> {
        let ctx = self.resolve_context(group_id).await?;
        let now = Utc::now().timestamp_millis();

        let seq = self
            .db
            .get_next_seq_and_increment(group_id, ctx.chat.key_version)?;

        let nonce = crypto::generate_nonce();
        let ciphertext = crypto::encrypt(&ctx.key, &nonce, text.as_bytes())?;

        let mut message = GroupChatMessage {
            kind: GroupMessageType::Message,
            group_id: group_id.to_string(),
            key_version: ctx.chat.key_version,
            sender_peer_id: self.identity.peer_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: now,
            message_type: GroupChatKind::Text,
            seq: Some(seq),
            encrypted_content: Some(b64_encode(&ciphertext)),
            nonce: Some(b64_encode(&nonce)),
            signature: String::new(),
        };
        message.seal(self.identity.signing_key())?;
        let wire = serde_json::to_vec(&message).map_err(CryptoError::from)?;

        let online_result = self.publish_with_retry(&ctx, &wire).await;
        let published_online = online_result.is_ok();

        let outgoing = OutgoingOffline {
            message_id: message.message_id.clone(),
            content: wire.clone(),
            sender_info: self.sender_info_blob(),
            expires_at: now + self.config.message_ttl_ms,
            highest_seq: Some(seq),
        };
        let offline_result = self
            .offline
            .store_message(group_id, outgoing.clone())
            .await;

        let (warning, retry_handle) = match (&online_result, &offline_result) {
            (Err(online), Err(offline)) => {
                return Err(SendError::BothPathsFailed {
                    online: online.clone(),
                    offline: offline.to_string(),
                });
            }
            (Ok(()), Err(offline)) => {
                warn!(message_id = %message.message_id, error = %offline,
                    "offline backup failed, queueing retry handle");
                self.pending_offline_backups
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        message.message_id.clone(),
                        PendingBackup {
                            group_id: group_id.to_string(),
                            outgoing,
                        },
                    );
                (
                    Some(format!("offline backup failed: {offline}")),
                    Some(message.message_id.clone()),
                )
            }
            _ => (None, None),
        };

        let sent_status = if published_online {
            MessageSentStatus::Online
        } else {
            MessageSentStatus::Offline
        };

        let record = MessageRecord {
            message_id: message.message_id.clone(),
            chat_id: ctx.chat.chat_id,
            sender_peer_id: self.identity.peer_id.clone(),
            content: text.to_string(),
            timestamp: now,
            sent_status,
        };
        if !self.db.message_exists(&record.message_id)? {
            self.db.create_message(&record)?;
        }
        self.db.update_member_seq(
            group_id,
            ctx.chat.key_version,
            &self.identity.peer_id,
            seq,
        )?;
        let _ = self.events.send(MessageEvent {
            chat_id: ctx.chat.chat_id,
            group_id: group_id.to_string(),
            message: record,
            sent_status,
        });

        info!(
            group_id,
            message_id = %message.message_id,
            seq,
            status = sent_status.as_str(),
            "group message sent"
        );
        Ok(SendOutcome {
            message_id: message.message_id,
            message_sent_status: sent_status,
            warning,
            offline_backup_retry: retry_handle,
        })
    }

    /// Publish once; on a "nobody is listening" failure wait, make sure
    /// the subscription still exists and try exactly once more.
    async fn publish_with_retry(&self, ctx: &ResolvedContext, wire: &[u8]) -> Result<(), String> {
        match self.pubsub.publish(&ctx.topic, wire.to_vec()).await {
            Ok(outcome) if !outcome.recipients.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(e) if self.is_retryable_publish_error(&e) => {}
            Err(e) => return Err(e.to_string()),
        }

        sleep(self.config.publish_retry_delay).await;
        self.ensure_subscribed(
            &ctx.topic,
            TopicBinding {
                group_id: ctx.chat.group_id.clone(),
                key_version: ctx.chat.key_version,
            },
        )
        .await;

        match self.pubsub.publish(&ctx.topic, wire.to_vec()).await {
            Ok(outcome) if !outcome.recipients.is_empty() => Ok(()),
            Ok(_) => Err("no remote recipients".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn is_retryable_publish_error(&self, e: &PubsubError) -> bool {
        matches!(e, PubsubError::NoPeersSubscribed)
            || e.to_string().contains(&self.config.retryable_publish_marker)
    }

    fn sender_info_blob(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "peerId": self.identity.peer_id,
            "username": self.identity.username,
        }))
        .unwrap_or_default()
    }

    /// Retry an offline backup that failed during `send_message`.
    pub async fn retry_offline_backup(&self, message_id: &str) -> Result<(), SendError> {
        let backup = self
            .pending_offline_backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_id)
            .cloned()
            .ok_or_else(|| SendError::NoPendingBackup(message_id.to_string()))?;

        match self
            .offline
            .store_message(&backup.group_id, backup.outgoing.clone())
            .await
        {
            Ok(()) => {
                self.pending_offline_backups
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(message_id);
                info!(message_id, "offline backup retried successfully");
                Ok(())
            }
            Err(e) => {
                warn!(message_id, error = %e, "offline backup retry failed");
                Err(SendError::BothPathsFailed {
                    online: "already delivered".into(),
                    offline: e.to_string(),
                })
            }
        }
    }

    /// Number of backups still owed. Test and diagnostics hook.
    pub fn pending_backup_count(&self) -> usize {
        self.pending_offline_backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    // ---------------------------- receive ----------------------------

    /// Process one incoming pubsub frame. Returns the stored record when
    /// the message was delivered, `None` when it was dropped.
    pub async fn handle_frame(
        &self,
        frame: &PubsubMessage,
    ) -> Result<Option<MessageRecord>, SendError> {
        let Ok(message) = serde_json::from_slice::<GroupChatMessage>(&frame.data) else {
            debug!(topic = %frame.topic, "dropping frame: not a group chat message");
            return Ok(None);
        };
        if let Err(reason) = message.shape_check() {
            debug!(topic = %frame.topic, reason, "dropping frame: bad shape");
            return Ok(None);
        }

        let now = Utc::now().timestamp_millis();
        if message.timestamp > now + self.config.message_max_future_skew_ms {
            debug!(message_id = %message.message_id, "dropping frame: from the future");
            return Ok(None);
        }
        let max_age = if message.is_heartbeat() {
            self.config.heartbeat_max_age_ms
        } else {
            self.config.message_max_age_ms
        };
        if message.timestamp < now - max_age {
            debug!(message_id = %message.message_id, "dropping frame: too old");
            return Ok(None);
        }

        // Pubsub may echo our own messages back.
        if message.sender_peer_id == self.identity.peer_id {
            return Ok(None);
        }

        // Bind the frame to local group state; anything that does not
        // line up is dropped silently, including cross-epoch traffic.
        let Some(chat) = self.db.get_chat_by_group_id(&message.group_id)? else {
            return Ok(None);
        };
        if chat.status != ChatStatus::Active || chat.group_status != GroupStatus::Active {
            return Ok(None);
        }
        if message.key_version != chat.key_version {
            debug!(
                group_id = %message.group_id,
                theirs = message.key_version,
                ours = chat.key_version,
                "dropping frame: epoch mismatch"
            );
            return Ok(None);
        }
        let Some(key_record) = self
            .db
            .get_group_key_for_epoch(&message.group_id, message.key_version)?
        else {
            return Ok(None);
        };
        let Ok(key) = decode_group_key(&key_record.key_b64) else {
            return Ok(None);
        };
        if derive_topic(&message.group_id, &key) != frame.topic {
            debug!(group_id = %message.group_id, "dropping frame: topic does not match epoch");
            return Ok(None);
        }

        // Sender must be in the roster with a known signing key, and the
        // signature must hold.
        if !self.db.is_participant(chat.chat_id, &message.sender_peer_id)? {
            debug!(sender = %message.sender_peer_id, "dropping frame: not a participant");
            return Ok(None);
        }
        let Some(sender) = self.db.get_user(&message.sender_peer_id)? else {
            return Ok(None);
        };
        let Ok(sender_key) = decode_verifying_key(&sender.signing_pub_key) else {
            return Ok(None);
        };
        if message.verify(&sender_key).is_err() {
            warn!(sender = %message.sender_peer_id, "dropping frame: bad signature");
            return Ok(None);
        }

        // Heartbeats end here; the mesh already got what it needed.
        if message.is_heartbeat() {
            return Ok(None);
        }

        let seq = message.seq.unwrap_or(0);
        let high_water =
            self.db
                .get_member_seq(&message.group_id, message.key_version, &message.sender_peer_id)?;
        if seq <= high_water {
            debug!(
                sender = %message.sender_peer_id,
                seq,
                high_water,
                "dropping frame: replayed or reordered"
            );
            return Ok(None);
        }
        if self.db.message_exists(&message.message_id)? {
            return Ok(None);
        }

        let plaintext = self.decrypt_content(&message, &key)?;

        let record = MessageRecord {
            message_id: message.message_id.clone(),
            chat_id: chat.chat_id,
            sender_peer_id: message.sender_peer_id.clone(),
            content: plaintext,
            timestamp: message.timestamp,
            sent_status: MessageSentStatus::Online,
        };
        self.db.create_message(&record)?;
        self.db.update_member_seq(
            &message.group_id,
            message.key_version,
            &message.sender_peer_id,
            seq,
        )?;
        let _ = self.events.send(MessageEvent {
            chat_id: chat.chat_id,
            group_id: message.group_id.clone(),
            message: record.clone(),
            sent_status: MessageSentStatus::Online,
        });
        debug!(message_id = %record.message_id, seq, "group message delivered");
        Ok(Some(record))
    }

    fn decrypt_content(
        &self,
        message: &GroupChatMessage,
        key: &[u8; GROUP_KEY_LEN],
    ) -> Result<String, SendError> {
        let nonce_bytes = b64_decode(message.nonce.as_deref().unwrap_or_default())?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decrypt)?;
        let ciphertext = b64_decode(message.encrypted_content.as_deref().unwrap_or_default())?;
        let plaintext = crypto::decrypt(key, &nonce, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt.into())
    }

    /// Drain the group offline bucket of `sender`, feeding whatever is
    /// new through the regular receive pipeline.
    pub async fn poll_offline_bucket(
        &self,
        group_id: &str,
        sender_signing_key_b64: &str,
    ) -> Result<usize, SendError> {
        let sender_key = decode_verifying_key(sender_signing_key_b64)?;
        let messages = self.offline.fetch_from(group_id, &sender_key).await?;

        let ctx = self.resolve_context(group_id).await?;
        let mut delivered = 0usize;
        for stored in messages {
            let Ok(content) = b64_decode(&stored.content) else {
                continue;
            };
            // Offline buckets carry the same signed wire frames the
            // topic does.
            let frame = PubsubMessage {
                topic: ctx.topic.clone(),
                data: content,
                from: String::new(),
            };
            if self.handle_frame(&frame).await?.is_some() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Extract the sender peer id of a raw frame without verifying it.
    /// Diagnostics only.
    pub fn peek_sender(frame: &PubsubMessage) -> Option<String> {
        serde_json::from_slice::<Value>(&frame.data)
            .ok()
            .and_then(|v| {
                v.get("senderPeerId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserRecord;
    use crate::dht::{Dht, DhtRepublisher, MemoryDht};
    use crate::offline::register_offline_rules;
    use crate::pubsub::{MemoryPubsub, MemoryPubsubHub};
    use std::time::Duration;

    struct Node {
        db: Arc<Database>,
        messenger: Arc<GroupMessenger>,
        identity: Arc<PeerIdentity>,
        pubsub: Arc<MemoryPubsub>,
        dht: Arc<MemoryDht>,
    }

    async fn node(
        hub: &Arc<MemoryPubsubHub>,
        dht: &Arc<MemoryDht>,
        name: &str,
        config: GroupConfig,
    ) -> Node {
        let identity = Arc::new(PeerIdentity::generate(name, name));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let pubsub = Arc::new(hub.node(name, false));
        let republisher = Arc::new(DhtRepublisher::new(
            Arc::clone(dht) as Arc<dyn Dht>,
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let offline = Arc::new(OfflineBucketManager::new(
            Arc::clone(dht) as Arc<dyn Dht>,
            republisher,
            Arc::clone(&identity),
            config.clone(),
        ));
        let messenger = GroupMessenger::new(
            Arc::clone(&db),
            Arc::clone(&pubsub) as Arc<dyn Pubsub>,
            offline,
            Arc::clone(&identity),
            config,
        );
        Node {
            db,
            messenger,
            identity,
            pubsub,
            dht: Arc::clone(dht),
        }
    }

    fn group_key() -> ([u8; 32], String) {
        let key = crypto::generate_group_key();
        let b64 = b64_encode(&key);
        (key, b64)
    }

    fn seed_group(node: &Node, others: &[&Node], key_b64: &str) -> i64 {
        let chat_id = node
            .db
            .create_group_chat(
                "g1",
                "climbing",
                "peer-creator",
                ChatStatus::Active,
                GroupStatus::Active,
                1,
                "peer-creator",
            )
            .unwrap();
        node.db
            .insert_group_key("g1", 1, key_b64, Utc::now().timestamp_millis())
            .unwrap();
        node.db.add_participant(chat_id, &node.identity.peer_id).unwrap();
        for other in others {
            node.db
                .add_participant(chat_id, &other.identity.peer_id)
                .unwrap();
            node.db
                .upsert_user(&UserRecord {
                    peer_id: other.identity.peer_id.clone(),
                    username: other.identity.username.clone(),
                    signing_pub_key: other.identity.signing_pub_key_b64(),
                    offline_pub_key: other.identity.offline_pub_key_b64.clone(),
                })
                .unwrap();
        }
        chat_id
    }

    async fn two_peer_fixture() -> (Node, Node, String) {
        let config = GroupConfig {
            publish_retry_delay: Duration::from_millis(10),
            ..GroupConfig::default()
        };
        let hub = MemoryPubsubHub::new();
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-x").await;
        register_offline_rules(&dht, config.store_limits()).await;

        let alice = node(&hub, &dht, "alice", config.clone()).await;
        let bob = node(&hub, &dht, "bob", config).await;
        let (key, key_b64) = group_key();
        seed_group(&alice, &[&bob], &key_b64);
        seed_group(&bob, &[&alice], &key_b64);
        let topic = derive_topic("g1", &key);
        (alice, bob, topic)
    }

    #[test]
    fn topic_rotates_with_key() {
        let (key_a, _) = group_key();
        let (key_b, _) = group_key();
        assert_eq!(derive_topic("g1", &key_a), derive_topic("g1", &key_a));
        assert_ne!(derive_topic("g1", &key_a), derive_topic("g1", &key_b));
        assert_ne!(derive_topic("g1", &key_a), derive_topic("g2", &key_a));
    }

    #[tokio::test]
    async fn reconcile_subscribes_active_groups_only() {
        let (alice, _bob, topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        assert_eq!(alice.pubsub.topics().await, vec![topic.clone()]);

        // Leaving the group unsubscribes on the next pass.
        alice.db.set_group_status("g1", GroupStatus::Left).unwrap();
        alice.messenger.reconcile_topics().await;
        assert!(alice.pubsub.topics().await.is_empty());
    }

    #[tokio::test]
    async fn online_send_delivers_to_subscriber() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        let outcome = alice.messenger.send_message("g1", "hello bob").await.unwrap();
        assert_eq!(outcome.message_sent_status, MessageSentStatus::Online);
        assert!(outcome.warning.is_none());

        let frame = frames.recv().await.unwrap();
        let record = bob.messenger.handle_frame(&frame).await.unwrap().unwrap();
        assert_eq!(record.content, "hello bob");
        assert_eq!(record.sender_peer_id, "alice");
        assert_eq!(bob.db.get_member_seq("g1", 1, "alice").unwrap(), 1);
    }

    #[tokio::test]
    async fn send_without_listeners_falls_back_to_offline() {
        let (alice, _bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        // Nobody else subscribed: publish fails, retry fails, offline
        // bucket takes the message.
        let outcome = alice.messenger.send_message("g1", "anyone there").await.unwrap();
        assert_eq!(outcome.message_sent_status, MessageSentStatus::Offline);
        assert!(outcome.warning.is_none());
        assert!(outcome.offline_backup_retry.is_none());

        // The local row exists either way.
        assert!(alice.db.message_exists(&outcome.message_id).unwrap());
    }

    #[tokio::test]
    async fn offline_backup_failure_surfaces_retry_handle() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;

        // Online path healthy, DHT refuses the bucket write.
        alice.dht.set_accept_puts(false);
        let outcome = alice.messenger.send_message("g1", "half delivered").await.unwrap();
        assert_eq!(outcome.message_sent_status, MessageSentStatus::Online);
        assert!(outcome.warning.is_some());
        let handle = outcome.offline_backup_retry.unwrap();
        assert_eq!(alice.messenger.pending_backup_count(), 1);

        // Once the DHT recovers, the retry clears the debt.
        alice.dht.set_accept_puts(true);
        alice.messenger.retry_offline_backup(&handle).await.unwrap();
        assert_eq!(alice.messenger.pending_backup_count(), 0);
    }

    #[tokio::test]
    async fn replayed_sequence_is_dropped() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        alice.messenger.send_message("g1", "first").await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_some());

        // Same frame again: same message id and same seq, dropped.
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_none());
        assert_eq!(bob.db.get_member_seq("g1", 1, "alice").unwrap(), 1);

        // The next real message advances the high-water.
        alice.messenger.send_message("g1", "second").await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_some());
        assert_eq!(bob.db.get_member_seq("g1", 1, "alice").unwrap(), 2);
    }

    #[tokio::test]
    async fn wrong_topic_is_dropped() {
        let (alice, bob, topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        alice.messenger.send_message("g1", "hello").await.unwrap();
        let mut frame = frames.recv().await.unwrap();
        assert_eq!(frame.topic, topic);
        frame.topic = "somewhere-else".into();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_participant_sender_is_dropped() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        // Bob's roster no longer lists alice.
        let chat = bob.db.get_chat_by_group_id("g1").unwrap().unwrap();
        bob.db.remove_participant(chat.chat_id, "alice").unwrap();

        alice.messenger.send_message("g1", "hello").await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_verifies_then_vanishes() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        alice.messenger.heartbeat_tick().await;
        let frame = frames.recv().await.unwrap();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_none());
        // Nothing persisted for heartbeats.
        let chat = bob.db.get_chat_by_group_id("g1").unwrap().unwrap();
        assert!(bob.db.messages_for_chat(chat.chat_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_bucket_poll_delivers_backlog() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        // Bob offline: the message only lands in the bucket.
        alice.messenger.send_message("g1", "catch up later").await.unwrap();

        let delivered = bob
            .messenger
            .poll_offline_bucket("g1", &alice.identity.signing_pub_key_b64())
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        let chat = bob.db.get_chat_by_group_id("g1").unwrap().unwrap();
        let messages = bob.db.messages_for_chat(chat.chat_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "catch up later");

        // Polling again is idempotent.
        let delivered = bob
            .messenger
            .poll_offline_bucket("g1", &alice.identity.signing_pub_key_b64())
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn cross_epoch_frame_is_dropped() {
        let (alice, bob, _topic) = two_peer_fixture().await;
        alice.messenger.reconcile_topics().await;
        bob.messenger.reconcile_topics().await;
        let mut frames = bob.pubsub.messages();

        alice.messenger.send_message("g1", "old epoch").await.unwrap();
        let frame = frames.recv().await.unwrap();

        // Bob rotated before the frame arrived.
        let (_, new_key_b64) = group_key();
        bob.db.set_key_version("g1", 2).unwrap();
        bob.db
            .insert_group_key("g1", 2, &new_key_b64, Utc::now().timestamp_millis())
            .unwrap();
        assert!(bob.messenger.handle_frame(&frame).await.unwrap().is_none());
    }
}
