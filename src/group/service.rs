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


//! Group membership lifecycle.
//!
//! The creator drives all membership changes: invites go out and are
//! re-sent until answered, every accepted response rotates the epoch
//! key, and each rotation fans out a welcome (to the newcomer) plus
//! state updates (to everyone else) through the pending-ACK machinery.
//! Members apply welcomes and state updates to converge on the same
//! roster and key.

use std::sync::Arc;

use chrono::Utc;
use kiyeovo_dht::GroupMemberEntry;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::PeerIdentity;
use crate::config::GroupConfig;
use crate::crypto::{self, CryptoError, GROUP_KEY_LEN, b64_encode, decode_verifying_key};
use crate::db::{Chat, ChatStatus, Database, DbError, GroupStatus, UserRecord};
use crate::group::ack::ControlMessageSender;
use crate::group::info::{GroupInfoPublisher, InfoPublishError};
use crate::group::types::{
    GroupInvite, GroupInviteResponse, GroupMessageType, GroupStateUpdate, GroupWelcome,
};

#[derive(Debug, thiserror::Error)]
pub enum GroupServiceError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("info publish error: {0}")]
    Info(#[from] InfoPublishError),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("local node is not the creator of group {0}")]
    NotCreator(String),
    #[error("no chat for group {0}")]
    ChatMissing(String),
    #[error("peer {0} is not a known user")]
    UnknownPeer(String),
    #[error("peer {0} is already a member")]
    AlreadyMember(String),
    #[error("message failed verification")]
    BadSignature,
    #[error("key wrap failed: {0}")]
    KeyWrap(String),
}

/// Wraps epoch keys for a recipient with their offline (RSA) key. Owned
/// by the pairwise messaging layer; this crate never sees RSA material.
pub trait EpochKeyWrapper: Send + Sync {
    fn wrap(
        &self,
        recipient_peer_id: &str,
        key: &[u8; GROUP_KEY_LEN],
    ) -> Result<String, GroupServiceError>;
}

/// Creator-side and member-side membership operations.
pub struct GroupService {
    db: Arc<Database>,
    identity: Arc<PeerIdentity>,
    info: Arc<GroupInfoPublisher>,
    sender: Arc<dyn ControlMessageSender>,
    wrapper: Arc<dyn EpochKeyWrapper>,
    config: GroupConfig,
}

impl GroupService {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<PeerIdentity>,
        info: Arc<GroupInfoPublisher>,
        sender: Arc<dyn ControlMessageSender>,
        wrapper: Arc<dyn EpochKeyWrapper>,
        config: GroupConfig,
    ) -> Self {
        Self {
            db,
            identity,
            info,
            sender,
            wrapper,
            config,
        }
    }

    // ------------------------- creator side -------------------------

    /// Create a group with the local node as sole member and publish the
    /// first epoch.
    pub async fn create_group(&self, name: &str) -> Result<Chat, GroupServiceError> {
        let group_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let key = crypto::generate_group_key();

        let chat_id = self.db.create_group_chat(
            &group_id,
            name,
            &self.identity.peer_id,
            ChatStatus::Active,
            GroupStatus::Active,
            1,
            &self.identity.peer_id,
        )?;
        self.db.add_participant(chat_id, &self.identity.peer_id)?;
        self.db.upsert_user(&self.identity.as_user_record())?;
        self.db
            .insert_group_key(&group_id, 1, &b64_encode(&key), now)?;

        let roster = self.roster(chat_id)?;
        self.info.publish_epoch(&group_id, 1, roster).await?;

        info!(%group_id, name, "group created");
        self.db
            .get_chat_by_group_id(&group_id)?
            .ok_or(GroupServiceError::ChatMissing(group_id))
    }

    /// Invite a peer. The signed invite sits in the pending-ACK table
    /// until it is delivered or expires; the first send happens inline.
    pub async fn invite_member(
        &self,
        group_id: &str,
        target_peer_id: &str,
    ) -> Result<GroupInvite, GroupServiceError> {
        let chat = self.require_creator(group_id)?;
        if self.db.is_participant(chat.chat_id, target_peer_id)? {
            return Err(GroupServiceError::AlreadyMember(target_peer_id.to_string()));
        }

        let now = Utc::now().timestamp_millis();
        let mut invite = GroupInvite::new(
            group_id,
            &chat.name,
            &self.identity.peer_id,
            target_peer_id,
            now,
            self.config.invite_lifetime_ms,
        );
        invite.seal(self.identity.signing_key())?;

        let payload = serde_json::to_vec(&invite)?;
        self.db.upsert_pending_ack(
            group_id,
            target_peer_id,
            GroupMessageType::Invite.as_str(),
            &payload,
            now,
        )?;

        match self.sender.send_to_member(target_peer_id, &payload).await {
            Ok(()) => {
                self.db.update_pending_ack_last_published(
                    group_id,
                    target_peer_id,
                    GroupMessageType::Invite.as_str(),
                    now,
                )?;
            }
            Err(e) => {
                debug!(target_peer_id, error = %e, "invite send deferred to republisher");
            }
        }
        info!(group_id, target_peer_id, invite_id = %invite.invite_id, "invite queued");
        Ok(invite)
    }

    /// Process an invite response addressed to the local creator.
    /// Accepting rotates the epoch and fans out the key.
    pub async fn handle_invite_response(
        &self,
        response: &GroupInviteResponse,
    ) -> Result<bool, GroupServiceError> {
        let chat = self.require_creator(&response.group_id)?;

        let responder = self
            .db
            .get_user(&response.responder_peer_id)?
            .ok_or_else(|| GroupServiceError::UnknownPeer(response.responder_peer_id.clone()))?;
        let responder_key = decode_verifying_key(&responder.signing_pub_key)?;
        response
            .verify(&responder_key)
            .map_err(|_| GroupServiceError::BadSignature)?;

        // Either way the invite is answered; the pending row is done.
        self.db.remove_pending_ack(
            &response.group_id,
            &response.responder_peer_id,
            GroupMessageType::Invite.as_str(),
        )?;

        if !response.accepted {
            info!(group_id = %response.group_id, responder = %response.responder_peer_id,
                "invite declined");
            return Ok(false);
        }

        self.db
            .add_participant(chat.chat_id, &response.responder_peer_id)?;
        self.advance_epoch(
            &response.group_id,
            "member_added",
            Some(&response.responder_peer_id),
        )
        .await?;
        info!(group_id = %response.group_id, responder = %response.responder_peer_id,
            "member joined, epoch advanced");
        Ok(true)
    }

    /// Remove a member and rotate the key so they cannot follow the
    /// group to the new topic.
    pub async fn remove_member(
        &self,
        group_id: &str,
        peer_id: &str,
    ) -> Result<(), GroupServiceError> {
        let chat = self.require_creator(group_id)?;
        self.db.remove_participant(chat.chat_id, peer_id)?;
        self.advance_epoch(group_id, "member_removed", None).await?;
        info!(group_id, peer_id, "member removed, epoch advanced");
        Ok(())
    }

    /// Generate and activate the next epoch, publish its info records
    /// and queue the key deliveries.
    async fn advance_epoch(
        &self,
        group_id: &str,
        update_kind: &str,
        welcome_target: Option<&str>,
    ) -> Result<u64, GroupServiceError> {
        let chat = self
            .db
            .get_chat_by_group_id(group_id)?
            .ok_or_else(|| GroupServiceError::ChatMissing(group_id.to_string()))?;
        let new_version = chat.key_version + 1;
        let now = Utc::now().timestamp_millis();
        let key = crypto::generate_group_key();

        self.db
            .insert_group_key(group_id, new_version, &b64_encode(&key), now)?;
        self.db.set_key_version(group_id, new_version)?;

        let roster = self.roster(chat.chat_id)?;
        self.info
            .publish_epoch(group_id, new_version, roster.clone())
            .await?;

        for member in &roster {
            if member.peer_id == self.identity.peer_id {
                continue;
            }
            let wrapped = self.wrapper.wrap(&member.peer_id, &key)?;
            let (message_type, payload) = if welcome_target == Some(member.peer_id.as_str()) {
                let mut welcome = GroupWelcome::new(
                    group_id,
                    &self.identity.peer_id,
                    new_version,
                    &wrapped,
                    roster.clone(),
                    now,
                    now,
                );
                welcome.seal(self.identity.signing_key())?;
                (GroupMessageType::Welcome, serde_json::to_vec(&welcome)?)
            } else {
                let mut update = GroupStateUpdate::new(
                    group_id,
                    &self.identity.peer_id,
                    new_version,
                    update_kind,
                    &wrapped,
                    roster.clone(),
                    now,
                );
                update.seal(self.identity.signing_key())?;
                (GroupMessageType::StateUpdate, serde_json::to_vec(&update)?)
            };
            self.db.upsert_pending_ack(
                group_id,
                &member.peer_id,
                message_type.as_str(),
                &payload,
                now,
            )?;
            if let Err(e) = self.sender.send_to_member(&member.peer_id, &payload).await {
                debug!(member = %member.peer_id, error = %e,
                    "key delivery deferred to republisher");
            } else {
                self.db.update_pending_ack_last_published(
                    group_id,
                    &member.peer_id,
                    message_type.as_str(),
                    now,
                )?;
            }
        }
        Ok(new_version)
    }

    fn require_creator(&self, group_id: &str) -> Result<Chat, GroupServiceError> {
        let chat = self
            .db
            .get_chat_by_group_id(group_id)?
            .ok_or_else(|| GroupServiceError::ChatMissing(group_id.to_string()))?;
        if chat.group_creator_peer_id != self.identity.peer_id {
            return Err(GroupServiceError::NotCreator(group_id.to_string()));
        }
        Ok(chat)
    }

    fn roster(&self, chat_id: i64) -> Result<Vec<GroupMemberEntry>, GroupServiceError> {
        let mut entries = Vec::new();
        for peer_id in self.db.participants(chat_id)? {
            if peer_id == self.identity.peer_id {
                entries.push(self.identity.as_member_entry());
                continue;
            }
            let user = self
                .db
                .get_user(&peer_id)?
                .ok_or_else(|| GroupServiceError::UnknownPeer(peer_id.clone()))?;
            entries.push(GroupMemberEntry {
                peer_id: user.peer_id,
                username: user.username,
                signing_pub_key: user.signing_pub_key,
                offline_pub_key: user.offline_pub_key,
            });
        }
        Ok(entries)
    }

    // -------------------------- member side --------------------------

    /// Respond to an invite and queue the signed answer for delivery to
    /// the creator.
    pub async fn respond_to_invite(
        &self,
        invite: &GroupInvite,
        accepted: bool,
    ) -> Result<GroupInviteResponse, GroupServiceError> {
        let now = Utc::now().timestamp_millis();
        let mut response = GroupInviteResponse::new(invite, &self.identity.peer_id, accepted, now);
        response.seal(self.identity.signing_key())?;

        let payload = serde_json::to_vec(&response)?;
        self.db.upsert_pending_ack(
            &invite.group_id,
            &invite.creator_peer_id,
            GroupMessageType::InviteResponse.as_str(),
            &payload,
            now,
        )?;
        if let Err(e) = self
            .sender
            .send_to_creator(&invite.creator_peer_id, &payload)
            .await
        {
            debug!(creator = %invite.creator_peer_id, error = %e,
                "response send deferred to republisher");
        }
        Ok(response)
    }

    /// Apply a welcome: adopt the roster and the (already unwrapped)
    /// epoch key, creating the chat if this is the first contact.
    pub async fn apply_welcome(
        &self,
        welcome: &GroupWelcome,
        group_key_b64: &str,
    ) -> Result<i64, GroupServiceError> {
        self.verify_creator_signed(
            &welcome.members,
            &welcome.creator_peer_id,
            |key| welcome.verify(key).is_ok(),
        )?;

        let chat_id = match self.db.get_chat_by_group_id(&welcome.group_id)? {
            Some(chat) => {
                self.db.set_chat_status(&welcome.group_id, ChatStatus::Active)?;
                self.db
                    .set_group_status(&welcome.group_id, GroupStatus::Active)?;
                chat.chat_id
            }
            None => self.db.create_group_chat(
                &welcome.group_id,
                "",
                &welcome.creator_peer_id,
                ChatStatus::Active,
                GroupStatus::Active,
                welcome.key_version,
                &welcome.creator_peer_id,
            )?,
        };
        self.db
            .set_key_version(&welcome.group_id, welcome.key_version)?;
        self.db.insert_group_key(
            &welcome.group_id,
            welcome.key_version,
            group_key_b64,
            welcome.activated_at,
        )?;
        self.sync_roster(chat_id, &welcome.members)?;
        info!(group_id = %welcome.group_id, key_version = welcome.key_version,
            "welcome applied");
        Ok(chat_id)
    }

    /// Apply a state update: adopt the new roster and epoch key, or mark
    /// the chat removed when the local node fell off the roster.
    pub async fn apply_state_update(
        &self,
        update: &GroupStateUpdate,
        group_key_b64: &str,
    ) -> Result<(), GroupServiceError> {
        let chat = self
            .db
            .get_chat_by_group_id(&update.group_id)?
            .ok_or_else(|| GroupServiceError::ChatMissing(update.group_id.clone()))?;
        self.verify_creator_signed(
            &update.members,
            &update.creator_peer_id,
            |key| update.verify(key).is_ok(),
        )?;

        let still_member = update
            .members
            .iter()
            .any(|m| m.peer_id == self.identity.peer_id);
        if !still_member {
            warn!(group_id = %update.group_id, "removed from group");
            self.db
                .set_group_status(&update.group_id, GroupStatus::Removed)?;
            return Ok(());
        }

        self.db
            .set_key_version(&update.group_id, update.key_version)?;
        self.db.insert_group_key(
            &update.group_id,
            update.key_version,
            group_key_b64,
            update.timestamp,
        )?;
        self.sync_roster(chat.chat_id, &update.members)?;
        info!(group_id = %update.group_id, key_version = update.key_version,
            kind = %update.update, "state update applied");
        Ok(())
    }

    /// Leave the group locally. The reconciler drops the subscription on
    /// its next pass.
    pub fn leave_group(&self, group_id: &str) -> Result<(), GroupServiceError> {
        self.db.set_group_status(group_id, GroupStatus::Left)?;
        info!(group_id, "left group");
        Ok(())
    }

    fn verify_creator_signed(
        &self,
        members: &[GroupMemberEntry],
        creator_peer_id: &str,
        check: impl Fn(&ed25519_dalek::VerifyingKey) -> bool,
    ) -> Result<(), GroupServiceError> {
        let creator = members
            .iter()
            .find(|m| m.peer_id == creator_peer_id)
            .ok_or_else(|| GroupServiceError::UnknownPeer(creator_peer_id.to_string()))?;
        let key = decode_verifying_key(&creator.signing_pub_key)?;
        if !check(&key) {
            return Err(GroupServiceError::BadSignature);
        }
        Ok(())
    }

    fn sync_roster(
        &self,
        chat_id: i64,
        members: &[GroupMemberEntry],
    ) -> Result<(), GroupServiceError> {
        let incoming: Vec<&str> = members.iter().map(|m| m.peer_id.as_str()).collect();
        for existing in self.db.participants(chat_id)? {
            if !incoming.contains(&existing.as_str()) {
                self.db.remove_participant(chat_id, &existing)?;
            }
        }
        for member in members {
            self.db.add_participant(chat_id, &member.peer_id)?;
            if member.peer_id != self.identity.peer_id {
                self.db.upsert_user(&UserRecord {
                    peer_id: member.peer_id.clone(),
                    username: member.username.clone(),
                    signing_pub_key: member.signing_pub_key.clone(),
                    offline_pub_key: member.offline_pub_key.clone(),
                })?;
            }
        }
        Ok(())
    }
}
