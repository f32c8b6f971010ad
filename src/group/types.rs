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


//! On-wire group message schemas.
//!
//! Control messages (invite, response, welcome, state update) travel
//! through pairwise offline buckets; chat messages travel over pubsub.
//! Every variant is signed over its canonical JSON with the `signature`
//! field removed.

use ed25519_dalek::{SigningKey, VerifyingKey};
use kiyeovo_dht::GroupMemberEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{CryptoError, sign_canonical, verify_canonical};

/// Top-level message discriminator, stored in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessageType {
    #[serde(rename = "GROUP_INVITE")]
    Invite,
    #[serde(rename = "GROUP_INVITE_RESPONSE")]
    InviteResponse,
    #[serde(rename = "GROUP_WELCOME")]
    Welcome,
    #[serde(rename = "GROUP_STATE_UPDATE")]
    StateUpdate,
    #[serde(rename = "GROUP_MESSAGE")]
    Message,
}

impl GroupMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invite => "GROUP_INVITE",
            Self::InviteResponse => "GROUP_INVITE_RESPONSE",
            Self::Welcome => "GROUP_WELCOME",
            Self::StateUpdate => "GROUP_STATE_UPDATE",
            Self::Message => "GROUP_MESSAGE",
        }
    }
}

/// An invitation to join a group, delivered to the invitee.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvite {
    #[serde(rename = "type")]
    pub kind: GroupMessageType,
    pub invite_id: String,
    pub group_id: String,
    pub group_name: String,
    pub creator_peer_id: String,
    pub target_peer_id: String,
    pub timestamp: i64,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl GroupInvite {
    pub fn new(
        group_id: &str,
        group_name: &str,
        creator_peer_id: &str,
        target_peer_id: &str,
        now: i64,
        lifetime_ms: i64,
    ) -> Self {
        Self {
            kind: GroupMessageType::Invite,
            invite_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            creator_peer_id: creator_peer_id.to_string(),
            target_peer_id: target_peer_id.to_string(),
            timestamp: now,
            expires_at: now + lifetime_ms,
            signature: String::new(),
        }
    }

    pub fn seal(&mut self, key: &SigningKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        self.signature = sign_canonical(key, &tmp)?;
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        verify_canonical(key, &tmp, &self.signature)
    }
}

/// The invitee's accept/decline answer, delivered back to the creator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInviteResponse {
    #[serde(rename = "type")]
    pub kind: GroupMessageType,
    pub invite_id: String,
    pub group_id: String,
    pub responder_peer_id: String,
    pub accepted: bool,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl GroupInviteResponse {
    pub fn new(invite: &GroupInvite, responder_peer_id: &str, accepted: bool, now: i64) -> Self {
        Self {
            kind: GroupMessageType::InviteResponse,
            invite_id: invite.invite_id.clone(),
            group_id: invite.group_id.clone(),
            responder_peer_id: responder_peer_id.to_string(),
            accepted,
            timestamp: now,
            signature: String::new(),
        }
    }

    pub fn seal(&mut self, key: &SigningKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        self.signature = sign_canonical(key, &tmp)?;
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        verify_canonical(key, &tmp, &self.signature)
    }
}

/// First key delivery to a newly joined member. The epoch key is wrapped
/// with the recipient's offline (RSA) key by the pairwise layer; this
/// module carries it opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupWelcome {
    #[serde(rename = "type")]
    pub kind: GroupMessageType,
    pub message_id: String,
    pub group_id: String,
    pub creator_peer_id: String,
    pub key_version: u64,
    pub encrypted_group_key: String,
    pub members: Vec<GroupMemberEntry>,
    pub activated_at: i64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl GroupWelcome {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: &str,
        creator_peer_id: &str,
        key_version: u64,
        encrypted_group_key: &str,
        members: Vec<GroupMemberEntry>,
        activated_at: i64,
        now: i64,
    ) -> Self {
        Self {
            kind: GroupMessageType::Welcome,
            message_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            creator_peer_id: creator_peer_id.to_string(),
            key_version,
            encrypted_group_key: encrypted_group_key.to_string(),
            members,
            activated_at,
            timestamp: now,
            signature: String::new(),
        }
    }

    pub fn seal(&mut self, key: &SigningKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        self.signature = sign_canonical(key, &tmp)?;
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        verify_canonical(key, &tmp, &self.signature)
    }
}

/// Roster/rekey notice pushed to existing members on every membership
/// change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStateUpdate {
    #[serde(rename = "type")]
    pub kind: GroupMessageType,
    pub message_id: String,
    pub group_id: String,
    pub creator_peer_id: String,
    pub key_version: u64,
    /// What changed: `member_added`, `member_removed` or `member_left`.
    pub update: String,
    pub encrypted_group_key: String,
    pub members: Vec<GroupMemberEntry>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl GroupStateUpdate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: &str,
        creator_peer_id: &str,
        key_version: u64,
        update: &str,
        encrypted_group_key: &str,
        members: Vec<GroupMemberEntry>,
        now: i64,
    ) -> Self {
        Self {
            kind: GroupMessageType::StateUpdate,
            message_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            creator_peer_id: creator_peer_id.to_string(),
            key_version,
            update: update.to_string(),
            encrypted_group_key: encrypted_group_key.to_string(),
            members,
            timestamp: now,
            signature: String::new(),
        }
    }

    pub fn seal(&mut self, key: &SigningKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        self.signature = sign_canonical(key, &tmp)?;
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        verify_canonical(key, &tmp, &self.signature)
    }
}

/// Content class of a pubsub chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupChatKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "system")]
    System,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// The pubsub wire frame for group chat.
///
/// Heartbeats are contentless: no sequence number, ciphertext or nonce.
/// Text and system messages carry all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatMessage {
    #[serde(rename = "type")]
    pub kind: GroupMessageType,
    pub group_id: String,
    pub key_version: u64,
    pub sender_peer_id: String,
    pub message_id: String,
    pub timestamp: i64,
    pub message_type: GroupChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl GroupChatMessage {
    pub fn heartbeat(group_id: &str, key_version: u64, sender_peer_id: &str, now: i64) -> Self {
        Self {
            kind: GroupMessageType::Message,
            group_id: group_id.to_string(),
            key_version,
            sender_peer_id: sender_peer_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: now,
            message_type: GroupChatKind::Heartbeat,
            seq: None,
            encrypted_content: None,
            nonce: None,
            signature: String::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == GroupChatKind::Heartbeat
    }

    /// Structural check of the heartbeat/content field split.
    pub fn shape_check(&self) -> Result<(), &'static str> {
        if self.kind != GroupMessageType::Message {
            return Err("not a group chat message");
        }
        let has_content =
            self.seq.is_some() && self.encrypted_content.is_some() && self.nonce.is_some();
        let has_any = self.seq.is_some() || self.encrypted_content.is_some() || self.nonce.is_some();
        match self.message_type {
            GroupChatKind::Heartbeat if has_any => Err("heartbeat carries content fields"),
            GroupChatKind::Heartbeat => Ok(()),
            _ if !has_content => Err("content message missing seq, ciphertext or nonce"),
            _ => Ok(()),
        }
    }

    pub fn seal(&mut self, key: &SigningKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        self.signature = sign_canonical(key, &tmp)?;
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CryptoError> {
        let mut tmp = self.clone();
        tmp.signature.clear();
        verify_canonical(key, &tmp, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn invite_sign_verify() {
        let creator = key();
        let mut invite = GroupInvite::new("g1", "climbing", "peer-a", "peer-b", 1_000, 60_000);
        invite.seal(&creator).unwrap();
        assert!(invite.verify(&creator.verifying_key()).is_ok());

        invite.target_peer_id = "peer-c".into();
        assert!(invite.verify(&creator.verifying_key()).is_err());
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let mut invite = GroupInvite::new("g1", "climbing", "peer-a", "peer-b", 1_000, 60_000);
        invite.seal(&key()).unwrap();
        let value = serde_json::to_value(&invite).unwrap();
        assert_eq!(value["type"], "GROUP_INVITE");
        assert!(value.get("inviteId").is_some());
        assert!(value.get("targetPeerId").is_some());
        assert!(value.get("expiresAt").is_some());
    }

    #[test]
    fn heartbeat_shape() {
        let hb = GroupChatMessage::heartbeat("g1", 1, "peer-a", 1_000);
        assert!(hb.shape_check().is_ok());

        let mut bad = hb.clone();
        bad.seq = Some(3);
        assert!(bad.shape_check().is_err());

        let wire = serde_json::to_value(&hb).unwrap();
        assert_eq!(wire["messageType"], "heartbeat");
        assert!(wire.get("seq").is_none());
        assert!(wire.get("encryptedContent").is_none());
    }

    #[test]
    fn content_message_requires_all_fields() {
        let mut msg = GroupChatMessage::heartbeat("g1", 1, "peer-a", 1_000);
        msg.message_type = GroupChatKind::Text;
        assert!(msg.shape_check().is_err());

        msg.seq = Some(1);
        msg.encrypted_content = Some("YWJj".into());
        msg.nonce = Some("bm9uY2U=".into());
        assert!(msg.shape_check().is_ok());
    }

    #[test]
    fn chat_message_signature_covers_payload() {
        let sender = key();
        let mut msg = GroupChatMessage::heartbeat("g1", 1, "peer-a", 1_000);
        msg.message_type = GroupChatKind::Text;
        msg.seq = Some(7);
        msg.encrypted_content = Some("YWJj".into());
        msg.nonce = Some("bm9uY2U=".into());
        msg.seal(&sender).unwrap();
        assert!(msg.verify(&sender.verifying_key()).is_ok());

        msg.seq = Some(8);
        assert!(msg.verify(&sender.verifying_key()).is_err());
    }

    #[test]
    fn welcome_roundtrip_through_json() {
        let creator = key();
        let mut welcome =
            GroupWelcome::new("g1", "peer-a", 2, "d3JhcHBlZA==", vec![], 1_000, 1_000);
        welcome.seal(&creator).unwrap();

        let bytes = serde_json::to_vec(&welcome).unwrap();
        let parsed: GroupWelcome = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.verify(&creator.verifying_key()).is_ok());
        assert_eq!(parsed.key_version, 2);
    }
}
