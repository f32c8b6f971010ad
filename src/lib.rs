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


//! Kiyeovo - serverless P2P chat core
//!
//! The group-messaging subsystem of a peer-to-peer chat application:
//! signed membership state in the DHT, encrypted real-time messages over
//! gossip pubsub, per-sender offline buckets for everyone who missed
//! them, and republish loops that keep delivering until the other side
//! acknowledges.

#![deny(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod db;
pub mod dht;
pub mod group;
pub mod offline;
pub mod pubsub;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use kiyeovo_dht::GroupMemberEntry;
use rand::RngCore;

use config::GroupConfig;
use db::Database;
use dht::{Dht, DhtRepublisher};
use group::{
    EpochKeyWrapper, GroupAckRepublisher, GroupInfoPublisher, GroupMessenger, GroupService,
    OfflineControlSender, PairwiseSecrets,
};
use offline::OfflineBucketManager;
use pubsub::Pubsub;

/// The local node's identity: peer id, Ed25519 signing keypair and the
/// Base64 public half of the offline (RSA) keypair the pairwise layer
/// wraps epoch keys with.
pub struct PeerIdentity {
    pub peer_id: String,
    pub username: String,
    pub offline_pub_key_b64: String,
    signing: SigningKey,
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .field("username", &self.username)
            .field("signing", &"SigningKey")
            .finish()
    }
}

impl PeerIdentity {
    pub fn new(
        peer_id: &str,
        username: &str,
        signing: SigningKey,
        offline_pub_key_b64: &str,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            username: username.to_string(),
            offline_pub_key_b64: offline_pub_key_b64.to_string(),
            signing,
        }
    }

    /// Fresh identity with a random signing key. The offline key is a
    /// random placeholder; hosts with a real pairwise layer pass their
    /// RSA public key through `new`.
    pub fn generate(peer_id: &str, username: &str) -> Self {
        let mut offline = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut offline);
        Self::new(
            peer_id,
            username,
            SigningKey::generate(&mut rand::rngs::OsRng),
            &BASE64.encode(offline),
        )
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64 of the Ed25519 verifying key, as stored in rosters.
    pub fn signing_pub_key_b64(&self) -> String {
        BASE64.encode(self.verifying_key().as_bytes())
    }

    /// This identity as a users-table row.
    pub fn as_user_record(&self) -> db::UserRecord {
        db::UserRecord {
            peer_id: self.peer_id.clone(),
            username: self.username.clone(),
            signing_pub_key: self.signing_pub_key_b64(),
            offline_pub_key: self.offline_pub_key_b64.clone(),
        }
    }

    /// This identity as a roster entry.
    pub fn as_member_entry(&self) -> GroupMemberEntry {
        GroupMemberEntry {
            peer_id: self.peer_id.clone(),
            username: self.username.clone(),
            signing_pub_key: self.signing_pub_key_b64(),
            offline_pub_key: self.offline_pub_key_b64.clone(),
        }
    }
}

/// All group-messaging components wired together over one DHT, one
/// pubsub and one database.
#[derive(Clone)]
pub struct GroupMessagingCore {
    pub db: Arc<Database>,
    pub republisher: Arc<DhtRepublisher>,
    pub offline: Arc<OfflineBucketManager>,
    pub info: Arc<GroupInfoPublisher>,
    pub acks: Arc<GroupAckRepublisher>,
    pub messenger: Arc<GroupMessenger>,
    pub service: Arc<GroupService>,
}

impl std::fmt::Debug for GroupMessagingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMessagingCore")
            .field("db", &"Arc<Database>")
            .field("republisher", &"Arc<DhtRepublisher>")
            .field("messenger", &"Arc<GroupMessenger>")
            .finish()
    }
}

impl GroupMessagingCore {
    pub fn new(
        db: Arc<Database>,
        dht: Arc<dyn Dht>,
        pubsub: Arc<dyn Pubsub>,
        identity: Arc<PeerIdentity>,
        secrets: Arc<dyn PairwiseSecrets>,
        wrapper: Arc<dyn EpochKeyWrapper>,
        config: GroupConfig,
    ) -> Self {
        let republisher = Arc::new(DhtRepublisher::new(
            Arc::clone(&dht),
            config.dht_republish_interval,
            config.dht_republish_jitter,
        ));
        let offline = Arc::new(OfflineBucketManager::new(
            Arc::clone(&dht),
            Arc::clone(&republisher),
            Arc::clone(&identity),
            config.clone(),
        ));
        let control_sender = Arc::new(OfflineControlSender::new(
            Arc::clone(&offline),
            secrets,
            Arc::clone(&identity),
            config.clone(),
        ));
        let info = Arc::new(GroupInfoPublisher::new(
            Arc::clone(&db),
            Arc::clone(&dht),
            Arc::clone(&identity),
            config.clone(),
        ));
        let acks = Arc::new(GroupAckRepublisher::new(
            Arc::clone(&db),
            Arc::clone(&dht),
            Arc::clone(&identity),
            Arc::clone(&control_sender) as Arc<dyn group::ControlMessageSender>,
            config.clone(),
        ));
        let messenger = GroupMessenger::new(
            Arc::clone(&db),
            pubsub,
            Arc::clone(&offline),
            Arc::clone(&identity),
            config.clone(),
        );
        let service = Arc::new(GroupService::new(
            Arc::clone(&db),
            Arc::clone(&identity),
            Arc::clone(&info),
            control_sender as Arc<dyn group::ControlMessageSender>,
            wrapper,
            config,
        ));
        Self {
            db,
            republisher,
            offline,
            info,
            acks,
            messenger,
            service,
        }
    }

    /// Start every background loop.
    pub fn start(&self) {
        self.republisher.start();
        self.info.start();
        self.acks.start();
        self.messenger.start();
    }

    /// Stop every background loop and drop pubsub subscriptions.
    pub async fn shutdown(&self) {
        self.messenger.shutdown().await;
        self.acks.stop();
        self.info.stop();
        self.republisher.stop();
    }
}
