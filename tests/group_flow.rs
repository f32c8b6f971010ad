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


//! End-to-end group lifecycle over an in-process DHT and pubsub mesh:
//! create, invite, accept, rekey, chat online, catch up offline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiyeovo::config::GroupConfig;
use kiyeovo::crypto::{GROUP_KEY_LEN, b64_decode, b64_encode};
use kiyeovo::db::{Database, MessageSentStatus};
use kiyeovo::dht::{Dht, MemoryDht};
use kiyeovo::group::{
    EpochKeyWrapper, GroupInvite, GroupInviteResponse, GroupServiceError, GroupWelcome,
    StaticPairwiseSecrets,
};
use kiyeovo::offline::register_offline_rules;
use kiyeovo::pubsub::{MemoryPubsubHub, Pubsub};
use kiyeovo::{GroupMessagingCore, PeerIdentity};

/// Test stand-in for the pairwise RSA wrap: Base64 of the raw key.
struct PassthroughWrapper;

impl EpochKeyWrapper for PassthroughWrapper {
    fn wrap(
        &self,
        _recipient_peer_id: &str,
        key: &[u8; GROUP_KEY_LEN],
    ) -> Result<String, GroupServiceError> {
        Ok(b64_encode(key))
    }
}

struct TestNode {
    core: GroupMessagingCore,
    identity: Arc<PeerIdentity>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn test_node(
    name: &str,
    dht: &Arc<MemoryDht>,
    hub: &Arc<MemoryPubsubHub>,
    secrets: HashMap<String, String>,
) -> TestNode {
    let identity = Arc::new(PeerIdentity::generate(name, name));
    let db = Arc::new(Database::open_in_memory().unwrap());
    let pubsub = Arc::new(hub.node(name, false));
    let config = GroupConfig {
        publish_retry_delay: Duration::from_millis(10),
        ..GroupConfig::default()
    };
    let core = GroupMessagingCore::new(
        db,
        Arc::clone(dht) as Arc<dyn Dht>,
        pubsub as Arc<dyn Pubsub>,
        Arc::clone(&identity),
        Arc::new(StaticPairwiseSecrets::new(secrets)),
        Arc::new(PassthroughWrapper),
        config,
    );
    TestNode { core, identity }
}

/// Pull every control message of `kind` out of a peer's pairwise bucket.
async fn control_messages<T: serde::de::DeserializeOwned>(
    reader: &TestNode,
    scope: &str,
    sender: &PeerIdentity,
    kind: &str,
) -> Vec<T> {
    let messages = reader
        .core
        .offline
        .fetch_from(scope, &sender.verifying_key())
        .await
        .unwrap();
    let mut out = Vec::new();
    for message in messages {
        let content = b64_decode(&message.content).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&content).unwrap();
        if value.get("type").and_then(|t| t.as_str()) == Some(kind) {
            out.push(serde_json::from_value(value).unwrap());
        }
    }
    out
}

#[tokio::test]
async fn full_group_lifecycle() {
    init_tracing();
    let dht = Arc::new(MemoryDht::new());
    dht.add_peer("storage-node").await;
    register_offline_rules(&dht, GroupConfig::default().store_limits()).await;
    let hub = MemoryPubsubHub::new();

    let alice = test_node(
        "alice",
        &dht,
        &hub,
        HashMap::from([("bob".to_string(), "AB-SECRET".to_string())]),
    )
    .await;
    let bob = test_node(
        "bob",
        &dht,
        &hub,
        HashMap::from([("alice".to_string(), "AB-SECRET".to_string())]),
    )
    .await;

    // The creator knows the invitee as a contact.
    alice.core.db.upsert_user(&bob.identity.as_user_record()).unwrap();

    // Create and invite. The invite lands in alice's pairwise bucket.
    let chat = alice.core.service.create_group("climbing").await.unwrap();
    alice
        .core
        .service
        .invite_member(&chat.group_id, "bob")
        .await
        .unwrap();

    let invites: Vec<GroupInvite> =
        control_messages(&bob, "AB-SECRET", &alice.identity, "GROUP_INVITE").await;
    assert_eq!(invites.len(), 1);
    let invite = &invites[0];
    assert_eq!(invite.group_name, "climbing");

    // Bob accepts; the signed response waits in his pairwise bucket.
    bob.core.service.respond_to_invite(invite, true).await.unwrap();
    let responses: Vec<GroupInviteResponse> =
        control_messages(&alice, "AB-SECRET", &bob.identity, "GROUP_INVITE_RESPONSE").await;
    assert_eq!(responses.len(), 1);

    // The creator applies the response: roster grows, epoch rotates,
    // the welcome goes out.
    assert!(alice
        .core
        .service
        .handle_invite_response(&responses[0])
        .await
        .unwrap());
    let chat_after = alice
        .core
        .db
        .get_chat_by_group_id(&chat.group_id)
        .unwrap()
        .unwrap();
    assert_eq!(chat_after.key_version, 2);

    let welcomes: Vec<GroupWelcome> =
        control_messages(&bob, "AB-SECRET", &alice.identity, "GROUP_WELCOME").await;
    assert_eq!(welcomes.len(), 1);
    let welcome = &welcomes[0];
    assert_eq!(welcome.key_version, 2);

    // Bob adopts the roster and the (passthrough-wrapped) key.
    bob.core
        .service
        .apply_welcome(welcome, &welcome.encrypted_group_key)
        .await
        .unwrap();

    // Both sides derive the same topic from (group, epoch key).
    alice.core.messenger.reconcile_topics().await;
    bob.core.messenger.reconcile_topics().await;

    // Live chat: bob's frame pump is running, alice publishes, bob's
    // event stream delivers the plaintext.
    bob.core.start();
    let mut bob_events = bob.core.messenger.events();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = alice
        .core
        .messenger
        .send_message(&chat.group_id, "first ascent?")
        .await
        .unwrap();
    assert_eq!(outcome.message_sent_status, MessageSentStatus::Online);

    let event = tokio::time::timeout(Duration::from_secs(2), bob_events.recv())
        .await
        .expect("no message event")
        .unwrap();
    assert_eq!(event.message.content, "first ascent?");
    assert_eq!(event.message.sender_peer_id, "alice");

    bob.core.shutdown().await;
    alice.core.shutdown().await;
}

#[tokio::test]
async fn offline_member_catches_up_from_bucket() {
    init_tracing();
    let dht = Arc::new(MemoryDht::new());
    dht.add_peer("storage-node").await;
    register_offline_rules(&dht, GroupConfig::default().store_limits()).await;
    let hub = MemoryPubsubHub::new();

    let alice = test_node(
        "alice",
        &dht,
        &hub,
        HashMap::from([("bob".to_string(), "AB-SECRET".to_string())]),
    )
    .await;
    let bob = test_node(
        "bob",
        &dht,
        &hub,
        HashMap::from([("alice".to_string(), "AB-SECRET".to_string())]),
    )
    .await;

    alice.core.db.upsert_user(&bob.identity.as_user_record()).unwrap();
    let chat = alice.core.service.create_group("climbing").await.unwrap();
    let invite = alice
        .core
        .service
        .invite_member(&chat.group_id, "bob")
        .await
        .unwrap();
    bob.core.service.respond_to_invite(&invite, true).await.unwrap();
    let responses: Vec<GroupInviteResponse> =
        control_messages(&alice, "AB-SECRET", &bob.identity, "GROUP_INVITE_RESPONSE").await;
    alice
        .core
        .service
        .handle_invite_response(&responses[0])
        .await
        .unwrap();
    let welcomes: Vec<GroupWelcome> =
        control_messages(&bob, "AB-SECRET", &alice.identity, "GROUP_WELCOME").await;
    bob.core
        .service
        .apply_welcome(&welcomes[0], &welcomes[0].encrypted_group_key)
        .await
        .unwrap();

    // Alice is alone on the topic; the send falls back to the group
    // offline bucket.
    alice.core.messenger.reconcile_topics().await;
    let outcome = alice
        .core
        .messenger
        .send_message(&chat.group_id, "see you at the crag")
        .await
        .unwrap();
    assert_eq!(outcome.message_sent_status, MessageSentStatus::Offline);

    // Bob comes back and drains alice's bucket through the normal
    // receive pipeline.
    let delivered = bob
        .core
        .messenger
        .poll_offline_bucket(&chat.group_id, &alice.identity.signing_pub_key_b64())
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let bob_chat = bob
        .core
        .db
        .get_chat_by_group_id(&chat.group_id)
        .unwrap()
        .unwrap();
    let messages = bob.core.db.messages_for_chat(bob_chat.chat_id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "see you at the crag");

    // A second poll delivers nothing new.
    assert_eq!(
        bob.core
            .messenger
            .poll_offline_bucket(&chat.group_id, &alice.identity.signing_pub_key_b64())
            .await
            .unwrap(),
        0
    );
}
