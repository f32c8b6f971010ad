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


//! Group info publisher.
//!
//! Each epoch produces two DHT records: the immutable snapshot at
//! `/kiyeovo-group-info/<id>/v<N>` and the mutable `latest` pointer.
//! Publishes are queued in the database and retried with jittered
//! backoff until they land or become pointless, so a creator that
//! rotates the key while partitioned converges once connectivity
//! returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use kiyeovo_dht::{
    GroupInfoLatest, GroupInfoVersioned, GroupMemberEntry, group_info_latest_key,
    group_info_versioned_key,
};
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::PeerIdentity;
use crate::config::GroupConfig;
use crate::db::{Database, DbError, PendingGroupInfoPublish};
use crate::dht::{Dht, DhtError, put_record};

const CYCLE_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum InfoPublishError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("dht error: {0}")]
    Dht(#[from] DhtError),
    #[error("schema error: {0}")]
    Schema(#[from] kiyeovo_dht::DhtSchemaError),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Publishes and republishes the paired group-info records.
pub struct GroupInfoPublisher {
    db: Arc<Database>,
    dht: Arc<dyn Dht>,
    identity: Arc<PeerIdentity>,
    config: GroupConfig,
    in_flight: AtomicBool,
    running: AtomicBool,
    cancel: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl GroupInfoPublisher {
    pub fn new(
        db: Arc<Database>,
        dht: Arc<dyn Dht>,
        identity: Arc<PeerIdentity>,
        config: GroupConfig,
    ) -> Self {
        Self {
            db,
            dht,
            identity,
            config,
            in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// Build, sign, queue and (best-effort) publish the records for a
    /// newly activated epoch. A failed put leaves the queued row for the
    /// periodic cycle.
    pub async fn publish_epoch(
        &self,
        group_id: &str,
        key_version: u64,
        members: Vec<GroupMemberEntry>,
    ) -> Result<(), InfoPublishError> {
        let now = Utc::now().timestamp_millis();

        let prev_version_hash = if key_version > 1 {
            self.db
                .get_group_key_for_epoch(group_id, key_version - 1)?
                .and_then(|record| record.state_hash)
        } else {
            None
        };

        let member_signing_pub_keys = members
            .iter()
            .map(|m| (m.peer_id.clone(), m.signing_pub_key.clone()))
            .collect();
        let mut sender_seq_boundaries = std::collections::BTreeMap::new();
        if key_version > 1 {
            for member in &members {
                let seq = self
                    .db
                    .get_member_seq(group_id, key_version - 1, &member.peer_id)?;
                sender_seq_boundaries.insert(member.peer_id.clone(), seq);
            }
        }

        let mut versioned = GroupInfoVersioned {
            group_id: group_id.to_string(),
            version: key_version,
            prev_version_hash,
            members,
            member_signing_pub_keys,
            activated_at: now,
            sender_seq_boundaries,
            state_hash: String::new(),
            creator_signature: String::new(),
        };
        versioned.seal(self.identity.signing_key())?;

        let mut latest = GroupInfoLatest {
            group_id: group_id.to_string(),
            latest_version: key_version,
            latest_state_hash: versioned.state_hash.clone(),
            last_updated: now,
            creator_signature: String::new(),
        };
        latest.seal(self.identity.signing_key())?;

        let row = PendingGroupInfoPublish {
            group_id: group_id.to_string(),
            key_version,
            versioned_payload: serde_json::to_vec(&versioned)?,
            latest_payload: serde_json::to_vec(&latest)?,
            versioned_dht_key: group_info_versioned_key(group_id, key_version),
            latest_dht_key: group_info_latest_key(group_id),
            attempts: 0,
            next_retry_at: now,
            last_error: None,
        };
        self.db.enqueue_group_info_publish(&row)?;
        info!(group_id, key_version, "group info publish queued");

        // First attempt happens inline; a failure only schedules the
        // retry.
        self.process_row(row, now).await?;
        Ok(())
    }

    /// One pass over the due queue. Re-entrant calls are no-ops.
    pub async fn run_cycle(&self) -> Result<(), InfoPublishError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("group info cycle already running, skipping");
            return Ok(());
        }
        let result = self.cycle_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn cycle_inner(&self) -> Result<(), InfoPublishError> {
        let now = Utc::now().timestamp_millis();
        let due = self.db.get_due_pending_group_info_publishes(now, CYCLE_BATCH)?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "group info cycle");
        for row in due {
            let group_id = row.group_id.clone();
            let key_version = row.key_version;
            if let Err(e) = self.process_row(row, now).await {
                warn!(%group_id, key_version, error = %e, "group info item failed, continuing");
            }
        }
        Ok(())
    }

    async fn process_row(
        &self,
        row: PendingGroupInfoPublish,
        now: i64,
    ) -> Result<(), InfoPublishError> {
        if row.attempts >= self.config.info_republish_max_attempts {
            warn!(
                group_id = %row.group_id,
                key_version = row.key_version,
                attempts = row.attempts,
                "dropping group info publish: attempt cap"
            );
            self.db
                .remove_pending_group_info_publish(&row.group_id, row.key_version)?;
            return Ok(());
        }
        if self.db.get_chat_by_group_id(&row.group_id)?.is_none() {
            debug!(group_id = %row.group_id, "dropping group info publish: group missing");
            self.db
                .remove_pending_group_info_publish(&row.group_id, row.key_version)?;
            return Ok(());
        }
        if self
            .db
            .get_group_key_for_epoch(&row.group_id, row.key_version)?
            .is_none()
        {
            debug!(group_id = %row.group_id, key_version = row.key_version,
                "dropping group info publish: epoch missing");
            self.db
                .remove_pending_group_info_publish(&row.group_id, row.key_version)?;
            return Ok(());
        }

        // Payloads must still decode and still belong to the row they
        // were queued under.
        let parsed: Result<(GroupInfoVersioned, GroupInfoLatest), ()> = (|| {
            let versioned: GroupInfoVersioned =
                serde_json::from_slice(&row.versioned_payload).map_err(|_| ())?;
            let latest: GroupInfoLatest =
                serde_json::from_slice(&row.latest_payload).map_err(|_| ())?;
            versioned.expect(&row.group_id, row.key_version).map_err(|_| ())?;
            if latest.group_id != row.group_id || latest.latest_version != row.key_version {
                return Err(());
            }
            Ok((versioned, latest))
        })();
        let Ok((versioned, _latest)) = parsed else {
            warn!(group_id = %row.group_id, key_version = row.key_version,
                "dropping group info publish: invalid payload");
            self.db
                .remove_pending_group_info_publish(&row.group_id, row.key_version)?;
            return Ok(());
        };

        let outcome = self.put_records(&row).await;
        match outcome {
            Ok(()) => {
                self.db.update_group_key_state_hash(
                    &row.group_id,
                    row.key_version,
                    &versioned.state_hash,
                )?;
                if row.key_version > 1 {
                    self.db
                        .mark_group_key_used_until(&row.group_id, row.key_version - 1, now)?;
                }
                self.db
                    .remove_pending_group_info_publish(&row.group_id, row.key_version)?;
                info!(group_id = %row.group_id, key_version = row.key_version,
                    "group info records published");
            }
            Err(e) => {
                let next_retry_at = now + self.retry_delay(row.attempts + 1);
                self.db.mark_pending_group_info_publish_attempt(
                    &row.group_id,
                    row.key_version,
                    next_retry_at,
                    &e.to_string(),
                )?;
                debug!(group_id = %row.group_id, key_version = row.key_version,
                    attempt = row.attempts + 1, error = %e, "group info publish retry scheduled");
            }
        }
        Ok(())
    }

    async fn put_records(&self, row: &PendingGroupInfoPublish) -> Result<(), DhtError> {
        if self.dht.connected_peer_count().await == 0 {
            return Err(DhtError::NoConnectedPeers);
        }
        put_record(
            self.dht.as_ref(),
            row.versioned_dht_key.clone(),
            row.versioned_payload.clone(),
        )
        .await?;
        put_record(
            self.dht.as_ref(),
            row.latest_dht_key.clone(),
            row.latest_payload.clone(),
        )
        .await
    }

    fn retry_delay(&self, attempt: u32) -> i64 {
        let base = if attempt <= 1 {
            self.config.info_republish_base_delay_ms
        } else {
            self.config.info_republish_steady_delay_ms
        };
        base + rand::thread_rng().gen_range(0..=base / 5)
    }

    /// Start the periodic cycle. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = oneshot::channel::<()>();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let this = Arc::clone(self);
        let tick = std::time::Duration::from_millis(
            self.config.info_republish_base_delay_ms.max(100) as u64,
        );
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
                    warn!(error = %e, "group info cycle failed");
                }
            }
            debug!("group info publisher stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

/// Read side of the group-info records: members use it to answer "did
/// the creator move past my epoch?" and to walk snapshots backwards
/// after downtime.
pub struct GroupInfoReader {
    dht: Arc<dyn Dht>,
}

impl GroupInfoReader {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht }
    }

    /// Fetch and verify the `latest` pointer for `group_id`.
    pub async fn fetch_latest(
        &self,
        group_id: &str,
        creator: &ed25519_dalek::VerifyingKey,
    ) -> Result<Option<GroupInfoLatest>, InfoPublishError> {
        let Some(raw) = self.dht.get(group_info_latest_key(group_id)).await? else {
            return Ok(None);
        };
        let latest: GroupInfoLatest = serde_json::from_slice(&raw)?;
        latest.verify(creator)?;
        Ok(Some(latest))
    }

    /// Fetch and verify the snapshot at `version`.
    pub async fn fetch_version(
        &self,
        group_id: &str,
        version: u64,
        creator: &ed25519_dalek::VerifyingKey,
    ) -> Result<Option<GroupInfoVersioned>, InfoPublishError> {
        let Some(raw) = self.dht.get(group_info_versioned_key(group_id, version)).await? else {
            return Ok(None);
        };
        let record: GroupInfoVersioned = serde_json::from_slice(&raw)?;
        record.verify(creator)?;
        record.expect(group_id, version)?;
        Ok(Some(record))
    }

    /// Walk snapshots from `from_version` down to `to_version`
    /// (inclusive), newest first, checking each `prevVersionHash` link.
    pub async fn walk_back(
        &self,
        group_id: &str,
        from_version: u64,
        to_version: u64,
        creator: &ed25519_dalek::VerifyingKey,
    ) -> Result<Vec<GroupInfoVersioned>, InfoPublishError> {
        let mut chain = Vec::new();
        let mut expected_hash: Option<String> = None;
        let mut version = from_version;
        while version >= to_version.max(1) {
            let Some(record) = self.fetch_version(group_id, version, creator).await? else {
                break;
            };
            if let Some(expected) = &expected_hash {
                if record.state_hash != *expected {
                    return Err(InfoPublishError::Schema(
                        kiyeovo_dht::DhtSchemaError::StateHash,
                    ));
                }
            }
            expected_hash = record.prev_version_hash.clone();
            chain.push(record);
            if version == 1 {
                break;
            }
            version -= 1;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChatStatus, GroupStatus};
    use crate::dht::MemoryDht;

    fn member(identity: &PeerIdentity) -> GroupMemberEntry {
        GroupMemberEntry {
            peer_id: identity.peer_id.clone(),
            username: identity.username.clone(),
            signing_pub_key: identity.signing_pub_key_b64(),
            offline_pub_key: "b2ZmbGluZQ==".into(),
        }
    }

    struct Fixture {
        db: Arc<Database>,
        dht: Arc<MemoryDht>,
        publisher: GroupInfoPublisher,
        creator: Arc<PeerIdentity>,
    }

    async fn fixture() -> Fixture {
        let creator = Arc::new(PeerIdentity::generate("peer-a", "alice"));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-x").await;
        let publisher = GroupInfoPublisher::new(
            Arc::clone(&db),
            Arc::clone(&dht) as Arc<dyn Dht>,
            Arc::clone(&creator),
            GroupConfig::default(),
        );
        Fixture {
            db,
            dht,
            publisher,
            creator,
        }
    }

    fn seed_group(fx: &Fixture, key_version: u64) {
        fx.db
            .create_group_chat(
                "g1",
                "climbing",
                &fx.creator.peer_id,
                ChatStatus::Active,
                GroupStatus::Active,
                key_version,
                &fx.creator.peer_id,
            )
            .unwrap();
        for v in 1..=key_version {
            fx.db
                .insert_group_key("g1", v, "a2V5a2V5a2V5", Utc::now().timestamp_millis())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn publish_writes_both_records() {
        let fx = fixture().await;
        seed_group(&fx, 1);

        fx.publisher
            .publish_epoch("g1", 1, vec![member(&fx.creator)])
            .await
            .unwrap();

        let versioned = fx
            .dht
            .raw_record(&group_info_versioned_key("g1", 1))
            .await
            .unwrap();
        let record: GroupInfoVersioned = serde_json::from_slice(&versioned).unwrap();
        assert!(record.verify(&fx.creator.verifying_key()).is_ok());

        let latest = fx.dht.raw_record(&group_info_latest_key("g1")).await.unwrap();
        let pointer: GroupInfoLatest = serde_json::from_slice(&latest).unwrap();
        assert_eq!(pointer.latest_version, 1);
        assert_eq!(pointer.latest_state_hash, record.state_hash);

        // Row consumed, state hash recorded.
        assert!(fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap()
            .is_empty());
        let key = fx.db.get_group_key_for_epoch("g1", 1).unwrap().unwrap();
        assert_eq!(key.state_hash.unwrap(), record.state_hash);
    }

    #[tokio::test]
    async fn failed_put_schedules_retry_then_succeeds() {
        let fx = fixture().await;
        seed_group(&fx, 2);
        fx.dht.set_accept_puts(false);

        fx.publisher
            .publish_epoch("g1", 2, vec![member(&fx.creator)])
            .await
            .unwrap();

        let rows = fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempts, 1);
        assert!(rows[0].next_retry_at > Utc::now().timestamp_millis() - 1_000);
        assert!(rows[0].last_error.is_some());

        // Second cycle with a healthy mesh finishes the job.
        fx.dht.set_accept_puts(true);
        let row = rows.into_iter().next().unwrap();
        fx.publisher
            .process_row(row, Utc::now().timestamp_millis())
            .await
            .unwrap();

        assert!(fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap()
            .is_empty());
        // v1 closed out when v2 landed.
        let v1 = fx.db.get_group_key_for_epoch("g1", 1).unwrap().unwrap();
        assert!(v1.used_until.is_some());
    }

    #[tokio::test]
    async fn reader_walks_version_chain() {
        let fx = fixture().await;
        seed_group(&fx, 3);
        for version in 1..=3 {
            fx.publisher
                .publish_epoch("g1", version, vec![member(&fx.creator)])
                .await
                .unwrap();
        }

        let reader = GroupInfoReader::new(Arc::clone(&fx.dht) as Arc<dyn Dht>);
        let latest = reader
            .fetch_latest("g1", &fx.creator.verifying_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.latest_version, 3);

        let chain = reader
            .walk_back("g1", 3, 1, &fx.creator.verifying_key())
            .await
            .unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].version, 3);
        assert_eq!(
            chain[0].prev_version_hash.as_deref(),
            Some(chain[1].state_hash.as_str())
        );
        assert!(chain[2].prev_version_hash.is_none());
    }

    #[tokio::test]
    async fn attempt_cap_prunes_row() {
        let fx = fixture().await;
        seed_group(&fx, 1);
        let config = GroupConfig::default();

        let row = PendingGroupInfoPublish {
            group_id: "g1".into(),
            key_version: 1,
            versioned_payload: b"{}".to_vec(),
            latest_payload: b"{}".to_vec(),
            versioned_dht_key: group_info_versioned_key("g1", 1),
            latest_dht_key: group_info_latest_key("g1"),
            attempts: config.info_republish_max_attempts,
            next_retry_at: 0,
            last_error: None,
        };
        fx.db.enqueue_group_info_publish(&row).unwrap();
        fx.publisher.run_cycle().await.unwrap();
        assert!(fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_group_prunes_row() {
        let fx = fixture().await;
        let row = PendingGroupInfoPublish {
            group_id: "nope".into(),
            key_version: 1,
            versioned_payload: b"{}".to_vec(),
            latest_payload: b"{}".to_vec(),
            versioned_dht_key: group_info_versioned_key("nope", 1),
            latest_dht_key: group_info_latest_key("nope"),
            attempts: 0,
            next_retry_at: 0,
            last_error: None,
        };
        fx.db.enqueue_group_info_publish(&row).unwrap();
        fx.publisher.run_cycle().await.unwrap();
        assert!(fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn corrupt_payload_prunes_row() {
        let fx = fixture().await;
        seed_group(&fx, 1);
        let row = PendingGroupInfoPublish {
            group_id: "g1".into(),
            key_version: 1,
            versioned_payload: b"not json".to_vec(),
            latest_payload: b"not json".to_vec(),
            versioned_dht_key: group_info_versioned_key("g1", 1),
            latest_dht_key: group_info_latest_key("g1"),
            attempts: 0,
            next_retry_at: 0,
            last_error: None,
        };
        fx.db.enqueue_group_info_publish(&row).unwrap();
        fx.publisher.run_cycle().await.unwrap();
        assert!(fx
            .db
            .get_due_pending_group_info_publishes(i64::MAX, 100)
            .unwrap()
            .is_empty());
    }
}
