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


//! Periodic re-PUT of tracked DHT records.
//!
//! DHT records age out of remote stores; every record the node is
//! responsible for gets re-put on a jittered interval. The jitter is
//! per-instance so a fleet of nodes never re-puts in lockstep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{Dht, put_record};

#[derive(Debug, Clone)]
struct TrackedRecord {
    key: Vec<u8>,
    value: Vec<u8>,
    last_published: Option<i64>,
}

/// Keeps a set of records alive in the DHT.
pub struct DhtRepublisher {
    dht: Arc<dyn Dht>,
    interval: Duration,
    jitter: Duration,
    records: Mutex<HashMap<String, TrackedRecord>>,
    running: AtomicBool,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl DhtRepublisher {
    pub fn new(dht: Arc<dyn Dht>, interval: Duration, jitter: Duration) -> Self {
        Self {
            dht,
            interval,
            jitter,
            records: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    /// Add or replace a tracked record.
    pub fn track(&self, key_str: &str, key: Vec<u8>, value: Vec<u8>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(
            key_str.to_string(),
            TrackedRecord {
                key,
                value,
                last_published: None,
            },
        );
    }

    pub fn untrack(&self, key_str: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(key_str);
    }

    /// Replace the bytes of an already tracked record.
    pub fn update_bytes(&self, key_str: &str, value: Vec<u8>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(key_str) {
            record.value = value;
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_delay(&self) -> Duration {
        let base = self.interval.as_millis() as i64;
        let jitter = self.jitter.as_millis() as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis((base + offset).max(0) as u64)
    }

    /// Start the periodic loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = oneshot::channel::<()>();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = this.next_delay();
                tokio::select! {
                    _ = &mut rx => break,
                    _ = sleep(delay) => {}
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.republish_all().await;
            }
            debug!("dht republisher stopped");
        });
    }

    /// Stop the loop. An in-flight pass finishes naturally; tracked
    /// records are kept.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    /// Re-put every tracked record once, sequentially. Per-key failures
    /// are logged and skipped.
    pub async fn republish_all(&self) {
        let snapshot: Vec<(String, TrackedRecord)> = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        if snapshot.is_empty() {
            return;
        }
        debug!(count = snapshot.len(), "republishing tracked dht records");

        for (key_str, record) in snapshot {
            match put_record(self.dht.as_ref(), record.key.clone(), record.value.clone()).await {
                Ok(()) => {
                    let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(tracked) = records.get_mut(&key_str) {
                        tracked.last_published = Some(Utc::now().timestamp_millis());
                    }
                }
                Err(e) => {
                    warn!(%key_str, error = %e, "republish failed, continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::MemoryDht;

    fn republisher(dht: Arc<MemoryDht>) -> Arc<DhtRepublisher> {
        Arc::new(DhtRepublisher::new(
            dht,
            Duration::from_millis(20),
            Duration::from_millis(5),
        ))
    }

    #[tokio::test]
    async fn republish_all_puts_every_record() {
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-b").await;
        let rep = republisher(Arc::clone(&dht));

        rep.track("a", b"/r/a".to_vec(), b"1".to_vec());
        rep.track("b", b"/r/b".to_vec(), b"2".to_vec());
        rep.republish_all().await;

        assert_eq!(dht.raw_record(b"/r/a").await.unwrap(), b"1");
        assert_eq!(dht.raw_record(b"/r/b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn per_key_failure_does_not_abort_pass() {
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-b").await;
        dht.register_rules(crate::dht::RecordRules {
            prefix: "/reject/".into(),
            validate: Box::new(|_, _| Err("always rejected".into())),
            validate_update: None,
            select: None,
        })
        .await;
        let rep = republisher(Arc::clone(&dht));

        rep.track("bad", b"/reject/a".to_vec(), b"1".to_vec());
        rep.track("good", b"/r/b".to_vec(), b"2".to_vec());
        rep.republish_all().await;

        assert!(dht.raw_record(b"/reject/a").await.is_none());
        assert_eq!(dht.raw_record(b"/r/b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn stop_keeps_tracked_records() {
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-b").await;
        let rep = republisher(dht);

        rep.track("a", b"/r/a".to_vec(), b"1".to_vec());
        rep.start();
        rep.start(); // second start is a no-op
        rep.stop();

        assert_eq!(rep.tracked_count(), 1);
        rep.untrack("a");
        assert_eq!(rep.tracked_count(), 0);
    }

    #[tokio::test]
    async fn update_bytes_replaces_payload() {
        let dht = Arc::new(MemoryDht::new());
        dht.add_peer("peer-b").await;
        let rep = republisher(Arc::clone(&dht));

        rep.track("a", b"/r/a".to_vec(), b"old".to_vec());
        rep.update_bytes("a", b"new".to_vec());
        rep.republish_all().await;

        assert_eq!(dht.raw_record(b"/r/a").await.unwrap(), b"new");
    }
}
