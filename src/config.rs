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


//! Tunables for the group messaging core.

use std::time::Duration;

/// Every numeric knob of the subsystem in one place. Constructors take a
/// `GroupConfig`, so deployments can tighten or relax any of these without
/// touching the call sites.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Cadence of the periodic re-PUT of tracked DHT records.
    pub dht_republish_interval: Duration,
    /// Uniform jitter applied to each republish tick, in either direction.
    pub dht_republish_jitter: Duration,
    /// Hard cap on messages held in one offline bucket.
    pub max_messages_per_store: usize,
    /// Maximum accepted age of an offline message, in milliseconds.
    pub message_ttl_ms: i64,
    /// Give up republishing a group-info record after this many attempts.
    pub info_republish_max_attempts: u32,
    /// Delay before the first group-info retry, in milliseconds.
    pub info_republish_base_delay_ms: i64,
    /// Delay between subsequent group-info retries, in milliseconds.
    pub info_republish_steady_delay_ms: i64,
    /// Drop-dead window for pending invites and invite responses, in
    /// milliseconds.
    pub invite_lifetime_ms: i64,
    /// Cadence of the pubsub topic reconciliation pass.
    pub topic_reconcile_interval: Duration,
    /// Cadence of the signed heartbeat published to each group topic.
    pub heartbeat_interval: Duration,
    /// Heartbeats older than this are rejected, in milliseconds.
    pub heartbeat_max_age_ms: i64,
    /// Content messages older than this are rejected, in milliseconds.
    pub message_max_age_ms: i64,
    /// Tolerated clock skew into the future, in milliseconds.
    pub message_max_future_skew_ms: i64,
    /// Wait before the single pubsub publish retry.
    pub publish_retry_delay: Duration,
    /// Error-message marker that flags a publish failure as retryable.
    pub retryable_publish_marker: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            dht_republish_interval: Duration::from_secs(20 * 60),
            dht_republish_jitter: Duration::from_secs(2 * 60),
            max_messages_per_store: 100,
            message_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            info_republish_max_attempts: 10,
            info_republish_base_delay_ms: 5_000,
            info_republish_steady_delay_ms: 60_000,
            invite_lifetime_ms: 7 * 24 * 60 * 60 * 1000,
            topic_reconcile_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_max_age_ms: 2 * 60 * 1000,
            message_max_age_ms: 10 * 60 * 1000,
            message_max_future_skew_ms: 60 * 1000,
            publish_retry_delay: Duration::from_secs(3),
            retryable_publish_marker: "NO_PEERS_IN_TOPIC".to_string(),
        }
    }
}

impl GroupConfig {
    /// Validation limits handed to the offline-bucket DHT validator.
    pub fn store_limits(&self) -> kiyeovo_dht::StoreLimits {
        kiyeovo_dht::StoreLimits {
            max_messages: self.max_messages_per_store,
            message_ttl_ms: self.message_ttl_ms,
        }
    }
}
