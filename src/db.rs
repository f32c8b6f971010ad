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


//! Local persistence for the group messaging core.
//!
//! One SQLite database holds the chat roster state, group key history,
//! per-sender sequence high-waters, pending control-message ACKs and
//! pending group-info publishes. Every writer goes through this module;
//! the connection mutex is the single serialization point.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("lock poisoned: {0}")]
    Lock(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

type DbResult<T> = Result<T, DbError>;

/// Lifecycle of a chat row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    Active,
    Pending,
    Inactive,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Inactive => "inactive",
        }
    }

    fn parse(text: &str) -> DbResult<Self> {
        match text {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "inactive" => Ok(Self::Inactive),
            other => Err(DbError::Corrupt(format!("chat status {other}"))),
        }
    }
}

/// Lifecycle of the local node's membership in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Active,
    PendingInvite,
    InviteExpired,
    Left,
    Removed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingInvite => "pending_invite",
            Self::InviteExpired => "invite_expired",
            Self::Left => "left",
            Self::Removed => "removed",
        }
    }

    fn parse(text: &str) -> DbResult<Self> {
        match text {
            "active" => Ok(Self::Active),
            "pending_invite" => Ok(Self::PendingInvite),
            "invite_expired" => Ok(Self::InviteExpired),
            "left" => Ok(Self::Left),
            "removed" => Ok(Self::Removed),
            other => Err(DbError::Corrupt(format!("group status {other}"))),
        }
    }

    /// True when pending control messages toward this chat are pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InviteExpired | Self::Left | Self::Removed)
    }
}

/// How a sent message reached the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSentStatus {
    Online,
    Offline,
}

impl MessageSentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    fn parse(text: &str) -> DbResult<Self> {
        match text {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(DbError::Corrupt(format!("sent status {other}"))),
        }
    }
}

/// A chat row. Group chats carry the group bookkeeping columns.
#[derive(Debug, Clone)]
pub struct Chat {
    pub chat_id: i64,
    pub group_id: String,
    pub name: String,
    pub created_by: String,
    pub status: ChatStatus,
    pub group_status: GroupStatus,
    pub key_version: u64,
    pub group_creator_peer_id: String,
}

/// A known peer with its signing key and offline (RSA) key.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub peer_id: String,
    pub username: String,
    /// Base64 Ed25519 verifying key.
    pub signing_pub_key: String,
    /// Base64 RSA key the pairwise path wraps epoch keys with.
    pub offline_pub_key: String,
}

/// One epoch of a group's symmetric key.
#[derive(Debug, Clone)]
pub struct GroupKeyRecord {
    pub group_id: String,
    pub key_version: u64,
    pub key_b64: String,
    pub activated_at: i64,
    pub used_until: Option<i64>,
    pub state_hash: Option<String>,
}

/// A control message awaiting an ACK from its target.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub group_id: String,
    pub target_peer_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub last_published_at: Option<i64>,
}

/// A group-info record pair awaiting a successful DHT publish.
#[derive(Debug, Clone)]
pub struct PendingGroupInfoPublish {
    pub group_id: String,
    pub key_version: u64,
    pub versioned_payload: Vec<u8>,
    pub latest_payload: Vec<u8>,
    pub versioned_dht_key: Vec<u8>,
    pub latest_dht_key: Vec<u8>,
    pub attempts: u32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
}

/// A stored chat message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub chat_id: i64,
    pub sender_peer_id: String,
    pub content: String,
    pub timestamp: i64,
    pub sent_status: MessageSentStatus,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chats (
    chat_id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    created_by TEXT NOT NULL,
    status TEXT NOT NULL,
    group_status TEXT NOT NULL,
    key_version INTEGER NOT NULL DEFAULT 0,
    group_creator_peer_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    chat_id INTEGER NOT NULL,
    peer_id TEXT NOT NULL,
    PRIMARY KEY (chat_id, peer_id)
);
CREATE TABLE IF NOT EXISTS users (
    peer_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    signing_pub_key TEXT NOT NULL,
    offline_pub_key TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS group_key_history (
    group_id TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    key_b64 TEXT NOT NULL,
    activated_at INTEGER NOT NULL,
    used_until INTEGER,
    state_hash TEXT,
    PRIMARY KEY (group_id, key_version)
);
CREATE TABLE IF NOT EXISTS member_seq (
    group_id TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    peer_id TEXT NOT NULL,
    highest_seq INTEGER NOT NULL,
    PRIMARY KEY (group_id, key_version, peer_id)
);
CREATE TABLE IF NOT EXISTS send_seq (
    group_id TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    next_seq INTEGER NOT NULL,
    PRIMARY KEY (group_id, key_version)
);
CREATE TABLE IF NOT EXISTS pending_acks (
    group_id TEXT NOT NULL,
    target_peer_id TEXT NOT NULL,
    message_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    last_published_at INTEGER,
    PRIMARY KEY (group_id, target_peer_id, message_type)
);
CREATE TABLE IF NOT EXISTS invite_delivery_acks (
    group_id TEXT NOT NULL,
    member_peer_id TEXT NOT NULL,
    invite_id TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    PRIMARY KEY (group_id, member_peer_id, invite_id)
);
CREATE TABLE IF NOT EXISTS pending_group_info_publishes (
    group_id TEXT NOT NULL,
    key_version INTEGER NOT NULL,
    versioned_payload BLOB NOT NULL,
    latest_payload BLOB NOT NULL,
    versioned_dht_key BLOB NOT NULL,
    latest_dht_key BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    last_error TEXT,
    PRIMARY KEY (group_id, key_version)
);
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    chat_id INTEGER NOT NULL,
    sender_peer_id TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_status TEXT NOT NULL
);
";

/// Handle over the local SQLite database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("conn", &"Mutex<Connection>")
            .finish()
    }
}

impl Database {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| DbError::Lock(e.to_string()))
    }

    // ---------------------------- chats ----------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_group_chat(
        &self,
        group_id: &str,
        name: &str,
        created_by: &str,
        status: ChatStatus,
        group_status: GroupStatus,
        key_version: u64,
        group_creator_peer_id: &str,
    ) -> DbResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO chats (group_id, name, created_by, status, group_status, key_version, group_creator_peer_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group_id,
                name,
                created_by,
                status.as_str(),
                group_status.as_str(),
                key_version as i64,
                group_creator_peer_id
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_chat_by_group_id(&self, group_id: &str) -> DbResult<Option<Chat>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT chat_id, group_id, name, created_by, status, group_status, key_version, group_creator_peer_id
                 FROM chats WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(chat_id, group_id, name, created_by, status, group_status, key_version, creator)| {
                Ok(Chat {
                    chat_id,
                    group_id,
                    name,
                    created_by,
                    status: ChatStatus::parse(&status)?,
                    group_status: GroupStatus::parse(&group_status)?,
                    key_version: key_version as u64,
                    group_creator_peer_id: creator,
                })
            },
        )
        .transpose()
    }

    /// All group chats, in creation order.
    pub fn group_chats(&self) -> DbResult<Vec<Chat>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT chat_id, group_id, name, created_by, status, group_status, key_version, group_creator_peer_id
             FROM chats ORDER BY chat_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (chat_id, group_id, name, created_by, status, group_status, key_version, creator) =
                row?;
            out.push(Chat {
                chat_id,
                group_id,
                name,
                created_by,
                status: ChatStatus::parse(&status)?,
                group_status: GroupStatus::parse(&group_status)?,
                key_version: key_version as u64,
                group_creator_peer_id: creator,
            });
        }
        Ok(out)
    }

    pub fn set_chat_status(&self, group_id: &str, status: ChatStatus) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE chats SET status = ?2 WHERE group_id = ?1",
            params![group_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_group_status(&self, group_id: &str, status: GroupStatus) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE chats SET group_status = ?2 WHERE group_id = ?1",
            params![group_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_key_version(&self, group_id: &str, key_version: u64) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE chats SET key_version = ?2 WHERE group_id = ?1",
            params![group_id, key_version as i64],
        )?;
        Ok(())
    }

    // ------------------------- participants -------------------------

    pub fn add_participant(&self, chat_id: i64, peer_id: &str) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO participants (chat_id, peer_id) VALUES (?1, ?2)",
            params![chat_id, peer_id],
        )?;
        Ok(())
    }

    pub fn remove_participant(&self, chat_id: i64, peer_id: &str) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM participants WHERE chat_id = ?1 AND peer_id = ?2",
            params![chat_id, peer_id],
        )?;
        Ok(())
    }

    pub fn is_participant(&self, chat_id: i64, peer_id: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM participants WHERE chat_id = ?1 AND peer_id = ?2",
                params![chat_id, peer_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn participants(&self, chat_id: i64) -> DbResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT peer_id FROM participants WHERE chat_id = ?1 ORDER BY peer_id")?;
        let rows = stmt.query_map(params![chat_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ----------------------------- users -----------------------------

    pub fn upsert_user(&self, user: &UserRecord) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (peer_id, username, signing_pub_key, offline_pub_key)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(peer_id) DO UPDATE SET username = excluded.username,
                 signing_pub_key = excluded.signing_pub_key,
                 offline_pub_key = excluded.offline_pub_key",
            params![
                user.peer_id,
                user.username,
                user.signing_pub_key,
                user.offline_pub_key
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, peer_id: &str) -> DbResult<Option<UserRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT peer_id, username, signing_pub_key, offline_pub_key
                 FROM users WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok(UserRecord {
                        peer_id: row.get(0)?,
                        username: row.get(1)?,
                        signing_pub_key: row.get(2)?,
                        offline_pub_key: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    // ------------------------- key history -------------------------

    pub fn insert_group_key(
        &self,
        group_id: &str,
        key_version: u64,
        key_b64: &str,
        activated_at: i64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO group_key_history (group_id, key_version, key_b64, activated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, key_version as i64, key_b64, activated_at],
        )?;
        Ok(())
    }

    pub fn get_group_key_for_epoch(
        &self,
        group_id: &str,
        key_version: u64,
    ) -> DbResult<Option<GroupKeyRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT group_id, key_version, key_b64, activated_at, used_until, state_hash
                 FROM group_key_history WHERE group_id = ?1 AND key_version = ?2",
                params![group_id, key_version as i64],
                |row| {
                    Ok(GroupKeyRecord {
                        group_id: row.get(0)?,
                        key_version: row.get::<_, i64>(1)? as u64,
                        key_b64: row.get(2)?,
                        activated_at: row.get(3)?,
                        used_until: row.get(4)?,
                        state_hash: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn update_group_key_state_hash(
        &self,
        group_id: &str,
        key_version: u64,
        state_hash: &str,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE group_key_history SET state_hash = ?3 WHERE group_id = ?1 AND key_version = ?2",
            params![group_id, key_version as i64, state_hash],
        )?;
        Ok(())
    }

    pub fn mark_group_key_used_until(
        &self,
        group_id: &str,
        key_version: u64,
        used_until: i64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE group_key_history SET used_until = ?3 WHERE group_id = ?1 AND key_version = ?2",
            params![group_id, key_version as i64, used_until],
        )?;
        Ok(())
    }

    // ------------------------- sequence state -------------------------

    /// Allocate the next outgoing sequence number for `(group, epoch)`.
    /// Sequences start at 1. Atomic under the connection mutex.
    pub fn get_next_seq_and_increment(&self, group_id: &str, key_version: u64) -> DbResult<u64> {
        let conn = self.lock()?;
        let current: Option<i64> = conn
            .query_row(
                "SELECT next_seq FROM send_seq WHERE group_id = ?1 AND key_version = ?2",
                params![group_id, key_version as i64],
                |row| row.get(0),
            )
            .optional()?;
        let seq = current.unwrap_or(1);
        conn.execute(
            "INSERT INTO send_seq (group_id, key_version, next_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, key_version) DO UPDATE SET next_seq = ?3",
            params![group_id, key_version as i64, seq + 1],
        )?;
        Ok(seq as u64)
    }

    pub fn get_member_seq(
        &self,
        group_id: &str,
        key_version: u64,
        peer_id: &str,
    ) -> DbResult<u64> {
        let conn = self.lock()?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT highest_seq FROM member_seq
                 WHERE group_id = ?1 AND key_version = ?2 AND peer_id = ?3",
                params![group_id, key_version as i64, peer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Record a newly observed sequence number, keeping the maximum.
    pub fn update_member_seq(
        &self,
        group_id: &str,
        key_version: u64,
        peer_id: &str,
        seq: u64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO member_seq (group_id, key_version, peer_id, highest_seq)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, key_version, peer_id)
             DO UPDATE SET highest_seq = MAX(highest_seq, excluded.highest_seq)",
            params![group_id, key_version as i64, peer_id, seq as i64],
        )?;
        Ok(())
    }

    // ------------------------- pending acks -------------------------

    /// Insert or overwrite the pending ACK for `(group, target, type)`.
    /// Re-inserting resets the payload and timing.
    pub fn upsert_pending_ack(
        &self,
        group_id: &str,
        target_peer_id: &str,
        message_type: &str,
        payload: &[u8],
        created_at: i64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_acks (group_id, target_peer_id, message_type, payload, created_at, last_published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)
             ON CONFLICT(group_id, target_peer_id, message_type)
             DO UPDATE SET payload = excluded.payload, created_at = excluded.created_at,
                 last_published_at = NULL",
            params![group_id, target_peer_id, message_type, payload, created_at],
        )?;
        Ok(())
    }

    pub fn get_all_pending_acks(&self) -> DbResult<Vec<PendingAck>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, target_peer_id, message_type, payload, created_at, last_published_at
             FROM pending_acks ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingAck {
                group_id: row.get(0)?,
                target_peer_id: row.get(1)?,
                message_type: row.get(2)?,
                payload: row.get(3)?,
                created_at: row.get(4)?,
                last_published_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_pending_ack_last_published(
        &self,
        group_id: &str,
        target_peer_id: &str,
        message_type: &str,
        published_at: i64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pending_acks SET last_published_at = ?4
             WHERE group_id = ?1 AND target_peer_id = ?2 AND message_type = ?3",
            params![group_id, target_peer_id, message_type, published_at],
        )?;
        Ok(())
    }

    pub fn remove_pending_ack(
        &self,
        group_id: &str,
        target_peer_id: &str,
        message_type: &str,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_acks
             WHERE group_id = ?1 AND target_peer_id = ?2 AND message_type = ?3",
            params![group_id, target_peer_id, message_type],
        )?;
        Ok(())
    }

    // --------------------- invite delivery acks ---------------------

    pub fn record_invite_delivery_ack(
        &self,
        group_id: &str,
        member_peer_id: &str,
        invite_id: &str,
        received_at: i64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO invite_delivery_acks (group_id, member_peer_id, invite_id, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, member_peer_id, invite_id, received_at],
        )?;
        Ok(())
    }

    pub fn is_invite_delivery_ack_received(
        &self,
        group_id: &str,
        member_peer_id: &str,
        invite_id: &str,
    ) -> DbResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM invite_delivery_acks
                 WHERE group_id = ?1 AND member_peer_id = ?2 AND invite_id = ?3",
                params![group_id, member_peer_id, invite_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn remove_invite_delivery_acks_for_member(
        &self,
        group_id: &str,
        member_peer_id: &str,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM invite_delivery_acks WHERE group_id = ?1 AND member_peer_id = ?2",
            params![group_id, member_peer_id],
        )?;
        Ok(())
    }

    // ------------------ pending group info publishes ------------------

    pub fn enqueue_group_info_publish(&self, row: &PendingGroupInfoPublish) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_group_info_publishes
                 (group_id, key_version, versioned_payload, latest_payload,
                  versioned_dht_key, latest_dht_key, attempts, next_retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(group_id, key_version) DO UPDATE SET
                 versioned_payload = excluded.versioned_payload,
                 latest_payload = excluded.latest_payload,
                 versioned_dht_key = excluded.versioned_dht_key,
                 latest_dht_key = excluded.latest_dht_key,
                 attempts = excluded.attempts,
                 next_retry_at = excluded.next_retry_at,
                 last_error = excluded.last_error",
            params![
                row.group_id,
                row.key_version as i64,
                row.versioned_payload,
                row.latest_payload,
                row.versioned_dht_key,
                row.latest_dht_key,
                row.attempts,
                row.next_retry_at,
                row.last_error
            ],
        )?;
        Ok(())
    }

    pub fn get_due_pending_group_info_publishes(
        &self,
        now: i64,
        limit: usize,
    ) -> DbResult<Vec<PendingGroupInfoPublish>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, key_version, versioned_payload, latest_payload,
                    versioned_dht_key, latest_dht_key, attempts, next_retry_at, last_error
             FROM pending_group_info_publishes
             WHERE next_retry_at <= ?1 ORDER BY next_retry_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit as i64], |row| {
            Ok(PendingGroupInfoPublish {
                group_id: row.get(0)?,
                key_version: row.get::<_, i64>(1)? as u64,
                versioned_payload: row.get(2)?,
                latest_payload: row.get(3)?,
                versioned_dht_key: row.get(4)?,
                latest_dht_key: row.get(5)?,
                attempts: row.get(6)?,
                next_retry_at: row.get(7)?,
                last_error: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_pending_group_info_publish_attempt(
        &self,
        group_id: &str,
        key_version: u64,
        next_retry_at: i64,
        last_error: &str,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pending_group_info_publishes
             SET attempts = attempts + 1, next_retry_at = ?3, last_error = ?4
             WHERE group_id = ?1 AND key_version = ?2",
            params![group_id, key_version as i64, next_retry_at, last_error],
        )?;
        Ok(())
    }

    pub fn remove_pending_group_info_publish(
        &self,
        group_id: &str,
        key_version: u64,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_group_info_publishes WHERE group_id = ?1 AND key_version = ?2",
            params![group_id, key_version as i64],
        )?;
        Ok(())
    }

    // --------------------------- messages ---------------------------

    /// Insert a message row. A duplicate `message_id` is a no-op; returns
    /// whether a new row was written.
    pub fn create_message(&self, message: &MessageRecord) -> DbResult<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
                 (message_id, chat_id, sender_peer_id, content, timestamp, sent_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.message_id,
                message.chat_id,
                message.sender_peer_id,
                message.content,
                message.timestamp,
                message.sent_status.as_str()
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn message_exists(&self, message_id: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM messages WHERE message_id = ?1",
                params![message_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn messages_for_chat(&self, chat_id: i64) -> DbResult<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, chat_id, sender_peer_id, content, timestamp, sent_status
             FROM messages WHERE chat_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (message_id, chat_id, sender_peer_id, content, timestamp, status) = row?;
            out.push(MessageRecord {
                message_id,
                chat_id,
                sender_peer_id,
                content,
                timestamp,
                sent_status: MessageSentStatus::parse(&status)?,
            });
        }
        Ok(out)
    }
}
