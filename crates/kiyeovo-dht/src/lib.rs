//! Kiyeovo DHT record schemas (offline buckets and group-info).
//! Canonical JSON, Ed25519 signatures, gzipped bucket payloads, strict
//! freshness and size limits.

pub mod canonical;
pub mod group_info;
pub mod offline;

pub use canonical::canonical_json;
pub use group_info::{
    GroupInfoLatest, GroupInfoVersioned, GroupMemberEntry, group_info_latest_key,
    group_info_versioned_key,
};
pub use offline::{
    OfflineBucketKey, OfflineMessage, OfflineMessageSignedPayload, StoreEnvelope,
    StoreLimits, StoreSignedPayload, select_store, validate_store, validate_store_update,
};

/// DHT key namespace for per-sender offline message buckets.
pub const OFFLINE_BUCKET_PREFIX: &str = "/kiyeovo-offline/";

/// DHT key namespace for group metadata records.
pub const GROUP_INFO_PREFIX: &str = "/kiyeovo-group-info/";

#[derive(Debug, thiserror::Error)]
pub enum DhtSchemaError {
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("gzip error: {0}")]
    Gzip(String),
    #[error("invalid record key: {0}")]
    Key(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("bucket key mismatch")]
    BucketKeyMismatch,
    #[error("message id list does not match enclosed messages: {0}")]
    MessageIds(String),
    #[error("store version does not match signed payload version")]
    VersionMismatch,
    #[error("store exceeds message cap: {0} messages (max {1})")]
    StoreOverflow(usize, usize),
    #[error("message {0} is older than the accepted TTL")]
    MessageTooOld(String),
    #[error("message {0} has expired")]
    MessageExpired(String),
    #[error("content hash mismatch for message {0}")]
    ContentHash(String),
    #[error("sender info hash mismatch for message {0}")]
    SenderInfoHash(String),
    #[error("invalid signature")]
    InvalidSig,
    #[error("stale record rejected")]
    Stale,
    #[error("group mismatch in record payload")]
    GroupMismatch,
    #[error("state hash mismatch")]
    StateHash,
}

pub(crate) fn sha256_b64(bytes: &[u8]) -> String {
    use base64::Engine;
    use sha2::{Digest, Sha256};
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(bytes))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
