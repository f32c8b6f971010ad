//! Per-sender offline message buckets.
//!
//! A bucket lives at `/kiyeovo-offline/<scope>/<sender-pubkey-base64url>`
//! where `<scope>` is a pairwise shared secret or a group id. The value is
//! gzipped JSON of a store envelope signed by the sender whose public key
//! is embedded in the key itself, so any DHT node can gatekeep writes
//! without out-of-band state.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::{DhtSchemaError, OFFLINE_BUCKET_PREFIX, canonical_json, sha256_b64};

/// Validation limits supplied by the host node.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Hard cap on messages per bucket.
    pub max_messages: usize,
    /// Maximum accepted age of a message, in milliseconds.
    pub message_ttl_ms: i64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_messages: 100,
            message_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Parsed bucket key.
#[derive(Debug, Clone)]
pub struct OfflineBucketKey {
    /// Shared secret (pairwise) or group id (group buckets).
    pub scope: String,
    /// Sender signing key recovered from the last path segment.
    pub sender_key: VerifyingKey,
    /// The full key string as it appeared on the wire.
    pub raw: String,
}

impl OfflineBucketKey {
    /// Build the key string for a sender's bucket in `scope`.
    pub fn key_string(scope: &str, sender_key: &VerifyingKey) -> String {
        format!(
            "{}{}/{}",
            OFFLINE_BUCKET_PREFIX,
            scope,
            BASE64_URL.encode(sender_key.as_bytes())
        )
    }

    /// Decode and decompose a raw DHT key.
    pub fn parse(key: &[u8]) -> Result<Self, DhtSchemaError> {
        let raw = std::str::from_utf8(key)
            .map_err(|_| DhtSchemaError::Key("key is not valid UTF-8".into()))?
            .to_string();
        if !raw.starts_with(OFFLINE_BUCKET_PREFIX) {
            return Err(DhtSchemaError::Key(format!(
                "key does not start with {OFFLINE_BUCKET_PREFIX}"
            )));
        }
        // "/kiyeovo-offline/<scope>/<sender>" splits into 4 parts, the
        // first being the empty segment before the leading slash.
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() != 4 {
            return Err(DhtSchemaError::Key(format!(
                "expected 4 key segments, got {}",
                parts.len()
            )));
        }
        let sender_bytes = BASE64_URL
            .decode(parts[3])
            .map_err(|_| DhtSchemaError::Key("sender segment is not base64url".into()))?;
        let sender_arr: [u8; 32] = sender_bytes
            .as_slice()
            .try_into()
            .map_err(|_| DhtSchemaError::Key("sender key is not 32 bytes".into()))?;
        let sender_key = VerifyingKey::from_bytes(&sender_arr)
            .map_err(|_| DhtSchemaError::Key("sender key is not a valid Ed25519 point".into()))?;
        Ok(Self {
            scope: parts[2].to_string(),
            sender_key,
            raw,
        })
    }
}

/// The signed portion of a single offline message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineMessageSignedPayload {
    pub message_id: String,
    pub bucket_key: String,
    pub content_hash: String,
    pub sender_info_hash: String,
    /// Creation time, Unix milliseconds.
    pub timestamp: i64,
    /// Drop-dead time, Unix milliseconds.
    pub expires_at: i64,
}

/// One pending message inside a bucket.
///
/// `content` and `sender_info` are Base64 of ciphertext produced by the
/// messaging layer; the bucket format never sees plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub id: String,
    pub content: String,
    pub sender_info: String,
    pub signed_payload: OfflineMessageSignedPayload,
    pub signature: String,
}

impl OfflineMessage {
    /// Sign the message payload, filling in `signature`.
    pub fn seal(&mut self, key: &SigningKey) -> Result<(), DhtSchemaError> {
        let msg = canonical_json(&self.signed_payload)?;
        self.signature = BASE64.encode(key.sign(&msg).to_bytes());
        Ok(())
    }

    fn verify(&self, sender: &VerifyingKey) -> Result<(), DhtSchemaError> {
        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| DhtSchemaError::InvalidSig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| DhtSchemaError::InvalidSig)?;
        let msg = canonical_json(&self.signed_payload)?;
        sender
            .verify(&msg, &sig)
            .map_err(|_| DhtSchemaError::InvalidSig)
    }
}

/// The signed portion of the store envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSignedPayload {
    /// Ids of the enclosed messages, in order.
    pub message_ids: Vec<String>,
    pub version: u64,
    pub timestamp: i64,
    pub bucket_key: String,
    #[serde(rename = "highestSeq", skip_serializing_if = "Option::is_none")]
    pub highest_seq: Option<u64>,
}

/// The bucket value, stored gzipped in the DHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEnvelope {
    pub messages: Vec<OfflineMessage>,
    /// Unix milliseconds of the last mutation; tie-breaker between copies
    /// at the same version.
    pub last_updated: i64,
    pub version: u64,
    pub store_signature: String,
    pub store_signed_payload: StoreSignedPayload,
}

impl StoreEnvelope {
    /// Sign the envelope payload, filling in `store_signature`.
    pub fn seal(&mut self, key: &SigningKey) -> Result<(), DhtSchemaError> {
        let msg = canonical_json(&self.store_signed_payload)?;
        self.store_signature = BASE64.encode(key.sign(&msg).to_bytes());
        Ok(())
    }

    fn verify(&self, sender: &VerifyingKey) -> Result<(), DhtSchemaError> {
        let sig_bytes = BASE64
            .decode(&self.store_signature)
            .map_err(|_| DhtSchemaError::InvalidSig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| DhtSchemaError::InvalidSig)?;
        let msg = canonical_json(&self.store_signed_payload)?;
        sender
            .verify(&msg, &sig)
            .map_err(|_| DhtSchemaError::InvalidSig)
    }

    /// Gunzip and decode a raw DHT value.
    pub fn decode(value: &[u8]) -> Result<Self, DhtSchemaError> {
        let json = gunzip(value)?;
        decode_envelope_checked(&json)
    }

    /// Encode and gzip for storage.
    pub fn encode(&self) -> Result<Vec<u8>, DhtSchemaError> {
        gzip(&serde_json::to_vec(self)?)
    }
}

/// gzip-compress `bytes`.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, DhtSchemaError> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)
        .and_then(|_| enc.finish())
        .map_err(|e| DhtSchemaError::Gzip(e.to_string()))
}

/// gunzip-decompress `bytes`.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DhtSchemaError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| DhtSchemaError::Gzip(e.to_string()))?;
    Ok(out)
}

/// Decode an envelope, reporting which required field is absent rather
/// than a generic parse error.
fn decode_envelope_checked(json: &[u8]) -> Result<StoreEnvelope, DhtSchemaError> {
    let value: serde_json::Value = serde_json::from_slice(json)?;
    for field in [
        "messages",
        "last_updated",
        "version",
        "store_signature",
        "store_signed_payload",
    ] {
        if value.get(field).is_none() {
            return Err(DhtSchemaError::MissingField(match field {
                "messages" => "messages",
                "last_updated" => "last_updated",
                "version" => "version",
                "store_signature" => "store_signature",
                _ => "store_signed_payload",
            }));
        }
    }
    let payload = &value["store_signed_payload"];
    for field in ["message_ids", "version", "timestamp", "bucket_key"] {
        if payload.get(field).is_none() {
            return Err(DhtSchemaError::MissingField(match field {
                "message_ids" => "store_signed_payload.message_ids",
                "version" => "store_signed_payload.version",
                "timestamp" => "store_signed_payload.timestamp",
                _ => "store_signed_payload.bucket_key",
            }));
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Gatekeep an incoming PUT on an offline bucket key.
///
/// Runs the full invariant chain; the returned error names the violated
/// invariant. On success the decoded envelope is handed back so callers
/// do not decompress twice.
pub fn validate_store(
    key: &[u8],
    value: &[u8],
    now_ms: i64,
    limits: StoreLimits,
) -> Result<StoreEnvelope, DhtSchemaError> {
    let bucket = OfflineBucketKey::parse(key)?;
    let envelope = StoreEnvelope::decode(value)?;

    if envelope.store_signed_payload.bucket_key != bucket.raw {
        return Err(DhtSchemaError::BucketKeyMismatch);
    }
    let ids = &envelope.store_signed_payload.message_ids;
    if ids.len() != envelope.messages.len() {
        return Err(DhtSchemaError::MessageIds(format!(
            "{} ids for {} messages",
            ids.len(),
            envelope.messages.len()
        )));
    }
    for (i, (id, message)) in ids.iter().zip(envelope.messages.iter()).enumerate() {
        if *id != message.id {
            return Err(DhtSchemaError::MessageIds(format!(
                "index {i}: listed {id}, enclosed {}",
                message.id
            )));
        }
    }
    if envelope.version != envelope.store_signed_payload.version {
        return Err(DhtSchemaError::VersionMismatch);
    }
    envelope.verify(&bucket.sender_key)?;

    if envelope.messages.len() > limits.max_messages {
        return Err(DhtSchemaError::StoreOverflow(
            envelope.messages.len(),
            limits.max_messages,
        ));
    }

    for message in &envelope.messages {
        let payload = &message.signed_payload;
        if payload.bucket_key != bucket.raw {
            return Err(DhtSchemaError::BucketKeyMismatch);
        }
        let content = BASE64
            .decode(&message.content)
            .map_err(|_| DhtSchemaError::ContentHash(message.id.clone()))?;
        if sha256_b64(&content) != payload.content_hash {
            return Err(DhtSchemaError::ContentHash(message.id.clone()));
        }
        let sender_info = BASE64
            .decode(&message.sender_info)
            .map_err(|_| DhtSchemaError::SenderInfoHash(message.id.clone()))?;
        if sha256_b64(&sender_info) != payload.sender_info_hash {
            return Err(DhtSchemaError::SenderInfoHash(message.id.clone()));
        }
        message.verify(&bucket.sender_key)?;
        if now_ms - payload.timestamp > limits.message_ttl_ms {
            return Err(DhtSchemaError::MessageTooOld(message.id.clone()));
        }
        if payload.expires_at <= now_ms {
            return Err(DhtSchemaError::MessageExpired(message.id.clone()));
        }
    }

    Ok(envelope)
}

/// Decide whether an incoming record may replace an existing one.
///
/// An unreadable existing record never blocks the write; an unreadable
/// incoming record is rejected outright.
pub fn validate_store_update(
    _key: &[u8],
    existing: &[u8],
    incoming: &[u8],
) -> Result<(), DhtSchemaError> {
    let incoming = StoreEnvelope::decode(incoming)?;
    let existing = match StoreEnvelope::decode(existing) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    if incoming.version < existing.version {
        return Err(DhtSchemaError::Stale);
    }
    if incoming.version == existing.version && incoming.last_updated <= existing.last_updated {
        return Err(DhtSchemaError::Stale);
    }
    Ok(())
}

/// Pick the best of several candidate records for the same key.
///
/// Maximizes `(version, last_updated)` lexicographically. Malformed
/// candidates are skipped; if nothing decodes, index 0 is returned.
pub fn select_store(_key: &[u8], candidates: &[Vec<u8>]) -> usize {
    let mut best: Option<(usize, u64, i64)> = None;
    for (i, bytes) in candidates.iter().enumerate() {
        let Ok(envelope) = StoreEnvelope::decode(bytes) else {
            continue;
        };
        let candidate = (i, envelope.version, envelope.last_updated);
        best = match best {
            None => Some(candidate),
            Some((_, v, t)) if (envelope.version, envelope.last_updated) > (v, t) => {
                Some(candidate)
            }
            other => other,
        };
    }
    best.map(|(i, _, _)| i).unwrap_or(0)
}
