//! Group metadata records.
//!
//! Two records per epoch: an immutable versioned snapshot at
//! `/kiyeovo-group-info/<group_id>/v<N>` and a mutable `latest` pointer at
//! `/kiyeovo-group-info/<group_id>/latest`. The snapshot is
//! content-addressed through its `stateHash`, and each snapshot links to
//! its predecessor through `prevVersionHash`, so members catching up after
//! downtime can walk the chain backwards. Both records carry a creator
//! signature over their canonical payload.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{DhtSchemaError, GROUP_INFO_PREFIX, canonical_json, sha256_hex};

/// DHT key for the mutable latest pointer of a group.
pub fn group_info_latest_key(group_id: &str) -> Vec<u8> {
    format!("{GROUP_INFO_PREFIX}{group_id}/latest").into_bytes()
}

/// DHT key for the immutable snapshot at `version`.
pub fn group_info_versioned_key(group_id: &str, version: u64) -> Vec<u8> {
    format!("{GROUP_INFO_PREFIX}{group_id}/v{version}").into_bytes()
}

/// One roster entry in a versioned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberEntry {
    pub peer_id: String,
    pub username: String,
    /// Base64 Ed25519 signing key.
    pub signing_pub_key: String,
    /// Base64 RSA key the pairwise path wraps epoch keys with. Opaque to
    /// this crate.
    pub offline_pub_key: String,
}

/// Mutable pointer to the newest epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfoLatest {
    pub group_id: String,
    pub latest_version: u64,
    pub latest_state_hash: String,
    pub last_updated: i64,
    pub creator_signature: String,
}

impl GroupInfoLatest {
    fn sign_bytes(&self) -> Result<Vec<u8>, DhtSchemaError> {
        let mut tmp = self.clone();
        tmp.creator_signature.clear();
        canonical_json(&tmp)
    }

    pub fn seal(&mut self, creator: &SigningKey) -> Result<(), DhtSchemaError> {
        let msg = self.sign_bytes()?;
        self.creator_signature = BASE64.encode(creator.sign(&msg).to_bytes());
        Ok(())
    }

    pub fn verify(&self, creator: &VerifyingKey) -> Result<(), DhtSchemaError> {
        let sig_bytes = BASE64
            .decode(&self.creator_signature)
            .map_err(|_| DhtSchemaError::InvalidSig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| DhtSchemaError::InvalidSig)?;
        creator
            .verify(&self.sign_bytes()?, &sig)
            .map_err(|_| DhtSchemaError::InvalidSig)
    }
}

/// Immutable snapshot of the group at one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfoVersioned {
    pub group_id: String,
    pub version: u64,
    /// State hash of the previous snapshot; absent at version 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_version_hash: Option<String>,
    pub members: Vec<GroupMemberEntry>,
    /// peer id -> Base64 Ed25519 signing key, for quick lookups without
    /// scanning `members`.
    pub member_signing_pub_keys: BTreeMap<String, String>,
    pub activated_at: i64,
    /// peer id -> highest sequence number observed under the previous
    /// epoch. Receivers use these to seed replay windows after rotation.
    pub sender_seq_boundaries: BTreeMap<String, u64>,
    pub state_hash: String,
    pub creator_signature: String,
}

impl GroupInfoVersioned {
    /// Hash over the canonical record with `stateHash` and
    /// `creatorSignature` cleared. This is the content address other
    /// records refer to.
    pub fn compute_state_hash(&self) -> Result<String, DhtSchemaError> {
        let mut tmp = self.clone();
        tmp.state_hash.clear();
        tmp.creator_signature.clear();
        Ok(sha256_hex(&canonical_json(&tmp)?))
    }

    fn sign_bytes(&self) -> Result<Vec<u8>, DhtSchemaError> {
        let mut tmp = self.clone();
        tmp.creator_signature.clear();
        canonical_json(&tmp)
    }

    /// Fill in `state_hash` and `creator_signature`.
    pub fn seal(&mut self, creator: &SigningKey) -> Result<(), DhtSchemaError> {
        self.state_hash = self.compute_state_hash()?;
        let msg = self.sign_bytes()?;
        self.creator_signature = BASE64.encode(creator.sign(&msg).to_bytes());
        Ok(())
    }

    /// Check the creator signature and that `state_hash` matches the
    /// record content.
    pub fn verify(&self, creator: &VerifyingKey) -> Result<(), DhtSchemaError> {
        let sig_bytes = BASE64
            .decode(&self.creator_signature)
            .map_err(|_| DhtSchemaError::InvalidSig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| DhtSchemaError::InvalidSig)?;
        creator
            .verify(&self.sign_bytes()?, &sig)
            .map_err(|_| DhtSchemaError::InvalidSig)?;
        if self.compute_state_hash()? != self.state_hash {
            return Err(DhtSchemaError::StateHash);
        }
        Ok(())
    }

    /// Cross-check the record against the identity it was queued under.
    pub fn expect(&self, group_id: &str, version: u64) -> Result<(), DhtSchemaError> {
        if self.group_id != group_id || self.version != version {
            return Err(DhtSchemaError::GroupMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn creator() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn snapshot(group_id: &str, version: u64) -> GroupInfoVersioned {
        GroupInfoVersioned {
            group_id: group_id.to_string(),
            version,
            prev_version_hash: None,
            members: vec![GroupMemberEntry {
                peer_id: "peer-a".into(),
                username: "alice".into(),
                signing_pub_key: "c2lnbmluZw==".into(),
                offline_pub_key: "b2ZmbGluZQ==".into(),
            }],
            member_signing_pub_keys: BTreeMap::from([("peer-a".into(), "c2lnbmluZw==".into())]),
            activated_at: 1_700_000_000_000,
            sender_seq_boundaries: BTreeMap::new(),
            state_hash: String::new(),
            creator_signature: String::new(),
        }
    }

    #[test]
    fn versioned_seal_verify_roundtrip() {
        let key = creator();
        let mut rec = snapshot("g1", 1);
        rec.seal(&key).unwrap();
        assert!(rec.verify(&key.verifying_key()).is_ok());
        assert!(!rec.state_hash.is_empty());
    }

    #[test]
    fn tampered_roster_fails_verification() {
        let key = creator();
        let mut rec = snapshot("g1", 2);
        rec.seal(&key).unwrap();
        rec.members[0].peer_id = "peer-b".into();
        assert!(rec.verify(&key.verifying_key()).is_err());
    }

    #[test]
    fn state_hash_changes_with_content() {
        let a = snapshot("g1", 1).compute_state_hash().unwrap();
        let b = snapshot("g1", 2).compute_state_hash().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn latest_pointer_roundtrip() {
        let key = creator();
        let mut latest = GroupInfoLatest {
            group_id: "g1".into(),
            latest_version: 3,
            latest_state_hash: "abc".into(),
            last_updated: 1_700_000_000_000,
            creator_signature: String::new(),
        };
        latest.seal(&key).unwrap();
        assert!(latest.verify(&key.verifying_key()).is_ok());

        latest.latest_version = 4;
        assert!(latest.verify(&key.verifying_key()).is_err());
    }

    #[test]
    fn record_keys() {
        assert_eq!(
            group_info_latest_key("g1"),
            b"/kiyeovo-group-info/g1/latest".to_vec()
        );
        assert_eq!(
            group_info_versioned_key("g1", 7),
            b"/kiyeovo-group-info/g1/v7".to_vec()
        );
    }

    #[test]
    fn expect_flags_requeued_mismatch() {
        let rec = snapshot("g1", 1);
        assert!(rec.expect("g1", 1).is_ok());
        assert!(rec.expect("g1", 2).is_err());
        assert!(rec.expect("g2", 1).is_err());
    }
}
