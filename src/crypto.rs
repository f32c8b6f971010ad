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


//! Crypto and codec primitives shared by the messaging core.
//!
//! Hashing is SHA-256, signing is Ed25519, content encryption is
//! XChaCha20-Poly1305 with a random 24-byte nonce per message. All
//! signature inputs go through the canonical JSON serializer in
//! `kiyeovo-dht`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of nonce bytes for XChaCha20-Poly1305.
pub const NONCE_LEN: usize = 24;

/// Number of key bytes for the group symmetric key.
pub const GROUP_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("schema error: {0}")]
    Schema(#[from] kiyeovo_dht::DhtSchemaError),
}

/// SHA-256 digest, Base64 (standard alphabet).
pub fn sha256_b64(bytes: &[u8]) -> String {
    BASE64.encode(Sha256::digest(bytes))
}

/// SHA-256 digest, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Base64 (standard) encode.
pub fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Base64 (standard) decode.
pub fn b64_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(text)
        .map_err(|e| CryptoError::InvalidKey(format!("base64: {e}")))
}

/// Base64URL (no padding) encode, used in DHT key paths.
pub fn b64url_encode(bytes: &[u8]) -> String {
    BASE64_URL.encode(bytes)
}

/// Decode a Base64 32-byte symmetric key.
pub fn decode_group_key(key_b64: &str) -> Result<[u8; GROUP_KEY_LEN], CryptoError> {
    let bytes = b64_decode(key_b64)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("group key is {} bytes", bytes.len())))
}

/// Decode a Base64 Ed25519 verifying key.
pub fn decode_verifying_key(key_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = b64_decode(key_b64)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("signing key is {} bytes", bytes.len())))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|_| CryptoError::InvalidKey("not a valid Ed25519 point".into()))
}

/// Fresh random XChaCha20 nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Fresh random 32-byte group key.
pub fn generate_group_key() -> [u8; GROUP_KEY_LEN] {
    let mut key = [0u8; GROUP_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// XChaCha20-Poly1305 encrypt with an explicit nonce.
pub fn encrypt(
    key: &[u8; GROUP_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

/// XChaCha20-Poly1305 decrypt.
pub fn decrypt(
    key: &[u8; GROUP_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Sign the canonical JSON of `payload`, returning a Base64 signature.
pub fn sign_canonical<T: Serialize>(key: &SigningKey, payload: &T) -> Result<String, CryptoError> {
    let msg = kiyeovo_dht::canonical_json(payload)?;
    Ok(BASE64.encode(key.sign(&msg).to_bytes()))
}

/// Verify a Base64 signature over the canonical JSON of `payload`.
pub fn verify_canonical<T: Serialize>(
    key: &VerifyingKey,
    payload: &T,
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| CryptoError::InvalidSignature)?;
    let msg = kiyeovo_dht::canonical_json(payload)?;
    key.verify(&msg, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}
