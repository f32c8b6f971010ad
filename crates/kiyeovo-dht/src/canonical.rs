//! Deterministic JSON serialization for signature inputs.

use serde::Serialize;

use crate::DhtSchemaError;

/// Serialize `v` to the canonical byte sequence signatures are computed
/// over.
///
/// The value is round-tripped through `serde_json::Value`, whose object
/// representation is a `BTreeMap`, so object keys always come out in
/// lexicographic order regardless of struct field order or of how a peer's
/// decoder re-ordered them. Signers and verifiers must both go through this
/// function; raw `serde_json::to_vec` output is not a valid signature
/// input.
pub fn canonical_json<T: Serialize>(v: &T) -> Result<Vec<u8>, DhtSchemaError> {
    let value = serde_json::to_value(v)?;
    Ok(serde_json::to_vec(&value)?)
}
