// Сериализация
//
// All binary framing goes through one bincode configuration so that MACs
// computed over a serialized frame are reproducible on the other side.

use crate::utils::error::{OtrError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Upper bound on a decoded binary body.
const MAX_BODY_LEN: u64 = 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_BODY_LEN)
        .reject_trailing_bytes()
}

pub fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    options()
        .serialize(data)
        .map_err(|e| OtrError::ParseError(format!("Serialization failed: {}", e)))
}

pub fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| OtrError::ParseError(format!("Deserialization failed: {}", e)))
}
