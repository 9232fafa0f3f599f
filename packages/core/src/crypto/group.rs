//! Prime-order group used by SMP (Ristretto255).
//!
//! Elements travel compressed (32 bytes), exponents as canonical scalars.
//! Everything received from the peer goes through [`decode_element`] or
//! [`decode_scalar`].

use crate::error::CryptoError;
use crate::protocol::messages::{WireElement, WireScalar};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::rngs::OsRng;
use sha2::Sha512;

pub type Element = RistrettoPoint;

/// The group generator g.
pub fn generator() -> Element {
    RISTRETTO_BASEPOINT_POINT
}

/// Decode a received element. The identity is refused.
pub fn decode_element(bytes: &WireElement) -> Result<Element, CryptoError> {
    let point = CompressedRistretto(*bytes)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidGroupElement("not a valid encoding".to_string()))?;
    if point.is_identity() {
        return Err(CryptoError::InvalidGroupElement("identity element".to_string()));
    }
    Ok(point)
}

pub fn encode_element(element: &Element) -> WireElement {
    element.compress().to_bytes()
}

/// Decode a received exponent; non-canonical encodings are refused.
pub fn decode_scalar(bytes: &WireScalar) -> Result<Scalar, CryptoError> {
    Option::from(Scalar::from_canonical_bytes(*bytes))
        .ok_or_else(|| CryptoError::InvalidGroupElement("non-canonical scalar".to_string()))
}

pub fn encode_scalar(scalar: &Scalar) -> WireScalar {
    scalar.to_bytes()
}

pub fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

/// Domain-separated hash of group elements into an exponent.
pub fn hash_to_scalar(label: u8, elements: &[&Element]) -> Scalar {
    let mut input = Vec::with_capacity(1 + elements.len() * 32);
    input.push(label);
    for element in elements {
        input.extend_from_slice(element.compress().as_bytes());
    }
    Scalar::hash_from_bytes::<Sha512>(&input)
}

/// Map arbitrary bytes (e.g. a user secret transcript) to an exponent.
pub fn hash_bytes_to_scalar(input: &[u8]) -> Scalar {
    Scalar::hash_from_bytes::<Sha512>(input)
}
