//! Defines the CryptoProvider trait for crypto-agility.
//!
//! The protocol layers (AKE, data transport) are generic over a provider and
//! never touch a concrete primitive directly.

use crate::error::CryptoError;
use core::fmt::Debug;
use zeroize::Zeroizing;

/// Length of DH public values, MAC tags, hashes and symmetric keys.
pub const KEY_LEN: usize = 32;

/// Raw DH public value as it travels on the wire.
pub type DhPublicKey = [u8; KEY_LEN];

/// Secret bytes that are wiped when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Trait that formalizes all cryptographic operations for a specific cipher suite.
pub trait CryptoProvider: Send + Sync + 'static {
    type DhPrivateKey: AsRef<[u8]> + Debug + Clone + 'static;
    type SignaturePrivateKey: AsRef<[u8]> + Debug + Clone + 'static;

    /// Generates a new DH key pair.
    fn generate_dh_keys() -> Result<(Self::DhPrivateKey, DhPublicKey), CryptoError>;

    /// Derives the DH public value from a private key.
    fn dh_public_from_private(private_key: &Self::DhPrivateKey) -> Result<DhPublicKey, CryptoError>;

    /// Rejects degenerate or out-of-range received public values.
    fn validate_dh_public(public_key: &DhPublicKey) -> Result<(), CryptoError>;

    /// Shared secret with a peer's public value. Validates the public value
    /// and refuses non-contributory results.
    fn dh(private_key: &Self::DhPrivateKey, their_public: &DhPublicKey) -> Result<SecretBytes, CryptoError>;

    /// Generates a new long-term signature key pair.
    fn generate_signature_keys() -> Result<(Self::SignaturePrivateKey, Vec<u8>), CryptoError>;

    /// Creates a Signature private key from raw bytes
    fn signature_private_key_from_bytes(bytes: Vec<u8>) -> Self::SignaturePrivateKey;

    /// Derives a Signature public key from a Signature private key.
    fn from_signature_private_to_public(private_key: &Self::SignaturePrivateKey) -> Result<Vec<u8>, CryptoError>;

    /// Signs a message with the given private key.
    fn sign(private_key: &Self::SignaturePrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies a signature with the given public key.
    fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;

    /// Counter-mode stream cipher; encryption and decryption are the same call.
    fn stream_xor(key: &[u8], counter: u64, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Computes a MAC tag.
    fn mac(key: &[u8], data: &[u8]) -> Result<[u8; KEY_LEN], CryptoError>;

    /// Constant-time MAC verification.
    fn mac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError>;

    /// Collision-resistant hash.
    fn hash(data: &[u8]) -> [u8; KEY_LEN];

    /// Derives key material from input key material using HKDF.
    fn hkdf_derive_key(
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError>;

    /// Cryptographically secure random bytes.
    fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError>;

    /// Returns the SuiteID associated with this CryptoProvider.
    fn suite_id() -> u16;
}
