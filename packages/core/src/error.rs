use thiserror::Error;

/// Ошибки криптографических примитивов.
///
/// Never carries key material: messages describe which check failed, not the
/// values involved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Failed to generate keys: {0}")]
    KeyGenerationError(String),
    #[error("Signature verification failed: {0}")]
    SignatureVerificationError(String),
    #[error("Invalid DH public value: {0}")]
    InvalidPublicValue(String),
    #[error("Invalid group element: {0}")]
    InvalidGroupElement(String),
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        CryptoError::SignatureVerificationError(err.to_string())
    }
}
