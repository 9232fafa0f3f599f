// Типы ошибок протокола

use crate::error::CryptoError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtrError {
    /// Malformed syntax. Always recoverable by discarding the message.
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("No compatible protocol version")]
    NoCompatibleVersion,

    /// AKE check failed; the handshake has been reset.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Unknown key id (ours {recipient_keyid}, theirs {sender_keyid})")]
    UnknownKeyId { sender_keyid: u32, recipient_keyid: u32 },

    #[error("Replayed counter {counter} (last seen {last_seen})")]
    ReplayError { counter: u64, last_seen: u64 },

    #[error("Message integrity check failed")]
    IntegrityError,

    #[error("SMP verification failed: {0}")]
    SmpVerificationError(String),

    #[error("Cryptography error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conversation finished by peer; end it before sending")]
    ConversationFinished,

    #[error("Outgoing queue full ({0} messages pending)")]
    QueueFull(usize),
}

pub type Result<T> = std::result::Result<T, OtrError>;
