// События, которые движок сообщает хосту
//
// Events never carry key material: fingerprints and the session id are the
// only cryptographic values exposed, and both are meant to be shown to users.

use crate::crypto::smp::{SmpOutcome, SmpPhase};
use crate::protocol::messages::InstanceTag;
use crate::protocol::version::Version;

/// Lifecycle state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Plaintext,
    Encrypted,
    /// The peer ended the private conversation; we must end ours before sending.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An AKE completed; the conversation is (again) Encrypted.
    GoneSecure {
        instance: InstanceTag,
        version: Version,
        fingerprint: String,
        /// Hex session id, for out-of-band comparison.
        ssid: String,
        verified: bool,
    },
    /// The peer sent Disconnected.
    PeerEnded { instance: InstanceTag },
    /// Plaintext arrived while a private conversation was up.
    UnencryptedReceived,
    /// The peer started SMP; answer with `respond_smp`.
    SmpRequest {
        instance: InstanceTag,
        question: Option<String>,
    },
    SmpProgress {
        instance: InstanceTag,
        phase: SmpPhase,
    },
    SmpComplete {
        instance: InstanceTag,
        outcome: SmpOutcome,
    },
    /// `?OTR Error:` text from the peer.
    PeerError(String),
    NoCompatibleVersion,
    /// Handshake failure, surfaced to the user.
    AuthenticationFailed(String),
    /// A data message we could not read.
    Unreadable { instance: InstanceTag },
}
