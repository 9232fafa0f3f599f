// Типы сообщений протокола
//
// Text-level classification lives in `Message`; everything carried inside a
// `?OTR:...` envelope is a serde type encoded through `utils::serialization`.

use crate::protocol::version::{Version, VersionSet};
use crate::utils::error::Result;
use crate::utils::serialization;
use serde::{Deserialize, Serialize};

/// Identifies one client instance of a logical account.
pub type InstanceTag = u32;

/// Tags below this value are reserved; 0 means "unknown / any".
pub const MIN_VALID_INSTANCE_TAG: InstanceTag = 0x100;

/// Data message flag: the receiver should not complain if it cannot decrypt.
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

/// Length of every DH public value, MAC, and serialized group element.
pub const KEY_LEN: usize = 32;

/// One line of transport text, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Not an OTR message at all.
    Plaintext(String),
    Query(VersionSet),
    Error(String),
    Encoded(EncodedMessage),
    Fragment(Fragment),
}

/// A binary protocol message after envelope validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub version: Version,
    pub sender_instance: InstanceTag,
    pub receiver_instance: InstanceTag,
    pub body: Body,
}

/// Message kind and payload; the serde variant index is the on-wire type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    DhCommit(DhCommit),
    DhKey(DhKey),
    RevealSignature(RevealSignature),
    Signature(SignatureMessage),
    Data(DataMessage),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::DhCommit(_) => "DH-Commit",
            Body::DhKey(_) => "DH-Key",
            Body::RevealSignature(_) => "Reveal-Signature",
            Body::Signature(_) => "Signature",
            Body::Data(_) => "Data",
        }
    }
}

/// Wire form of [`EncodedMessage`]; the version is still a raw number here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub protocol_version: u16,
    pub sender_instance: InstanceTag,
    pub receiver_instance: InstanceTag,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhCommit {
    /// g^x under the one-time commitment key r.
    pub encrypted_gx: Vec<u8>,
    /// SHA-256(g^x).
    pub hashed_gx: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhKey {
    pub gy: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealSignature {
    /// The commitment key r, revealed.
    pub revealed_key: [u8; KEY_LEN],
    pub encrypted_signature: Vec<u8>,
    pub mac: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMessage {
    pub encrypted_signature: Vec<u8>,
    pub mac: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub flags: u8,
    pub sender_keyid: u32,
    pub recipient_keyid: u32,
    /// Sender's next DH public value.
    pub next_dh: [u8; KEY_LEN],
    pub counter: u64,
    pub ciphertext: Vec<u8>,
    pub mac: [u8; KEY_LEN],
    /// Receiving MAC keys the sender no longer uses, disclosed for deniability.
    pub old_mac_keys: Vec<[u8; KEY_LEN]>,
}

/// Everything the data-message MAC covers.
#[derive(Serialize)]
struct AuthenticatedFrame<'a> {
    protocol_version: u16,
    sender_instance: InstanceTag,
    receiver_instance: InstanceTag,
    flags: u8,
    sender_keyid: u32,
    recipient_keyid: u32,
    next_dh: &'a [u8; KEY_LEN],
    counter: u64,
    ciphertext: &'a [u8],
}

impl DataMessage {
    /// Bytes authenticated by the MAC: the whole frame except the MAC and the
    /// disclosed keys.
    pub fn authenticated_bytes(
        &self,
        version: Version,
        sender_instance: InstanceTag,
        receiver_instance: InstanceTag,
    ) -> Result<Vec<u8>> {
        serialization::to_bytes(&AuthenticatedFrame {
            protocol_version: version.number(),
            sender_instance,
            receiver_instance,
            flags: self.flags,
            sender_keyid: self.sender_keyid,
            recipient_keyid: self.recipient_keyid,
            next_dh: &self.next_dh,
            counter: self.counter,
            ciphertext: &self.ciphertext,
        })
    }
}

/// One piece of a message too long for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// (sender, receiver); absent in the version 2 format.
    pub instance_tags: Option<(InstanceTag, InstanceTag)>,
    /// 1-based.
    pub index: u16,
    pub total: u16,
    pub piece: String,
}

/// Decrypted contents of a data message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataPayload {
    pub text: String,
    pub tlvs: Vec<Tlv>,
}

impl DataPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tlvs: Vec::new(),
        }
    }

    pub fn control(tlv: Tlv) -> Self {
        Self {
            text: String::new(),
            tlvs: vec![tlv],
        }
    }
}

/// Control records carried alongside (or instead of) message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tlv {
    /// Ignored on receipt; hides the payload length.
    Padding(Vec<u8>),
    /// The sender has ended its private conversation.
    Disconnected,
    Smp1(SmpMessage1),
    Smp1Q { question: String, message: SmpMessage1 },
    Smp2(SmpMessage2),
    Smp3(SmpMessage3),
    Smp4(SmpMessage4),
    SmpAbort,
}

// ============================================================================
// SMP wire structures: compressed group elements and canonical scalars
// ============================================================================

pub type WireElement = [u8; KEY_LEN];
pub type WireScalar = [u8; KEY_LEN];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpMessage1 {
    pub g2a: WireElement,
    pub c2: WireScalar,
    pub d2: WireScalar,
    pub g3a: WireElement,
    pub c3: WireScalar,
    pub d3: WireScalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpMessage2 {
    pub g2b: WireElement,
    pub c2: WireScalar,
    pub d2: WireScalar,
    pub g3b: WireElement,
    pub c3: WireScalar,
    pub d3: WireScalar,
    pub pb: WireElement,
    pub qb: WireElement,
    pub cp: WireScalar,
    pub d5: WireScalar,
    pub d6: WireScalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpMessage3 {
    pub pa: WireElement,
    pub qa: WireElement,
    pub cp: WireScalar,
    pub d5: WireScalar,
    pub d6: WireScalar,
    pub ra: WireElement,
    pub cr: WireScalar,
    pub d7: WireScalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpMessage4 {
    pub rb: WireElement,
    pub cr: WireScalar,
    pub d7: WireScalar,
}
