//! Шифрование data-сообщений
//!
//! Encrypt: next counter of the sending session, stream cipher under the
//! session key, MAC over the whole frame. Decrypt: find the session by key
//! ids, verify the MAC, check the counter, then decrypt. Key slots change only
//! once every check has passed.

use crate::crypto::messaging::session_keys::SessionKeyManager;
use crate::crypto::provider::CryptoProvider;
use crate::protocol::messages::{DataMessage, DataPayload, InstanceTag};
use crate::protocol::version::Version;
use crate::utils::error::{OtrError, Result};
use crate::utils::serialization;
use std::marker::PhantomData;
use zeroize::Zeroizing;

/// Envelope fields the data MAC covers besides the message itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: Version,
    pub sender_instance: InstanceTag,
    pub receiver_instance: InstanceTag,
}

pub struct MessageTransport<P: CryptoProvider> {
    _phantom: PhantomData<P>,
}

impl<P: CryptoProvider> MessageTransport<P> {
    /// Encrypt `payload` under the current sending session.
    ///
    /// Pending MAC keys are attached when `reveal_mac_keys` is set and
    /// discarded otherwise.
    pub fn encrypt(
        keys: &mut SessionKeyManager<P>,
        payload: &DataPayload,
        flags: u8,
        header: FrameHeader,
        reveal_mac_keys: bool,
    ) -> Result<DataMessage> {
        use tracing::trace;

        let (sender_keyid, recipient_keyid) = keys.sending_key_ids()?;
        let next_dh = keys.next_dh()?;
        let plaintext = Zeroizing::new(serialization::to_bytes(payload)?);

        let session = keys.sending_session_mut()?;
        let counter = session.next_send_counter()?;
        let ciphertext = P::stream_xor(session.send_enc(), counter, &plaintext)?;
        let send_mac = *session.send_mac();

        let disclosed = keys.take_disclosures();
        let mut message = DataMessage {
            flags,
            sender_keyid,
            recipient_keyid,
            next_dh,
            counter,
            ciphertext,
            mac: [0u8; 32],
            old_mac_keys: if reveal_mac_keys { disclosed } else { Vec::new() },
        };
        let authenticated = message.authenticated_bytes(
            header.version,
            header.sender_instance,
            header.receiver_instance,
        )?;
        message.mac = P::mac(&send_mac, &authenticated)?;

        trace!(
            target: "otr::transport",
            sender_keyid = sender_keyid,
            recipient_keyid = recipient_keyid,
            counter = counter,
            ciphertext_len = message.ciphertext.len(),
            disclosed = message.old_mac_keys.len(),
            "Data message encrypted"
        );
        Ok(message)
    }

    /// Authenticate and decrypt `message`.
    ///
    /// `UnknownKeyId`, `IntegrityError` and `ReplayError` leave `keys`
    /// untouched.
    pub fn decrypt(
        keys: &mut SessionKeyManager<P>,
        message: &DataMessage,
        header: FrameHeader,
    ) -> Result<DataPayload> {
        use tracing::{debug, trace};

        let (our, their) = keys
            .locate(message.recipient_keyid, message.sender_keyid)
            .ok_or(OtrError::UnknownKeyId {
                sender_keyid: message.sender_keyid,
                recipient_keyid: message.recipient_keyid,
            })?;
        let session = keys
            .session(our, their)
            .ok_or_else(|| OtrError::InvalidState("located session vanished".to_string()))?;

        let authenticated = message.authenticated_bytes(
            header.version,
            header.sender_instance,
            header.receiver_instance,
        )?;
        if P::mac_verify(session.recv_mac(), &authenticated, &message.mac).is_err() {
            debug!(target: "otr::transport", counter = message.counter, "Data message MAC mismatch");
            return Err(OtrError::IntegrityError);
        }

        if message.counter <= session.recv_counter() {
            debug!(
                target: "otr::transport",
                counter = message.counter,
                last_seen = session.recv_counter(),
                "Replayed data message"
            );
            return Err(OtrError::ReplayError {
                counter: message.counter,
                last_seen: session.recv_counter(),
            });
        }

        let plaintext = Zeroizing::new(P::stream_xor(session.recv_enc(), message.counter, &message.ciphertext)?);
        let payload: DataPayload = serialization::from_bytes(&plaintext)?;

        keys.accept(our, their, message.counter, message.sender_keyid, &message.next_dh)?;

        trace!(
            target: "otr::transport",
            sender_keyid = message.sender_keyid,
            recipient_keyid = message.recipient_keyid,
            counter = message.counter,
            "Data message decrypted"
        );
        Ok(payload)
    }
}
