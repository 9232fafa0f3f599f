// Валидация входящих данных

use crate::protocol::messages::{
    Body, EncodedMessage, Envelope, InstanceTag, MIN_VALID_INSTANCE_TAG,
};
use crate::protocol::version::Version;
use crate::utils::error::{OtrError, Result};

/// Check a tag is usable as a sender tag (never 0, never reserved).
pub fn validate_sender_tag(tag: InstanceTag) -> Result<()> {
    if tag < MIN_VALID_INSTANCE_TAG {
        return Err(OtrError::ParseError(format!(
            "sender instance tag {:#x} is reserved",
            tag
        )));
    }
    Ok(())
}

/// Receiver tags may be 0 ("whoever answers"); otherwise they must be valid.
pub fn validate_receiver_tag(tag: InstanceTag) -> Result<()> {
    if tag != 0 && tag < MIN_VALID_INSTANCE_TAG {
        return Err(OtrError::ParseError(format!(
            "receiver instance tag {:#x} is reserved",
            tag
        )));
    }
    Ok(())
}

/// Validate a decoded envelope and lift it to an [`EncodedMessage`].
pub(crate) fn validate_envelope(envelope: Envelope) -> Result<EncodedMessage> {
    let version = match Version::from_number(envelope.protocol_version) {
        Some(v @ (Version::V2 | Version::V3)) => v,
        _ => {
            return Err(OtrError::ParseError(format!(
                "unsupported protocol version {}",
                envelope.protocol_version
            )))
        }
    };

    if version.has_instance_tags() {
        validate_sender_tag(envelope.sender_instance)?;
        validate_receiver_tag(envelope.receiver_instance)?;
    } else if envelope.sender_instance != 0 || envelope.receiver_instance != 0 {
        return Err(OtrError::ParseError(
            "version 2 messages carry no instance tags".to_string(),
        ));
    }

    validate_body(&envelope.body)?;

    Ok(EncodedMessage {
        version,
        sender_instance: envelope.sender_instance,
        receiver_instance: envelope.receiver_instance,
        body: envelope.body,
    })
}

fn validate_body(body: &Body) -> Result<()> {
    match body {
        Body::DhCommit(commit) if commit.encrypted_gx.is_empty() => Err(OtrError::ParseError(
            "DH-Commit without encrypted g^x".to_string(),
        )),
        Body::RevealSignature(reveal) if reveal.encrypted_signature.is_empty() => Err(
            OtrError::ParseError("Reveal-Signature without signature".to_string()),
        ),
        Body::Signature(sig) if sig.encrypted_signature.is_empty() => Err(OtrError::ParseError(
            "Signature message without signature".to_string(),
        )),
        Body::Data(data) if data.sender_keyid == 0 || data.recipient_keyid == 0 => Err(
            OtrError::ParseError("data message key ids must be non-zero".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Fragment numbering: 1 <= index <= total.
pub fn validate_fragment_numbers(index: u16, total: u16) -> Result<()> {
    if index == 0 || total == 0 || index > total {
        return Err(OtrError::ParseError(format!(
            "fragment {} of {} out of range",
            index, total
        )));
    }
    Ok(())
}
