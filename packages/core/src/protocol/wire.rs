// Текстовый формат сообщений
//
// Every OTR message travels as a line of text, possibly surrounded by ordinary
// conversation. Binary messages are wrapped as `?OTR:<base64>.`; long lines are
// cut into fragments.

use crate::protocol::messages::{EncodedMessage, Envelope, Fragment, InstanceTag, Message};
use crate::protocol::validation::{
    validate_envelope, validate_fragment_numbers, validate_receiver_tag, validate_sender_tag,
};
use crate::protocol::version::{self, DecodeMode, VersionSet};
use crate::utils::b64;
use crate::utils::error::{OtrError, Result};
use crate::utils::serialization;

pub const QUERY_PREFIX: &str = "?OTR";
pub const ERROR_PREFIX: &str = "?OTR Error:";
pub const ENCODED_PREFIX: &str = "?OTR:";
pub const FRAGMENT_V3_PREFIX: &str = "?OTR|";
pub const FRAGMENT_V2_PREFIX: &str = "?OTR,";

const ENCODED_SUFFIX: char = '.';

/// Classify a whole line of transport text.
///
/// Text that does not start with `?OTR` is [`Message::Plaintext`]. Anything
/// that does must be a well-formed message covering the entire line.
pub fn parse(text: &str) -> Result<Message> {
    if !text.starts_with(QUERY_PREFIX) {
        return Ok(Message::Plaintext(text.to_string()));
    }

    let (message, used) = parse_at(text, DecodeMode::Strict)?;
    if used != text.len() {
        return Err(OtrError::ParseError(format!(
            "{} unexpected trailing bytes",
            text.len() - used
        )));
    }
    Ok(message)
}

/// Find the earliest well-formed OTR message anywhere in `text`.
pub fn parse_embedded(text: &str) -> Option<Message> {
    scan_embedded(text, Some)
}

/// Parse a line that must be exactly one Query message.
pub fn parse_query(text: &str) -> Result<VersionSet> {
    match parse(text)? {
        Message::Query(versions) => Ok(versions),
        _ => Err(OtrError::ParseError("not a query message".to_string())),
    }
}

/// Versions announced by the earliest valid Query in `text`; empty if none.
pub fn parse_query_embedded(text: &str) -> VersionSet {
    scan_embedded(text, |message| match message {
        Message::Query(versions) => Some(versions),
        _ => None,
    })
    .unwrap_or_default()
}

/// Render a message as transport text.
pub fn serialize(message: &Message) -> Result<String> {
    match message {
        Message::Plaintext(text) => Ok(text.clone()),
        Message::Query(versions) => Ok(format!("{}{}", QUERY_PREFIX, version::encode(*versions))),
        Message::Error(text) => Ok(format!("{} {}", ERROR_PREFIX, text)),
        Message::Encoded(encoded) => serialize_encoded(encoded),
        Message::Fragment(fragment) => Ok(serialize_fragment(fragment)),
    }
}

pub fn serialize_encoded(message: &EncodedMessage) -> Result<String> {
    let envelope = Envelope {
        protocol_version: message.version.number(),
        sender_instance: message.sender_instance,
        receiver_instance: message.receiver_instance,
        body: message.body.clone(),
    };
    let bytes = serialization::to_bytes(&envelope)?;
    Ok(format!(
        "{}{}{}",
        ENCODED_PREFIX,
        b64::encode(&bytes),
        ENCODED_SUFFIX
    ))
}

pub fn serialize_fragment(fragment: &Fragment) -> String {
    match fragment.instance_tags {
        Some((sender, receiver)) => format!(
            "{}{:08x}|{:08x},{},{},{},",
            FRAGMENT_V3_PREFIX, sender, receiver, fragment.index, fragment.total, fragment.piece
        ),
        None => format!(
            "{}{},{},{},",
            FRAGMENT_V2_PREFIX, fragment.index, fragment.total, fragment.piece
        ),
    }
}

// ============================================================================
// Сканирование
// ============================================================================

/// Walk candidate `?OTR` positions left to right; the first candidate that
/// parses and is accepted by `accept` wins. Malformed candidates are skipped.
fn scan_embedded<T>(text: &str, mut accept: impl FnMut(Message) -> Option<T>) -> Option<T> {
    use tracing::trace;

    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find(QUERY_PREFIX) {
        let start = cursor + offset;
        match parse_at(&text[start..], DecodeMode::Embedded) {
            Ok((message, _)) => {
                if let Some(found) = accept(message) {
                    return Some(found);
                }
            }
            Err(err) => {
                trace!(target: "otr::wire", offset = start, error = %err, "Skipping malformed candidate");
            }
        }
        // '?' is one byte, so start + 1 is always a char boundary.
        cursor = start + 1;
    }
    None
}

/// Parse one message at the start of `text` (which begins with `?OTR`).
/// Returns the message and the number of bytes it spans.
fn parse_at(text: &str, mode: DecodeMode) -> Result<(Message, usize)> {
    if let Some(rest) = text.strip_prefix(ERROR_PREFIX) {
        let body = rest.strip_prefix(' ').unwrap_or(rest);
        return Ok((Message::Error(body.to_string()), text.len()));
    }

    if let Some(rest) = text.strip_prefix(ENCODED_PREFIX) {
        let end = rest.find(ENCODED_SUFFIX).ok_or_else(|| {
            OtrError::ParseError("encoded message is not '.' terminated".to_string())
        })?;
        let encoded = parse_encoded_body(&rest[..end])?;
        return Ok((
            Message::Encoded(encoded),
            ENCODED_PREFIX.len() + end + ENCODED_SUFFIX.len_utf8(),
        ));
    }

    if let Some(rest) = text.strip_prefix(FRAGMENT_V3_PREFIX) {
        let mut scanner = Scanner::new(rest);
        let sender = parse_hex_tag(scanner.take_until('|')?)?;
        let receiver = parse_hex_tag(scanner.take_until(',')?)?;
        validate_sender_tag(sender)?;
        validate_receiver_tag(receiver)?;
        let fragment = parse_fragment_tail(&mut scanner, Some((sender, receiver)))?;
        return Ok((
            Message::Fragment(fragment),
            FRAGMENT_V3_PREFIX.len() + scanner.pos,
        ));
    }

    if let Some(rest) = text.strip_prefix(FRAGMENT_V2_PREFIX) {
        let mut scanner = Scanner::new(rest);
        let fragment = parse_fragment_tail(&mut scanner, None)?;
        return Ok((
            Message::Fragment(fragment),
            FRAGMENT_V2_PREFIX.len() + scanner.pos,
        ));
    }

    let rest = &text[QUERY_PREFIX.len()..];
    let (versions, used) = version::decode(rest, mode)?;
    Ok((Message::Query(versions), QUERY_PREFIX.len() + used))
}

fn parse_encoded_body(body: &str) -> Result<EncodedMessage> {
    let bytes = b64::decode(body)?;
    let envelope: Envelope = serialization::from_bytes(&bytes)?;
    validate_envelope(envelope)
}

fn parse_fragment_tail(
    scanner: &mut Scanner<'_>,
    instance_tags: Option<(InstanceTag, InstanceTag)>,
) -> Result<Fragment> {
    let index = parse_decimal(scanner.take_until(',')?)?;
    let total = parse_decimal(scanner.take_until(',')?)?;
    validate_fragment_numbers(index, total)?;
    let piece = scanner.take_until(',')?;

    Ok(Fragment {
        instance_tags,
        index,
        total,
        piece: piece.to_string(),
    })
}

fn parse_hex_tag(field: &str) -> Result<InstanceTag> {
    if field.len() != 8 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(OtrError::ParseError(format!(
            "instance tag '{}' is not 8 hex digits",
            field
        )));
    }
    u32::from_str_radix(field, 16).map_err(|e| OtrError::ParseError(e.to_string()))
}

fn parse_decimal(field: &str) -> Result<u16> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OtrError::ParseError(format!(
            "'{}' is not a fragment number",
            field
        )));
    }
    field
        .parse()
        .map_err(|_| OtrError::ParseError(format!("fragment number {} out of range", field)))
}

/// Minimal delimiter-driven cursor over a fragment header.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Field up to `delim`; the delimiter itself is consumed.
    fn take_until(&mut self, delim: char) -> Result<&'a str> {
        let text: &'a str = self.text;
        let rest = &text[self.pos..];
        let len = rest
            .find(delim)
            .ok_or_else(|| OtrError::ParseError(format!("missing '{}' in fragment", delim)))?;
        self.pos += len + delim.len_utf8();
        Ok(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Body, DhKey};
    use crate::protocol::version::Version;
    use proptest::prelude::*;

    fn set(versions: &[Version]) -> VersionSet {
        VersionSet::from_versions(versions)
    }

    fn sample_encoded() -> EncodedMessage {
        EncodedMessage {
            version: Version::V3,
            sender_instance: 0x1234,
            receiver_instance: 0,
            body: Body::DhKey(DhKey { gy: [7u8; 32] }),
        }
    }

    #[test]
    fn test_parse_query_examples() {
        use Version::*;
        assert_eq!(parse_query("?OTR?").unwrap(), set(&[V1]));
        assert_eq!(parse_query("?OTRv23?").unwrap(), set(&[V2, V3]));
        assert_eq!(parse_query("?OTRv?").unwrap(), VersionSet::empty());
        assert_eq!(parse_query("?OTR?v23?").unwrap(), set(&[V1, V2, V3]));
    }

    #[test]
    fn test_parse_rejects_trailing_text() {
        assert!(matches!(parse("?OTR?v2?junk"), Err(OtrError::ParseError(_))));
    }

    #[test]
    fn test_parse_rejects_malformed_queries() {
        assert!(parse("?OTRv22?").is_err());
        assert!(parse("?OTRv23").is_err());
        assert!(parse("?OTR").is_err());
        assert!(parse("?OTRx").is_err());
        assert!(parse_query("junk").is_err());
    }

    #[test]
    fn test_plaintext_classification() {
        assert_eq!(
            parse("hello there").unwrap(),
            Message::Plaintext("hello there".to_string())
        );
    }

    #[test]
    fn test_parse_query_embedded_examples() {
        use Version::*;
        assert_eq!(parse_query_embedded("junk?OTRv23?junk"), set(&[V2, V3]));
        assert_eq!(parse_query_embedded("?OTRv33??OTR?v22?"), VersionSet::empty());
        assert_eq!(parse_query_embedded("no query here"), VersionSet::empty());
    }

    #[test]
    fn test_embedded_skips_malformed_leading_candidate() {
        use Version::*;
        assert_eq!(parse_query_embedded("?OTRv33? then ?OTRv3?"), set(&[V3]));
        assert_eq!(parse_query_embedded("?OTRx ?OTR?"), set(&[V1]));
    }

    #[test]
    fn test_embedded_prefers_earliest() {
        use Version::*;
        assert_eq!(parse_query_embedded("a ?OTRv2? b ?OTRv3?"), set(&[V2]));
    }

    #[test]
    fn test_embedded_unterminated_block_keeps_version_one() {
        assert_eq!(parse_query_embedded("?OTR?v23"), set(&[Version::V1]));
    }

    #[test]
    fn test_error_message() {
        let parsed = parse("?OTR Error: something broke").unwrap();
        assert_eq!(parsed, Message::Error("something broke".to_string()));
        assert_eq!(serialize(&parsed).unwrap(), "?OTR Error: something broke");
    }

    #[test]
    fn test_encoded_roundtrip() {
        let message = Message::Encoded(sample_encoded());
        let text = serialize(&message).unwrap();
        assert!(text.starts_with(ENCODED_PREFIX));
        assert!(text.ends_with('.'));
        assert_eq!(parse(&text).unwrap(), message);
    }

    #[test]
    fn test_encoded_rejects_truncated_body() {
        let text = serialize(&Message::Encoded(sample_encoded())).unwrap();
        let body = &text[ENCODED_PREFIX.len()..text.len() - 1];
        let truncated = format!("{}{}.", ENCODED_PREFIX, &body[..body.len() - 8]);
        assert!(parse(&truncated).is_err());
    }

    #[test]
    fn test_encoded_rejects_bad_instance_tag() {
        let mut encoded = sample_encoded();
        encoded.sender_instance = 0x10;
        let text = serialize(&Message::Encoded(encoded)).unwrap();
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_encoded_found_inside_text() {
        let text = serialize(&Message::Encoded(sample_encoded())).unwrap();
        let wrapped = format!("look: {} (sent)", text);
        assert_eq!(
            parse_embedded(&wrapped),
            Some(Message::Encoded(sample_encoded()))
        );
    }

    #[test]
    fn test_fragment_v3_roundtrip() {
        let fragment = Message::Fragment(Fragment {
            instance_tags: Some((0x100, 0x2ab)),
            index: 2,
            total: 3,
            piece: "QUJD".to_string(),
        });
        let text = serialize(&fragment).unwrap();
        assert_eq!(text, "?OTR|00000100|000002ab,2,3,QUJD,");
        assert_eq!(parse(&text).unwrap(), fragment);
    }

    #[test]
    fn test_fragment_v2_roundtrip() {
        let text = "?OTR,1,2,?OTR:AAE,";
        let parsed = parse(text).unwrap();
        assert_eq!(
            parsed,
            Message::Fragment(Fragment {
                instance_tags: None,
                index: 1,
                total: 2,
                piece: "?OTR:AAE".to_string(),
            })
        );
        assert_eq!(serialize(&parsed).unwrap(), text);
    }

    #[test]
    fn test_fragment_out_of_range() {
        assert!(parse("?OTR,0,2,abc,").is_err());
        assert!(parse("?OTR,3,2,abc,").is_err());
        assert!(parse("?OTR,1,70000,abc,").is_err());
        assert!(parse("?OTR|00000100|00000000,1,2,abc").is_err());
        assert!(parse("?OTR|00000001|00000000,1,2,abc,").is_err());
    }

    proptest! {
        #[test]
        fn prop_embedded_query_found_in_noise(
            bits in 1u8..8,
            prefix in "[a-z .!]{0,16}",
            suffix in "[a-z .!]{0,16}",
        ) {
            let versions = VersionSet::from_bits(bits);
            let text = format!("{}{}{}{}", prefix, QUERY_PREFIX, version::encode(versions), suffix);
            prop_assert_eq!(parse_query_embedded(&text), versions);
        }

        #[test]
        fn prop_query_serialize_parse(bits in 0u8..8) {
            let message = Message::Query(VersionSet::from_bits(bits));
            let text = serialize(&message).unwrap();
            prop_assert_eq!(parse(&text).unwrap(), message);
        }
    }
}
