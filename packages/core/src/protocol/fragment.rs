// Фрагментация длинных сообщений
//
// Outbound: an encoded message longer than the transport limit is cut into
// numbered pieces. Inbound: pieces are accepted strictly in order; anything
// out of sequence drops the partial message.

use crate::protocol::messages::{Fragment, InstanceTag, Message};
use crate::protocol::version::Version;
use crate::protocol::wire;
use crate::utils::error::{OtrError, Result};

/// Header plus trailing comma, with both numbers at their widest (5 digits).
const V3_OVERHEAD: usize = 5 + 8 + 1 + 8 + 1 + 5 + 1 + 5 + 1 + 1;
const V2_OVERHEAD: usize = 5 + 5 + 1 + 5 + 1 + 1;

/// Split `text` into transport lines no longer than `max_size`.
///
/// `max_size == 0` disables fragmentation.
pub fn fragment(
    text: &str,
    max_size: usize,
    max_fragments: u16,
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
) -> Result<Vec<String>> {
    use tracing::trace;

    if max_size == 0 || text.len() <= max_size {
        return Ok(vec![text.to_string()]);
    }

    let overhead = if version.has_instance_tags() {
        V3_OVERHEAD
    } else {
        V2_OVERHEAD
    };
    if max_size <= overhead {
        return Err(OtrError::InvalidState(format!(
            "fragment size {} leaves no room for payload",
            max_size
        )));
    }
    let piece_len = max_size - overhead;

    let pieces = split_at_byte_budget(text, piece_len);

    let total = u16::try_from(pieces.len())
        .ok()
        .filter(|total| *total <= max_fragments)
        .ok_or_else(|| {
            OtrError::InvalidState(format!("message needs {} fragments", pieces.len()))
        })?;

    trace!(target: "otr::fragment", total = total, piece_len = piece_len, "Fragmenting outgoing message");

    let instance_tags = version
        .has_instance_tags()
        .then_some((sender, receiver));

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            wire::serialize_fragment(&Fragment {
                instance_tags,
                index: i as u16 + 1,
                total,
                piece: piece.to_string(),
            })
        })
        .collect())
}

/// Cut `text` into pieces of at most `budget` bytes without splitting a
/// character. A single character wider than `budget` gets a piece of its own.
fn split_at_byte_budget(text: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        if i > start && i + ch.len_utf8() - start > budget {
            pieces.push(&text[start..i]);
            start = i;
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Collects the pieces of one fragmented message.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: String,
    index: u16,
    total: u16,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial message is buffered.
    pub fn is_pending(&self) -> bool {
        self.index > 0
    }

    /// Feed one fragment. Returns the complete message, re-classified, when
    /// the last piece arrives.
    pub fn push(&mut self, fragment: &Fragment, max_fragments: u16) -> Option<Result<Message>> {
        use tracing::{debug, trace};

        if fragment.total > max_fragments {
            debug!(target: "otr::fragment", total = fragment.total, "Fragment count over limit, dropping");
            self.reset();
            return None;
        }

        if fragment.index == 1 {
            self.buffer = fragment.piece.clone();
            self.index = 1;
            self.total = fragment.total;
        } else if self.is_pending()
            && fragment.total == self.total
            && fragment.index == self.index + 1
        {
            self.buffer.push_str(&fragment.piece);
            self.index = fragment.index;
        } else {
            debug!(
                target: "otr::fragment",
                expected = self.index + 1,
                got = fragment.index,
                "Out-of-sequence fragment, dropping partial message"
            );
            self.reset();
            return None;
        }

        trace!(target: "otr::fragment", index = self.index, total = self.total, "Fragment accepted");

        if self.index == self.total {
            let text = std::mem::take(&mut self.buffer);
            self.reset();
            return Some(wire::parse(&text));
        }
        None
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.index = 0;
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version::VersionSet;

    fn reassemble_all(lines: &[String]) -> Option<Result<Message>> {
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for line in lines {
            match wire::parse(line).unwrap() {
                Message::Fragment(f) => result = reassembler.push(&f, 1000),
                other => panic!("expected fragment, got {:?}", other),
            }
        }
        result
    }

    #[test]
    fn test_short_message_not_fragmented() {
        let lines = fragment("?OTRv3?", 100, 1000, Version::V3, 0x100, 0x200).unwrap();
        assert_eq!(lines, vec!["?OTRv3?".to_string()]);
    }

    #[test]
    fn test_fragment_and_reassemble_v3() {
        let text = format!("?OTR Error: {}", "x".repeat(200));
        let lines = fragment(&text, 60, 1000, Version::V3, 0x100, 0x200).unwrap();
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.len() <= 60));
        let message = reassemble_all(&lines).unwrap().unwrap();
        assert_eq!(message, Message::Error("x".repeat(200)));
    }

    #[test]
    fn test_multibyte_text_respects_byte_limit() {
        let text = format!("?OTR Error: {}", "жёлтый ".repeat(20));
        let lines = fragment(&text, 60, 1000, Version::V3, 0x100, 0x200).unwrap();
        assert!(lines.iter().all(|l| l.len() <= 60));
        assert_eq!(
            reassemble_all(&lines).unwrap().unwrap(),
            Message::Error("жёлтый ".repeat(20))
        );
    }

    #[test]
    fn test_fragment_and_reassemble_v2() {
        let long = "?OTR Error: ".to_string() + &"y".repeat(50);
        let lines = fragment(&long, 25, 1000, Version::V2, 0, 0).unwrap();
        assert!(lines.iter().all(|l| l.starts_with("?OTR,")));
        assert_eq!(
            reassemble_all(&lines).unwrap().unwrap(),
            Message::Error("y".repeat(50))
        );
    }

    #[test]
    fn test_out_of_order_fragment_drops_partial() {
        let text = format!("?OTR Error: {}", "z".repeat(100));
        let lines = fragment(&text, 50, 1000, Version::V3, 0x100, 0x200).unwrap();
        assert!(lines.len() >= 3);
        let mut reordered = lines.clone();
        reordered.swap(1, 2);
        assert!(reassemble_all(&reordered).is_none());
    }

    #[test]
    fn test_restart_on_first_fragment() {
        let text = format!("?OTR Error: {}", "q".repeat(100));
        let lines = fragment(&text, 50, 1000, Version::V3, 0x100, 0x200).unwrap();
        let mut replayed = vec![lines[0].clone()];
        replayed.extend(lines.iter().cloned());
        assert_eq!(
            reassemble_all(&replayed).unwrap().unwrap(),
            Message::Error("q".repeat(100))
        );
    }

    #[test]
    fn test_reassembled_text_reclassified() {
        let query = wire::serialize(&Message::Query(VersionSet::from_versions(&[Version::V3]))).unwrap();
        let mut reassembler = Reassembler::new();
        let piece = Fragment {
            instance_tags: None,
            index: 1,
            total: 1,
            piece: query,
        };
        let message = reassembler.push(&piece, 10).unwrap().unwrap();
        assert_eq!(
            message,
            Message::Query(VersionSet::from_versions(&[Version::V3]))
        );
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn test_too_small_limit_rejected() {
        let text = "a".repeat(100);
        assert!(fragment(&text, 10, 1000, Version::V3, 0x100, 0x200).is_err());
    }
}
