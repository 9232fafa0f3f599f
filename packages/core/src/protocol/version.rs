//! Protocol version sets and their Query-message encoding.
//!
//! A version set is a bitset over versions 1..=3. In a Query message version 1
//! is announced by a bare `?`, every later version by a digit inside a
//! `v...?` block, ascending and without separators.

use crate::utils::error::{OtrError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
    V1,
    V2,
    V3,
}

impl Version {
    pub const ALL: [Version; 3] = [Version::V1, Version::V2, Version::V3];

    fn bit(self) -> u8 {
        match self {
            Version::V1 => 0b001,
            Version::V2 => 0b010,
            Version::V3 => 0b100,
        }
    }

    /// Number carried in the binary header.
    pub fn number(self) -> u16 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
            Version::V3 => 3,
        }
    }

    pub fn from_number(number: u16) -> Option<Version> {
        match number {
            1 => Some(Version::V1),
            2 => Some(Version::V2),
            3 => Some(Version::V3),
            _ => None,
        }
    }

    /// Whether messages of this version carry instance tags.
    pub fn has_instance_tags(self) -> bool {
        self >= Version::V3
    }
}

/// Bitset of protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionSet(u8);

impl VersionSet {
    pub const fn empty() -> Self {
        VersionSet(0)
    }

    pub fn from_versions(versions: &[Version]) -> Self {
        let mut set = Self::empty();
        for v in versions {
            set.insert(*v);
        }
        set
    }

    pub fn from_bits(bits: u8) -> Self {
        VersionSet(bits & 0b111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, version: Version) {
        self.0 |= version.bit();
    }

    pub fn remove(&mut self, version: Version) {
        self.0 &= !version.bit();
    }

    pub fn contains(self, version: Version) -> bool {
        self.0 & version.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersection(self, other: VersionSet) -> VersionSet {
        VersionSet(self.0 & other.0)
    }

    pub fn highest(self) -> Option<Version> {
        Version::ALL.iter().rev().copied().find(|v| self.contains(*v))
    }

    /// Versions in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Version> {
        Version::ALL.into_iter().filter(move |v| self.contains(*v))
    }
}

/// How strictly a version fragment is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Whole-message parsing: every malformation is a [`OtrError::ParseError`].
    Strict,
    /// Scanning free text: an unterminated `v` block is simply not part of the match.
    Embedded,
}

/// Render the text that follows `?OTR` for `set`.
pub fn encode(set: VersionSet) -> String {
    let mut out = String::new();
    if set.contains(Version::V1) {
        out.push('?');
    }

    let digits: String = set
        .iter()
        .filter(|v| *v != Version::V1)
        .map(|v| char::from(b'0' + v.number() as u8))
        .collect();

    // {1} stands alone; anything else (including the empty set) gets a block.
    if !digits.is_empty() || !set.contains(Version::V1) {
        out.push('v');
        out.push_str(&digits);
        out.push('?');
    }
    out
}

/// Decode the version fragment that follows `?OTR`.
///
/// Returns the decoded set and the number of bytes of `fragment` consumed.
/// An `Err` means there is no valid version fragment at this position.
pub fn decode(fragment: &str, mode: DecodeMode) -> Result<(VersionSet, usize)> {
    let bytes = fragment.as_bytes();
    let mut set = VersionSet::empty();
    let mut pos = 0;

    if bytes.first() == Some(&b'?') {
        set.insert(Version::V1);
        pos = 1;
    }

    if bytes.get(pos) == Some(&b'v') {
        let block_start = pos + 1;
        match bytes[block_start..].iter().position(|b| *b == b'?') {
            Some(len) => {
                decode_digits(&bytes[block_start..block_start + len], &mut set)?;
                pos = block_start + len + 1;
            }
            None if mode == DecodeMode::Embedded && set.contains(Version::V1) => {
                return Ok((set, pos));
            }
            None => {
                return Err(OtrError::ParseError(
                    "version block is not '?' terminated".to_string(),
                ));
            }
        }
    } else if pos == 0 {
        return Err(OtrError::ParseError(
            "expected '?' or 'v' after ?OTR".to_string(),
        ));
    }

    Ok((set, pos))
}

fn decode_digits(block: &[u8], set: &mut VersionSet) -> Result<()> {
    let mut seen = [false; 10];
    for b in block {
        if !b.is_ascii_digit() {
            continue;
        }
        let digit = (b - b'0') as usize;
        if seen[digit] {
            return Err(OtrError::ParseError(format!(
                "version {} already listed",
                digit
            )));
        }
        seen[digit] = true;

        match digit {
            // Version 1 is only ever announced by the bare '?'.
            1 => {
                return Err(OtrError::ParseError(
                    "digit 1 is not valid inside a version block".to_string(),
                ))
            }
            2 => set.insert(Version::V2),
            3 => set.insert(Version::V3),
            _ => {}
        }
    }
    Ok(())
}

/// Highest version present in both sets.
pub fn merge(local: VersionSet, remote: VersionSet) -> Result<Version> {
    local
        .intersection(remote)
        .highest()
        .ok_or(OtrError::NoCompatibleVersion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(versions: &[Version]) -> VersionSet {
        VersionSet::from_versions(versions)
    }

    #[test]
    fn test_encode_examples() {
        use Version::*;
        assert_eq!(encode(set(&[V1])), "?");
        assert_eq!(encode(set(&[V2])), "v2?");
        assert_eq!(encode(set(&[V3])), "v3?");
        assert_eq!(encode(set(&[V1, V2])), "?v2?");
        assert_eq!(encode(set(&[V1, V3])), "?v3?");
        assert_eq!(encode(set(&[V2, V3])), "v23?");
        assert_eq!(encode(set(&[V1, V2, V3])), "?v23?");
    }

    #[test]
    fn test_decode_skips_unknown_characters() {
        let (decoded, used) = decode("v24x?", DecodeMode::Strict).unwrap();
        assert_eq!(decoded, set(&[Version::V2]));
        assert_eq!(used, 5);
    }

    #[test]
    fn test_decode_rejects_duplicates_and_placeholder() {
        assert!(decode("v232?", DecodeMode::Strict).is_err());
        assert!(decode("v33?", DecodeMode::Embedded).is_err());
        assert!(decode("v12?", DecodeMode::Strict).is_err());
    }

    #[test]
    fn test_unterminated_block() {
        assert!(decode("v23", DecodeMode::Strict).is_err());
        assert!(decode("v23", DecodeMode::Embedded).is_err());
        let (decoded, used) = decode("?v23xx", DecodeMode::Embedded).unwrap();
        assert_eq!(decoded, set(&[Version::V1]));
        assert_eq!(used, 1);
    }

    #[test]
    fn test_merge() {
        use Version::*;
        assert_eq!(merge(set(&[V2, V3]), set(&[V1, V2, V3])).unwrap(), V3);
        assert_eq!(merge(set(&[V2, V3]), set(&[V1, V2])).unwrap(), V2);
        assert_eq!(
            merge(set(&[V2, V3]), set(&[V1])),
            Err(OtrError::NoCompatibleVersion)
        );
    }

    proptest! {
        #[test]
        fn prop_encode_decode_roundtrip(bits in 1u8..8) {
            let original = VersionSet::from_bits(bits);
            let encoded = encode(original);
            let (decoded, used) = decode(&encoded, DecodeMode::Strict).unwrap();
            prop_assert_eq!(decoded, original);
            prop_assert_eq!(used, encoded.len());
        }
    }
}
