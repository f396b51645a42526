//! Remote content digests (ETags) and the two upload encodings they come in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote object's content digest, classified by upload encoding.
///
/// Single-part uploads carry the MD5 of the whole body. Multi-part uploads
/// carry `md5(concat(part_md5s))-<part count>`, which cannot be rebuilt
/// without the original part boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum Digest {
    SinglePart { hex: String },
    MultiPart { hex: String, parts: u32 },
}

impl Digest {
    /// Classify a raw ETag by its encoding.
    ///
    /// Surrounding quotes are stripped. A trailing `-<n>` with a numeric part
    /// count marks a multi-part upload; object size plays no role.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches('"').to_ascii_lowercase();
        if let Some((hex, suffix)) = trimmed.rsplit_once('-') {
            if !hex.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit())
            {
                if let Ok(parts) = suffix.parse::<u32>() {
                    return Digest::MultiPart {
                        hex: hex.to_string(),
                        parts,
                    };
                }
            }
        }
        Digest::SinglePart { hex: trimmed }
    }

    /// Digest of a single-part body.
    pub fn of_bytes(body: &[u8]) -> Self {
        Digest::SinglePart {
            hex: format!("{:x}", md5::compute(body)),
        }
    }

    /// Digest of a body uploaded in `part_size` chunks.
    ///
    /// Bodies that fit in one part are single-part uploads.
    pub fn of_parts(body: &[u8], part_size: usize) -> Self {
        if part_size == 0 || body.len() <= part_size {
            return Self::of_bytes(body);
        }
        let mut outer = md5::Context::new();
        let mut parts = 0u32;
        for chunk in body.chunks(part_size) {
            outer.consume(md5::compute(chunk).0);
            parts += 1;
        }
        Digest::MultiPart {
            hex: format!("{:x}", outer.compute()),
            parts,
        }
    }

    pub fn part_count(&self) -> Option<u32> {
        match self {
            Digest::SinglePart { .. } => None,
            Digest::MultiPart { parts, .. } => Some(*parts),
        }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, Digest::MultiPart { .. })
    }
}

/// Renders the provider's wire form (without quotes), which is also the
/// form persisted in the state store.
impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Digest::SinglePart { hex } => f.write_str(hex),
            Digest::MultiPart { hex, parts } => write!(f, "{hex}-{parts}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_count_suffix_selects_multipart() {
        let digest = Digest::parse("\"9b2cf535f27731c974343645a3985328-12\"");
        assert_eq!(
            digest,
            Digest::MultiPart {
                hex: "9b2cf535f27731c974343645a3985328".into(),
                parts: 12
            }
        );
        assert_eq!(digest.to_string(), "9b2cf535f27731c974343645a3985328-12");
    }

    #[test]
    fn plain_md5_is_single_part() {
        let digest = Digest::parse("5d41402abc4b2a76b9719d911017c592");
        assert!(!digest.is_multipart());
        assert_eq!(digest, Digest::of_bytes(b"hello"));
    }

    #[test]
    fn non_numeric_suffix_is_not_a_part_count() {
        assert!(!Digest::parse("abc-def").is_multipart());
        assert!(!Digest::parse("abc-").is_multipart());
    }

    #[test]
    fn multipart_digest_hashes_part_digests() {
        let body = vec![7u8; 25];
        let digest = Digest::of_parts(&body, 10);
        assert_eq!(digest.part_count(), Some(3));

        let mut outer = md5::Context::new();
        outer.consume(md5::compute(&body[0..10]).0);
        outer.consume(md5::compute(&body[10..20]).0);
        outer.consume(md5::compute(&body[20..25]).0);
        assert_eq!(digest.to_string(), format!("{:x}-3", outer.compute()));
        assert_ne!(digest, Digest::of_bytes(&body));
    }
}
