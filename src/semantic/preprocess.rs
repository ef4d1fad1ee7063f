//! Text preparation for embedding generation.
//!
//! Composes note title and content into the text that gets embedded and
//! derives the content fingerprint used as the vector cache key.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Separator between note title and note content
const NOTE_TEXT_SEPARATOR: &str = "\n";

/// Compose the text embedded for a note.
///
/// No trimming or truncation: the fingerprint must reflect the exact text.
pub fn compose_note_text(title: &str, content: &str) -> String {
    let mut text = String::with_capacity(title.len() + NOTE_TEXT_SEPARATOR.len() + content.len());
    text.push_str(title);
    text.push_str(NOTE_TEXT_SEPARATOR);
    text.push_str(content);
    text
}

/// Deterministic digest of a text's exact bytes.
///
/// Used only for cache deduplication. Derived from SHA-256 so that keys
/// persisted by one process stay valid for the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint the given text.
    pub fn of(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(prefix))
    }

    /// Store key for this fingerprint.
    pub fn to_key(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Fingerprint)
    }
}
