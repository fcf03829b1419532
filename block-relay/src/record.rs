use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type RecordId = i64;

/// One entry of the append-only log.
///
/// Only `hash` and `message` travel over the wire; the id is assigned by the
/// store and is known to peers only through the order of insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    #[serde(skip)]
    pub id: RecordId,
    pub hash: String,
    pub message: String,
}

impl Record {
    /// Returns true when `hash` still matches the digest of `message`.
    pub fn verify(&self) -> bool {
        self.hash == sha256_hex(&self.message)
    }

    /// Encodes the record as a single JSON line body (no terminator).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// First few hex characters of the hash, used when rendering for humans.
    pub fn short_hash(&self) -> &str {
        let end = self.hash.len().min(12);
        self.hash.get(..end).unwrap_or(&self.hash)
    }
}

/// Lowercase hex SHA-256 of the message's UTF-8 bytes.
pub fn sha256_hex(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}
