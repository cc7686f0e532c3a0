//! Data types for the embedding compute plane

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EmbedError;

/// Errors from content-hash parsing
#[derive(Error, Debug)]
pub enum HashError {
    /// Hex string is not exactly 64 characters
    #[error("content hash must be 64 hex chars, got {0}")]
    BadLength(usize),
    /// Hex string contains a non-hex character
    #[error("content hash is not valid hex: {0}")]
    BadHex(String),
}

/// A 32-byte content digest, the cache key for an embedding.
///
/// Produced by blake3 over the chunk content. Callers may supply the hash
/// themselves (as a 64-char hex string); otherwise the plane computes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash chunk content with blake3.
    pub fn compute(content: &str) -> Self {
        Self(*blake3::hash(content.as_bytes()).as_bytes())
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        if hex.len() != 64 {
            return Err(HashError::BadLength(hex.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte =
                u8::from_str_radix(pair, 16).map_err(|_| HashError::BadHex(pair.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Lowercase hex rendering (64 chars).
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A unit of source text submitted for embedding.
///
/// The compute plane reads only `chunk_id`, `content` and `content_hash`;
/// `file` and `metadata` pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Caller-assigned identifier, unique within one submit
    pub chunk_id: String,
    /// Source file path (passthrough)
    #[serde(default)]
    pub file: PathBuf,
    /// Full source text to embed
    pub content: String,
    /// Optional precomputed blake3 hex digest of `content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Opaque caller metadata (passthrough)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Chunk {
    /// Build a chunk with just id + content (tests, bench).
    pub fn new(chunk_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            file: PathBuf::new(),
            content: content.into(),
            content_hash: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Resolve the content hash: parse the supplied hex if present and
    /// well-formed, otherwise compute from content. A malformed supplied
    /// hash is ignored (recomputed) rather than failing the chunk.
    pub fn resolve_hash(&self) -> ContentHash {
        if let Some(hex) = &self.content_hash {
            match ContentHash::from_hex(hex) {
                Ok(h) => return h,
                Err(e) => {
                    tracing::debug!(chunk_id = %self.chunk_id, error = %e, "Ignoring malformed supplied content_hash");
                }
            }
        }
        ContentHash::compute(&self.content)
    }
}

/// A dense embedding vector.
///
/// Always exactly `dim` floats once produced; the plane never returns a
/// partial vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(data: Vec<f32>) -> Self {
        Self(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-chunk result of `embed`.
///
/// Exactly one of three shapes: an embedding, `degraded = true` (accepted
/// without a vector, resubmitted internally later), or a terminal `error`.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    /// The input chunk, passed through unchanged
    pub chunk: Chunk,
    /// Present iff embedding succeeded; exactly `dim` floats
    pub embedding: Option<Embedding>,
    /// Accepted without a vector due to resource pressure
    pub degraded: bool,
    /// Terminal failure for this chunk
    pub error: Option<EmbedError>,
    /// Epoch seconds when the embedding was produced
    pub indexed_at: Option<u64>,
}

impl EmbeddedChunk {
    pub fn embedded(chunk: Chunk, embedding: Embedding) -> Self {
        Self {
            chunk,
            embedding: Some(embedding),
            degraded: false,
            error: None,
            indexed_at: Some(epoch_secs()),
        }
    }

    pub fn degraded(chunk: Chunk) -> Self {
        Self {
            chunk,
            embedding: None,
            degraded: true,
            error: None,
            indexed_at: None,
        }
    }

    pub fn failed(chunk: Chunk, error: EmbedError) -> Self {
        Self {
            chunk,
            embedding: None,
            degraded: false,
            error: Some(error),
            indexed_at: None,
        }
    }
}

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_roundtrip() {
        let h = ContentHash::compute("fn main() {}");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn test_content_hash_rejects_bad_input() {
        assert!(matches!(
            ContentHash::from_hex("abc"),
            Err(HashError::BadLength(3))
        ));
        let bad = "zz".repeat(32);
        assert!(matches!(
            ContentHash::from_hex(&bad),
            Err(HashError::BadHex(_))
        ));
    }

    #[test]
    fn test_resolve_hash_prefers_supplied() {
        let other = ContentHash::compute("something else");
        let mut chunk = Chunk::new("c1", "fn main() {}");
        chunk.content_hash = Some(other.to_hex());
        assert_eq!(chunk.resolve_hash(), other);
    }

    #[test]
    fn test_resolve_hash_recomputes_on_malformed() {
        let mut chunk = Chunk::new("c1", "fn main() {}");
        chunk.content_hash = Some("not-hex".to_string());
        assert_eq!(chunk.resolve_hash(), ContentHash::compute("fn main() {}"));
    }

    #[test]
    fn test_same_content_same_hash() {
        let a = Chunk::new("a", "let x = 1;");
        let b = Chunk::new("b", "let x = 1;");
        assert_eq!(a.resolve_hash(), b.resolve_hash());
    }
}
