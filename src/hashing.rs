//! SHA-256 helpers shared by storage, compliance and credentials.

use sha2::{Digest, Sha256};

/// Compute SHA256 hash of content, hex encoded.
pub fn compute_hash(content: &str) -> String {
    compute_hash_bytes(content.as_bytes())
}

pub fn compute_hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hash over several parts without separators.
pub fn compute_hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash("test content");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parts_equal_concatenation() {
        assert_eq!(compute_hash_parts(&["ab", "cd"]), compute_hash("abcd"));
    }
}
