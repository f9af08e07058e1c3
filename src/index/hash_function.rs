use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Hashes a key to the 32-bit value that drives header and directory
/// indexing: the high bits pick a directory, the low bits pick a bucket.
pub trait HashFunction: Send + Sync {
    fn hash(&self, key: &[u8]) -> u32;
}

/// SipHash over the key bytes, truncated to 32 bits.
pub struct DefaultHashFunction;

impl HashFunction for DefaultHashFunction {
    fn hash(&self, key: &[u8]) -> u32 {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        hasher.finish() as u32
    }
}

/// Interprets the first four key bytes (little-endian) as the hash itself.
/// Gives tests exact control over directory and bucket placement.
pub struct IdentityHashFunction;

impl HashFunction for IdentityHashFunction {
    fn hash(&self, key: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        let len = key.len().min(4);
        bytes[..len].copy_from_slice(&key[..len]);
        u32::from_le_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hash_is_deterministic() {
        let hash_fn = DefaultHashFunction;
        assert_eq!(hash_fn.hash(b"hello"), hash_fn.hash(b"hello"));
        assert_ne!(hash_fn.hash(b"hello"), hash_fn.hash(b"world"));
    }

    #[test]
    fn test_identity_hash_uses_low_bytes() {
        let hash_fn = IdentityHashFunction;
        assert_eq!(hash_fn.hash(&0x1234_5678u32.to_le_bytes()), 0x1234_5678);
        assert_eq!(hash_fn.hash(&[0x01]), 0x0000_0001);
        assert_eq!(hash_fn.hash(&[]), 0);
    }
}
