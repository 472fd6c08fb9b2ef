//! Content digests for upload parts
//!
//! Digests are plain functions of their input, safe to compute from any number of tasks.

use base64::Engine;
use sha2::Digest;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ChecksumAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChecksumAlgorithm::Sha224 => "SHA224",
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha384 => "SHA384",
            ChecksumAlgorithm::Sha512 => "SHA512",
        };
        f.write_str(name)
    }
}

/// Base64 encoded digest of `bytes`, the format object stores expect in checksum headers.
pub fn digest(bytes: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    match algorithm {
        ChecksumAlgorithm::Sha224 => engine.encode(sha2::Sha224::digest(bytes)),
        ChecksumAlgorithm::Sha256 => engine.encode(sha2::Sha256::digest(bytes)),
        ChecksumAlgorithm::Sha384 => engine.encode(sha2::Sha384::digest(bytes)),
        ChecksumAlgorithm::Sha512 => engine.encode(sha2::Sha512::digest(bytes)),
    }
}

/// Lowercase hex SHA-256, used as the ETag of locally stored parts.
pub fn etag(bytes: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sha256_digest() {
        assert_eq!(
            digest(b"", ChecksumAlgorithm::Sha256),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
        assert_eq!(
            etag(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn algorithms_differ() {
        let data = b"recording";
        let all = [
            ChecksumAlgorithm::Sha224,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha384,
            ChecksumAlgorithm::Sha512,
        ]
        .map(|algorithm| digest(data, algorithm));
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn concurrent_digests_agree() {
        let data = vec![7u8; 1 << 16];
        let expected = digest(&data, ChecksumAlgorithm::Sha256);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| assert_eq!(digest(&data, ChecksumAlgorithm::Sha256), expected));
            }
        });
    }
}
