//! Content digest parsing and verification.
//!
//! A digest on the wire is `<algorithm>:<lowercase-hex>`, e.g.
//! `sha256:08a9...`. The same parse/verify routine serves both
//! `Docker-Content-Digest` header checks and blob stream verification.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as Sha2Digest, Sha256, Sha512};

use crate::error::{RegistryError, Result};

/// Hash algorithms accepted in wire digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(RegistryError::BadDigest(format!(
                "unsupported digest algorithm: \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `algorithm:hex` digest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse a wire digest. The hex part must be non-empty lowercase hex;
    /// its length is not constrained here because reference strings may
    /// carry truncated digests.
    pub fn parse(value: &str) -> Result<Self> {
        let Some((algorithm, hex)) = value.split_once(':') else {
            return Err(RegistryError::BadDigest(format!(
                "could not parse digest: \"{value}\""
            )));
        };
        let algorithm = algorithm.parse()?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(RegistryError::BadDigest(format!(
                "digest is not lowercase hex: \"{value}\""
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Start a streaming hasher for this digest's algorithm.
    pub fn hasher(&self) -> DigestHasher {
        match self.algorithm {
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }

    /// Hash `data` and compare against this digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let mut hasher = self.hasher();
        hasher.update(data);
        let computed = hasher.finalize_hex();
        if computed != self.hex {
            return Err(RegistryError::BadDigest(format!(
                "expected {self}, computed {}:{computed}",
                self.algorithm
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

/// Incremental hasher keyed by a [`DigestAlgorithm`].
pub enum DigestHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            DigestHasher::Sha256(h) => h.update(data),
            DigestHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            DigestHasher::Sha256(h) => hex::encode(h.finalize()),
            DigestHasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash bytes to a full `sha256:<hex>` wire digest.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_digest() {
        let digest = Digest::parse(&format!("sha256:{HELLO_SHA256}")).unwrap();
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.hex(), HELLO_SHA256);
        assert_eq!(digest.to_string(), format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn test_parse_truncated_digest_is_allowed() {
        // Reference strings may pin abbreviated digests.
        let digest = Digest::parse("sha256:cafebabe").unwrap();
        assert_eq!(digest.hex(), "cafebabe");
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse("md5:abcdef").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("sha256:NOTHEX").is_err());
        assert!(Digest::parse(&format!("sha256:{}", HELLO_SHA256.to_uppercase())).is_err());
    }

    #[test]
    fn test_verify() {
        let digest = Digest::parse(&format!("sha256:{HELLO_SHA256}")).unwrap();
        assert!(digest.verify(b"hello world").is_ok());
        assert!(matches!(
            digest.verify(b"hello worlD"),
            Err(crate::error::RegistryError::BadDigest(_))
        ));
    }

    #[test]
    fn test_streaming_hasher_matches_one_shot() {
        let digest = Digest::parse(&format!("sha256:{HELLO_SHA256}")).unwrap();
        let mut hasher = digest.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(sha256_digest(b"hello world"), format!("sha256:{HELLO_SHA256}"));
    }
}
