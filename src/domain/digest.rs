//! Content digests: `<algorithm>:<hex>` tagged byte-string identifiers, and
//! a streaming verifier that can be fed chunks as they arrive off the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::OciError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed, validated `<algo>:<hexlower>` digest. Equality and hashing are
/// by the lowercase hex string, so two textually-equal digests always
/// compare equal regardless of where they were parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Splits the blob store's customary two-level fan-out prefix
    /// (`<first two hex chars>/<full hex>`), used by content-addressed
    /// filesystem layouts to keep any one directory from growing unbounded.
    pub fn shard_prefix(&self) -> &str {
        &self.hex[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| OciError::DigestInvalid(format!("malformed digest: {s}")))?;
        let algorithm = match algo {
            "sha256" => DigestAlgorithm::Sha256,
            other => {
                return Err(OciError::DigestInvalid(format!(
                    "unsupported digest algorithm: {other}"
                )));
            }
        };
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) || hex.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(OciError::DigestInvalid(format!(
                "invalid sha256 hex digest: {hex}"
            )));
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Streaming sha256 accumulator. Handlers feed it every byte written to the
/// blob store or read back out, then call `verify` against the digest the
/// client (or the stored metadata) claims those bytes hash to.
pub struct DigestVerifier {
    hasher: Sha256,
}

impl Default for DigestVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestVerifier {
    pub fn new() -> Self {
        DigestVerifier {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        let hex = hex::encode(self.hasher.finalize());
        Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex,
        }
    }

    /// Consumes the verifier, returning whether the accumulated hash
    /// matches `expected`.
    pub fn verify(self, expected: &Digest) -> bool {
        &self.finalize() == expected
    }
}

/// Computes the canonical digest of a complete in-memory buffer. Used for
/// manifest payloads, which are always small enough to be buffered whole
/// per the 4 MiB cap (§4.4).
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    let mut v = DigestVerifier::new();
    v.update(bytes);
    v.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_digest() {
        let d: Digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        assert_eq!(d.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(d.shard_prefix(), "e3");
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = "md5:abcd".parse::<Digest>();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!("sha256:abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn rejects_uppercase_hex() {
        let upper = "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        assert!(upper.parse::<Digest>().is_err());
    }

    #[test]
    fn verifier_matches_known_digest() {
        let mut v = DigestVerifier::new();
        v.update(b"hello world");
        let d = v.finalize();
        assert_eq!(
            d.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn digest_round_trips_through_display_and_parse() {
        let d = digest_bytes(b"abc");
        let s = d.to_string();
        let parsed: Digest = s.parse().unwrap();
        assert_eq!(d, parsed);
    }
}
