//! Content digests and streaming verification.
//!
//! A [`Digest`] is an `(algorithm, encoded)` pair where `encoded` is the
//! lowercase hex hash of the referenced bytes. Every digest can produce a
//! [`Verifier`]: a running hash that, once a byte stream has been written
//! through it, reports whether the stream matches the digest.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;
use sha2::{Sha256, Sha512};

use crate::error::{ImageError, Result};

/// Digest algorithms the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// The algorithm used for all digests the engine computes itself.
    pub const CANONICAL: Algorithm = Algorithm::Sha256;

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding of a hash under this algorithm.
    pub fn encoded_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start a running hash under this algorithm.
    pub fn hasher(&self) -> Hasher {
        let inner = match self {
            Algorithm::Sha256 => HasherInner::Sha256(Sha256::new()),
            Algorithm::Sha512 => HasherInner::Sha512(Sha512::new()),
        };
        Hasher {
            algorithm: *self,
            inner,
        }
    }
}

impl FromStr for Algorithm {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(ImageError::SchemaViolation(format!(
                "unsupported digest algorithm {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running hash that yields a [`Digest`] when finalized.
pub struct Hasher {
    algorithm: Algorithm,
    inner: HasherInner,
}

enum HasherInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(bytes),
            HasherInner::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        let encoded = match self.inner {
            HasherInner::Sha256(h) => hex::encode(h.finalize()),
            HasherInner::Sha512(h) => hex::encode(h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            encoded,
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A content digest in the `algorithm:encoded` form used by the OCI specs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    /// Construct a digest from its parts, validating the hex encoding.
    pub fn from_encoded(algorithm: Algorithm, encoded: impl Into<String>) -> Result<Self> {
        let encoded = encoded.into();
        if encoded.len() != algorithm.encoded_len()
            || !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(ImageError::SchemaViolation(format!(
                "invalid {algorithm} digest encoding {encoded:?}"
            )));
        }
        Ok(Digest { algorithm, encoded })
    }

    /// Hash `bytes` under the canonical algorithm.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Algorithm::CANONICAL.hasher();
        hasher.update(bytes);
        hasher.finalize()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex portion, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Start verifying a byte stream against this digest.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            hasher: self.algorithm.hasher(),
            expected: self.encoded.clone(),
        }
    }
}

impl FromStr for Digest {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        let (alg, enc) = s.split_once(':').ok_or_else(|| {
            ImageError::SchemaViolation(format!("digest {s:?} is not in algorithm:encoded form"))
        })?;
        Digest::from_encoded(alg.parse()?, enc)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Streaming verifier for a single digest.
pub struct Verifier {
    hasher: Hasher,
    expected: String,
}

impl Verifier {
    /// True iff the bytes written so far hash to the expected digest.
    pub fn verified(self) -> bool {
        self.hasher.finalize().encoded == self.expected
    }
}

impl Write for Verifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-256 of "hello"
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_from_bytes_known_value() {
        let d = Digest::from_bytes(b"hello");
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.encoded(), HELLO_SHA256);
        assert_eq!(d.to_string(), format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn test_parse_round_trip() {
        let s = format!("sha256:{HELLO_SHA256}");
        let d: Digest = s.parse().unwrap();
        assert_eq!(d.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("sha256".parse::<Digest>().is_err());
        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
        // Uppercase hex is not canonical.
        let upper = format!("sha256:{}", HELLO_SHA256.to_uppercase());
        assert!(upper.parse::<Digest>().is_err());
        // Truncated encoding.
        assert!("sha256:2cf24d".parse::<Digest>().is_err());
    }

    #[test]
    fn test_sha512_encoded_len() {
        let mut hasher = Algorithm::Sha512.hasher();
        hasher.update(b"hello");
        let d = hasher.finalize();
        assert_eq!(d.encoded().len(), 128);
        assert_eq!(d.algorithm(), Algorithm::Sha512);
    }

    #[test]
    fn test_verifier_accepts_matching_stream() {
        let d = Digest::from_bytes(b"some blob content");
        let mut v = d.verifier();
        v.write_all(b"some blob").unwrap();
        v.write_all(b" content").unwrap();
        assert!(v.verified());
    }

    #[test]
    fn test_verifier_rejects_mismatch() {
        let d = Digest::from_bytes(b"some blob content");
        let mut v = d.verifier();
        v.write_all(b"tampered content").unwrap();
        assert!(!v.verified());
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::from_bytes(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"sha256:{HELLO_SHA256}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
