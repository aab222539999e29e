use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Length of a fingerprint in hex characters (SHA3-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Content address of a submitted image: the lowercase hex SHA3-256 digest
/// of its exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint raw content. Pure and deterministic.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint previously rendered with [`Fingerprint::as_str`].
    pub fn parse(value: &str) -> Result<Self, FingerprintError> {
        if value.len() != FINGERPRINT_HEX_LEN {
            return Err(FingerprintError::Length(value.len()));
        }
        if !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(FingerprintError::NotHex);
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FingerprintError {
    #[error("fingerprint must be {FINGERPRINT_HEX_LEN} hex characters, got {0}")]
    Length(usize),

    #[error("fingerprint must be lowercase hex")]
    NotHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        let a = Fingerprint::compute(b"imgA");
        let b = Fingerprint::compute(b"imgA");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_HEX_LEN);
    }

    #[test]
    fn test_distinct_content_distinct_fingerprint() {
        assert_ne!(Fingerprint::compute(b"imgA"), Fingerprint::compute(b"imgB"));
        // A single flipped bit must change the address.
        assert_ne!(Fingerprint::compute(&[0u8]), Fingerprint::compute(&[1u8]));
    }

    #[test]
    fn test_known_digest() {
        // SHA3-256 of the empty string.
        assert_eq!(
            Fingerprint::compute(b"").as_str(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_parse_accepts_rendered_form() {
        let fp = Fingerprint::compute(b"imgA");
        assert_eq!(Fingerprint::parse(fp.as_str()), Ok(fp));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Fingerprint::parse("abc"), Err(FingerprintError::Length(3)));
        let upper = "A".repeat(FINGERPRINT_HEX_LEN);
        assert_eq!(Fingerprint::parse(&upper), Err(FingerprintError::NotHex));
    }

    #[test]
    fn test_serde_validates_on_decode() {
        let fp = Fingerprint::compute(b"imgA");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fp);
        assert!(serde_json::from_str::<Fingerprint>("\"not-a-hash\"").is_err());
    }
}
