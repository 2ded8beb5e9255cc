use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 fingerprint of a DTLS certificate's DER encoding, formatted as
/// colon-separated uppercase hex pairs (`a=fingerprint:sha-256 <value>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsFingerprint {
    pub algorithm: &'static str,
    pub value: String,
}

impl DtlsFingerprint {
    pub fn from_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let value = digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            algorithm: "sha-256",
            value,
        }
    }
}

impl fmt::Display for DtlsFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_is_uppercase_colon_separated() {
        let fp = DtlsFingerprint::from_der(b"hello world");
        assert_eq!(fp.algorithm, "sha-256");
        assert_eq!(fp.value.len(), 32 * 3 - 1);
        assert!(fp.value.chars().all(|c| c.is_ascii_hexdigit() || c == ':'));
        assert!(!fp.value.chars().any(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = DtlsFingerprint::from_der(b"same input");
        let b = DtlsFingerprint::from_der(b"same input");
        assert_eq!(a, b);
    }
}
