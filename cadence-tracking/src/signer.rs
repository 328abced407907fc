//! Keyed-MAC signing for tracking URLs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::TrackingError;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters kept from the full HMAC. The margin is deliberately low:
/// these links gate engagement counters, not account access.
const MAC_HEX_LEN: usize = 16;

/// Signs and verifies tracking payloads with a shared key.
#[derive(Debug, Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl Signer {
    /// A signer over the configured tracking key.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// First 16 hex characters of `HMAC-SHA256(key, data)`.
    #[must_use]
    pub fn sign(&self, data: &str) -> String {
        // HMAC accepts keys of any length; this cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(data.as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut hex = hex::encode(digest);
        hex.truncate(MAC_HEX_LEN);
        hex
    }

    /// Verify `mac` against `data`, in constant time over the truncated
    /// form.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::SignatureMismatch`] when the MAC does not
    /// verify.
    pub fn verify(&self, data: &str, mac: &str) -> Result<(), TrackingError> {
        let expected = self.sign(data);
        let mut diff = u8::from(expected.len() != mac.len());
        for (a, b) in expected.bytes().zip(mac.bytes()) {
            diff |= a ^ b;
        }
        if diff == 0 {
            Ok(())
        } else {
            Err(TrackingError::SignatureMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_sixteen_hex_chars() {
        let signer = Signer::new("secret");
        let mac = signer.sign("org|campaign|rcpt|msg");
        assert_eq!(mac.len(), 16);
        assert!(mac.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn sign_verify_round_trip() {
        let signer = Signer::new("secret");
        let mac = signer.sign("payload");
        signer.verify("payload", &mac).unwrap();
    }

    #[test]
    fn tampered_data_fails_verification() {
        let signer = Signer::new("secret");
        let mac = signer.sign("payload");
        assert_eq!(
            signer.verify("payl0ad", &mac),
            Err(TrackingError::SignatureMismatch)
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let mac = Signer::new("secret-a").sign("payload");
        assert_eq!(
            Signer::new("secret-b").verify("payload", &mac),
            Err(TrackingError::SignatureMismatch)
        );
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = Signer::new("secret");
        assert_eq!(signer.sign("x"), signer.sign("x"));
        assert_ne!(signer.sign("x"), signer.sign("y"));
    }
}
