//! Enclave Ed25519 keypair.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

/// Keypair generated inside the enclave. The secret half never leaves this
/// struct: it is not serializable and `Debug` prints only the public key.
pub struct EnclaveKeypair {
    signing: SigningKey,
}

impl EnclaveKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Hex-encoded 32-byte verifying key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// Signs `message` and returns the 64-byte signature as hex.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for EnclaveKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveKeypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::verify_ed25519_hex;

    #[test]
    fn signatures_verify_and_debug_hides_secret() {
        let kp = EnclaveKeypair::generate();
        let sig = kp.sign_hex(b"msg");
        assert!(verify_ed25519_hex(&kp.public_key_hex(), &sig, b"msg").is_ok());
        assert!(verify_ed25519_hex(&kp.public_key_hex(), &sig, b"other").is_err());

        let dbg = format!("{kp:?}");
        assert!(dbg.contains(&kp.public_key_hex()));
        assert!(!dbg.contains("signing"));
    }
}
