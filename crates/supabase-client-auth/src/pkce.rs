//! PKCE (RFC 7636) verifier/challenge generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// A code verifier with its derived challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh verifier and its S256 challenge.
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Value for the `code_challenge_method` parameter.
    ///
    /// GoTrue expects lowercase; `plain` only when no hashing took place.
    pub fn method(&self) -> &'static str {
        if self.challenge == self.verifier {
            "plain"
        } else {
            "s256"
        }
    }
}

/// Generates a cryptographically random code verifier.
///
/// 64 random bytes, base64url without padding (86 characters).
#[must_use]
pub fn generate_code_verifier() -> String {
    let mut random_bytes = [0u8; 64];
    rand::rng().fill(&mut random_bytes[..]);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
