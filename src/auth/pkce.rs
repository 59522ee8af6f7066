use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const CHALLENGE_METHOD: &str = "S256";

/// 32 random bytes encode to a 43 character verifier
const VERIFIER_BYTES: usize = 32;

/// PKCE verifier and its S256 challenge for one authorization attempt
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut random = [0u8; VERIFIER_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut random);

        let verifier = URL_SAFE_NO_PAD.encode(random);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// base64url(SHA-256(verifier)) without padding
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
