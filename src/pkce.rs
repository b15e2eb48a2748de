//! PKCE (Proof Key for Code Exchange) utilities for OAuth2
//!
//! Implements RFC 7636 verifier/challenge generation, plus the opaque
//! flow-state token that correlates a redirect back to the flow that
//! initiated it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of the code verifier (must be 43-128 characters)
const CODE_VERIFIER_LENGTH: usize = 64;

/// Length of the flow-state correlation token
const FLOW_STATE_LENGTH: usize = 32;

/// Characters allowed in code verifier (unreserved URI characters per RFC 7636)
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Generate a cryptographically random code verifier
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_VERIFIER_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..VERIFIER_CHARSET.len());
            VERIFIER_CHARSET[idx] as char
        })
        .collect()
}

/// Generate the S256 code challenge: BASE64URL(SHA256(verifier))
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random flow-state token for replay/cross-flow protection
pub fn generate_flow_state() -> String {
    let mut rng = rand::thread_rng();
    (0..FLOW_STATE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// PKCE pair containing both verifier and challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a new PKCE pair
    pub fn new() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self { verifier, challenge }
    }
}

impl Default for PkcePair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_verifier_length() {
        let verifier = generate_code_verifier();
        assert!(verifier.len() >= 43 && verifier.len() <= 128);
    }

    #[test]
    fn test_code_verifier_characters() {
        let verifier = generate_code_verifier();
        let charset = std::str::from_utf8(VERIFIER_CHARSET).unwrap();
        for c in verifier.chars() {
            assert!(charset.contains(c), "Invalid character in verifier: {}", c);
        }
    }

    #[test]
    fn test_code_challenge_format() {
        let challenge = generate_code_challenge(&generate_code_verifier());

        // SHA256 is 32 bytes; Base64URL without padding is 43 characters
        assert_eq!(challenge.len(), 43);
        for c in challenge.chars() {
            assert!(
                c.is_ascii_alphanumeric() || c == '-' || c == '_',
                "Invalid Base64URL character: {}",
                c
            );
        }
    }

    #[test]
    fn test_pkce_pair_is_consistent() {
        let pair = PkcePair::new();
        assert_eq!(pair.challenge, generate_code_challenge(&pair.verifier));
    }

    #[test]
    fn test_verifiers_are_unique() {
        assert_ne!(generate_code_verifier(), generate_code_verifier());
    }

    #[test]
    fn test_flow_state_format() {
        let state = generate_flow_state();
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(state, generate_flow_state());
    }
}
