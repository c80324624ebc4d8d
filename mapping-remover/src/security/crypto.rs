// Cryptographic utilities for the sign-in flow

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// URL-safe random string from `bytes` bytes of entropy.
pub fn random_url_safe(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// PKCE code verifier (43 chars, RFC 7636 minimum length).
pub fn pkce_verifier() -> Result<String> {
    random_url_safe(32)
}

/// S256 code challenge for `verifier`.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Short, non-reversible tag for correlating a token in logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_rfc7636_example() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-1mB3fR7iBDhEHLIeoPB2fs2wVLsFzs"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifiers_are_unique_and_url_safe() {
        let a = pkce_verifier().expect("verifier");
        let b = pkce_verifier().expect("verifier");
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let f = token_fingerprint("eyJ0eXAi");
        assert_eq!(f.len(), 12);
        assert_eq!(f, token_fingerprint("eyJ0eXAi"));
    }
}
