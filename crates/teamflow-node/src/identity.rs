//! Bearer-token identity.
//!
//! The server never issues credentials. It only maps a presented token to a
//! user id that some outer system already vouched for.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Resolves a bearer token to a trusted user id.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<String>;
}

/// Hex-encoded SHA-256 of a token, as stored in the config file.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A fixed token table loaded from config. Only digests are held in memory.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    by_digest: HashMap<String, String>,
}

impl StaticTokens {
    /// Build from `(user_id, token_sha256)` pairs. Digests are matched
    /// case-insensitively.
    pub fn new<I, U, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, D)>,
        U: Into<String>,
        D: AsRef<str>,
    {
        let by_digest = entries
            .into_iter()
            .map(|(user, digest)| (digest.as_ref().to_ascii_lowercase(), user.into()))
            .collect();
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

impl IdentityProvider for StaticTokens {
    fn resolve(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.by_digest.get(&token_digest(token)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_tokens_only() {
        let tokens = StaticTokens::new([
            ("alice", token_digest("alice-secret")),
            ("bob", token_digest("bob-secret").to_uppercase()),
        ]);
        assert_eq!(tokens.resolve("alice-secret").as_deref(), Some("alice"));
        assert_eq!(tokens.resolve("bob-secret").as_deref(), Some("bob"));
        assert_eq!(tokens.resolve("mallory"), None);
        assert_eq!(tokens.resolve(""), None);
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let d = token_digest("x");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
