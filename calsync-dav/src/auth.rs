//! HTTP Basic authentication
//!
//! Providers verify a username/password pair; the dispatcher only deals
//! with the `Authorization` header and the resulting [`AuthResult`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Realm announced in `WWW-Authenticate` challenges
pub const REALM: &str = "CalDAV";

/// Authentication result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// Authentication successful with the username
    Success(String),
    /// Credentials rejected
    Failed,
    /// Provider could not decide (backend unavailable etc.)
    Error(String),
}

/// Authentication provider trait
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult;
}

/// A single configured credential pair
#[derive(Clone)]
pub struct StaticAuthProvider {
    username: String,
    password_digest: Vec<u8>,
}

impl StaticAuthProvider {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password_digest: Sha256::digest(password.as_bytes()).to_vec(),
        }
    }
}

impl std::fmt::Debug for StaticAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuthProvider")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult {
        if username.is_empty() || password.is_empty() {
            return AuthResult::Failed;
        }
        // constant-time over the digests
        let supplied = Sha256::digest(password.as_bytes());
        let password_ok = supplied
            .iter()
            .zip(self.password_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
        if username == self.username && password_ok {
            AuthResult::Success(username.to_string())
        } else {
            AuthResult::Failed
        }
    }
}

/// Decode an `Authorization: Basic …` header value into (username, password).
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Value for the `WWW-Authenticate` header of a 401 response.
pub fn challenge() -> String {
    format!("Basic realm=\"{}\"", REALM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_auth() {
        let header = format!("Basic {}", STANDARD.encode("alice:s3cr:et"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("alice".to_string(), "s3cr:et".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
        assert_eq!(
            parse_basic_auth(&format!("Basic {}", STANDARD.encode("no-colon"))),
            None
        );
    }

    #[test]
    fn test_challenge() {
        assert_eq!(challenge(), "Basic realm=\"CalDAV\"");
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticAuthProvider::new("alice", "secret");
        assert_eq!(
            provider.authenticate("alice", "secret").await,
            AuthResult::Success("alice".into())
        );
        assert_eq!(provider.authenticate("alice", "wrong").await, AuthResult::Failed);
        assert_eq!(provider.authenticate("bob", "secret").await, AuthResult::Failed);
        assert_eq!(provider.authenticate("alice", "").await, AuthResult::Failed);
    }

    #[test]
    fn test_debug_hides_password() {
        let provider = StaticAuthProvider::new("alice", "secret");
        let rendered = format!("{:?}", provider);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("secret"));
    }
}
