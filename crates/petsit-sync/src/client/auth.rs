//! Bearer token source for REST and push calls

use std::sync::RwLock;

use futures::future::BoxFuture;

use crate::error::ClientError;

/// Supplies the signed-in user's access token.
pub trait AuthProvider: Send + Sync {
    /// Current token, if signed in
    fn token(&self) -> Option<String>;

    /// Obtain a fresh token after the server answered 401.
    ///
    /// `Ok(None)` means no refresh is possible and the 401 stands.
    fn refresh(&self) -> BoxFuture<'_, Result<Option<String>, ClientError>>;
}

/// Fixed token set by the embedding app
#[derive(Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace the token, e.g. after sign-in
    pub fn set(&self, token: Option<String>) {
        if let Ok(mut current) = self.token.write() {
            *current = token.map(|token| token.trim().to_string()).filter(|token| !token.is_empty());
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = self.token().is_some();
        f.debug_struct("StaticToken")
            .field("token", &if present { "[REDACTED]" } else { "None" })
            .finish()
    }
}

impl AuthProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|token| token.clone())
    }

    fn refresh(&self) -> BoxFuture<'_, Result<Option<String>, ClientError>> {
        Box::pin(async { Ok(None) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_debug_redacts_token() {
        let token = StaticToken::new("secret-token");
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn set_trims_and_clears() {
        let token = StaticToken::anonymous();
        assert_eq!(token.token(), None);
        token.set(Some("  abc ".to_string()));
        assert_eq!(token.token().as_deref(), Some("abc"));
        token.set(Some("   ".to_string()));
        assert_eq!(token.token(), None);
    }

    #[tokio::test]
    async fn static_token_cannot_refresh() {
        assert_eq!(StaticToken::new("abc").refresh().await, Ok(None));
    }
}
