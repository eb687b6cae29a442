use std::collections::BTreeMap;

use async_trait::async_trait;

/// Resolves a bearer token to the name it was issued to.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Option<String>;
}

/// A fixed `token -> name` table, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: BTreeMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn verify(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let mut tokens = BTreeMap::new();
        tokens.insert("s3cret".to_string(), "alice".to_string());
        let auth = StaticTokens::new(tokens);
        assert_eq!(auth.verify("s3cret").await.as_deref(), Some("alice"));
        assert_eq!(auth.verify("guess").await, None);
        assert_eq!(auth.verify("").await, None);
    }
}
