use async_trait::async_trait;

/// Supplies the bearer token HTTP services should authenticate with.
///
/// The auth client implements this so storage and functions requests carry
/// the signed-in user's access token without depending on the auth crate.
/// Returning `None` makes callers fall back to the project API key.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Provider that always answers with the same token (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider(pub Option<String>);

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Resolve the `Authorization` bearer value: the provider's token if any,
/// otherwise the API key.
pub async fn bearer_token(provider: Option<&dyn AccessTokenProvider>, api_key: &str) -> String {
    match provider {
        Some(provider) => provider
            .access_token()
            .await
            .unwrap_or_else(|| api_key.to_string()),
        None => api_key.to_string(),
    }
}
