//! Sign-in and access-token supply for the Dataverse client.
//!
//! Token acquisition follows the `LoginPrompt=Auto` order: a cached unexpired access token,
//! then the cached refresh token, then an interactive browser sign-in.

pub mod claims;
pub mod oauth;
pub mod token_cache;

use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use oauth::OAuthClient;
use std::sync::Arc;
use token_cache::TokenCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub account: Option<String>,
}

impl TokenSet {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > now
    }
}

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, cancel: &CancellationToken) -> ServiceResult<String>;
}

/// Fixed bearer token (tests and pre-issued tokens).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self, _cancel: &CancellationToken) -> ServiceResult<String> {
        Ok(self.0.clone())
    }
}

/// Signed-in session for one environment; refreshes silently when the access token ages out.
pub struct AuthSession {
    client: OAuthClient,
    cache: Option<Arc<TokenCache>>,
    cache_key: String,
    tokens: Mutex<TokenSet>,
}

impl AuthSession {
    /// Acquire tokens for `client`'s environment. `on_url` is called with the sign-in URL
    /// only when an interactive sign-in is needed.
    pub async fn sign_in<F>(
        client: OAuthClient,
        cache: Option<Arc<TokenCache>>,
        on_url: F,
        cancel: &CancellationToken,
    ) -> ServiceResult<Self>
    where
        F: FnOnce(&str) + Send,
    {
        let cache_key = TokenCache::key(&client.config().app_id, &client.config().resource);

        let cached = match &cache {
            Some(c) => match c.load(&cache_key).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("[PHASE: auth] [STEP: token_cache] Ignoring unreadable cache: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let tokens = match cached {
            Some(t) if t.is_fresh(Utc::now()) => {
                info!("[PHASE: auth] [STEP: sign_in] Using cached access token");
                t
            }
            Some(TokenSet {
                refresh_token: Some(refresh),
                ..
            }) => match client.refresh(&refresh, cancel).await {
                Ok(t) => t,
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(e) => {
                    info!(
                        "[PHASE: auth] [STEP: sign_in] Refresh failed ({}); signing in interactively",
                        e
                    );
                    client.sign_in_interactive(on_url, cancel).await?
                }
            },
            _ => client.sign_in_interactive(on_url, cancel).await?,
        };

        let session = Self {
            client,
            cache,
            cache_key,
            tokens: Mutex::new(tokens),
        };
        let snapshot = session.tokens.lock().await.clone();
        session.persist(&snapshot).await;
        Ok(session)
    }

    pub async fn account(&self) -> Option<String> {
        self.tokens.lock().await.account.clone()
    }

    /// Forget cached tokens for this environment.
    pub async fn sign_out(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove(&self.cache_key).await {
                warn!("[PHASE: auth] [STEP: sign_out] {:#}", e);
            }
        }
    }

    async fn persist(&self, tokens: &TokenSet) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&self.cache_key, tokens).await {
                warn!("[PHASE: auth] [STEP: token_cache] Could not save tokens: {:#}", e);
            }
        }
    }
}

#[async_trait]
impl AccessTokenSource for AuthSession {
    async fn access_token(&self, cancel: &CancellationToken) -> ServiceResult<String> {
        let mut tokens = self.tokens.lock().await;
        if tokens.is_fresh(Utc::now()) {
            return Ok(tokens.access_token.clone());
        }
        let refresh = tokens.refresh_token.clone().ok_or_else(|| {
            ServiceError::remote("The session has expired. Restart the tool to sign in again.")
        })?;
        let renewed = self.client.refresh(&refresh, cancel).await?;
        self.persist(&renewed).await;
        let access = renewed.access_token.clone();
        *tokens = renewed;
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_in_secs: i64) -> TokenSet {
        TokenSet {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            account: None,
        }
    }

    #[test]
    fn freshness_keeps_a_safety_margin() {
        let now = Utc::now();
        assert!(tokens(3600).is_fresh(now));
        assert!(!tokens(EXPIRY_SKEW_SECS - 10).is_fresh(now));
        assert!(!tokens(-60).is_fresh(now));
    }

    #[tokio::test]
    async fn static_token_is_returned_verbatim() {
        let source = StaticToken::new("bearer-1");
        assert_eq!(
            source
                .access_token(&CancellationToken::new())
                .await
                .expect("token"),
            "bearer-1"
        );
    }
}
