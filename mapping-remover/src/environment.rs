// Environment selection and connection
//
// Turns a configured environment into an authenticated Dataverse client.

use crate::auth::oauth::{OAuthClient, OAuthConfig};
use crate::auth::token_cache::TokenCache;
use crate::auth::AuthSession;
use crate::dataverse::WebApiClient;
use crate::error::{ServiceError, ServiceResult};
use crate::models::settings::{AppSettings, EnvironmentConfig};
use crate::utils::logging::mask_sensitive;
use crate::utils::path_resolver;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const NO_ENVIRONMENT_MESSAGE: &str = "No environment was selected. Exiting application.";

pub struct ConnectedEnvironment {
    pub environment: EnvironmentConfig,
    pub client: Arc<WebApiClient>,
    pub session: Arc<AuthSession>,
    pub account: Option<String>,
    pub user_id: Option<uuid::Uuid>,
}

pub struct EnvironmentSelector {
    settings: AppSettings,
    token_cache: Option<Arc<TokenCache>>,
}

impl EnvironmentSelector {
    pub fn new(settings: AppSettings) -> Self {
        let token_cache = settings.token_cache.then(|| {
            Arc::new(TokenCache::new(
                path_resolver::resolve_token_cache_path(),
                path_resolver::resolve_master_key_path(),
            ))
        });
        Self::with_token_cache(settings, token_cache)
    }

    pub fn with_token_cache(settings: AppSettings, token_cache: Option<Arc<TokenCache>>) -> Self {
        Self {
            settings,
            token_cache,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn environments(&self) -> &[EnvironmentConfig] {
        &self.settings.environments
    }

    pub fn select(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.settings.find_environment(name)
    }

    pub fn oauth_config(&self, environment: &EnvironmentConfig) -> OAuthConfig {
        OAuthConfig {
            app_id: self.settings.app_id.clone(),
            authority: self.settings.authority.clone(),
            resource: environment.base_url().to_string(),
            login_timeout: Duration::from_secs(self.settings.login_timeout_secs),
            open_browser: self.settings.open_browser,
        }
    }

    /// Sign in (cached token, refresh, then interactive) and confirm the connection with
    /// WhoAmI.
    pub async fn connect<F>(
        &self,
        environment: &EnvironmentConfig,
        on_sign_in_url: F,
        cancel: &CancellationToken,
    ) -> ServiceResult<ConnectedEnvironment>
    where
        F: FnOnce(&str) + Send,
    {
        info!(
            "[PHASE: connect] [STEP: start] Connecting to {} ({})",
            environment.name,
            environment.base_url()
        );
        let timeout = Duration::from_secs(self.settings.request_timeout_secs);
        let oauth = OAuthClient::new(self.oauth_config(environment), timeout)?;
        let session = Arc::new(
            AuthSession::sign_in(oauth, self.token_cache.clone(), on_sign_in_url, cancel).await?,
        );

        let client = Arc::new(WebApiClient::new(
            environment.base_url(),
            &self.settings.api_version,
            timeout,
            session.clone(),
        )?);
        let user_id = match client.who_am_i(cancel).await {
            Ok(id) => Some(id),
            Err(ServiceError::RemoteFailure {
                status: Some(401), ..
            }) => {
                // Cached token rejected (revoked or wrong tenant): start over next time.
                session.sign_out().await;
                return Err(ServiceError::remote(format!(
                    "Dataverse rejected the sign-in for {}. Try again.",
                    environment.name
                )));
            }
            Err(e) => return Err(e),
        };

        let account = session.account().await;
        info!(
            "[PHASE: connect] [STEP: ready] Connected to {} as {} (user {})",
            environment.name,
            account.as_deref().unwrap_or("unknown account"),
            user_id
                .map(|id| mask_sensitive(&id.to_string()))
                .unwrap_or_default()
        );
        Ok(ConnectedEnvironment {
            environment: environment.clone(),
            client,
            session,
            account,
            user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_config_targets_selected_environment() {
        let mut settings = AppSettings::default();
        settings.environments[1].url = "https://contoso-dev.crm.dynamics.com/".into();
        let selector = EnvironmentSelector::with_token_cache(settings, None);

        let sandbox = selector.select("SANDBOX").expect("sandbox").clone();
        let cfg = selector.oauth_config(&sandbox);
        assert_eq!(cfg.resource, "https://contoso-dev.crm.dynamics.com");
        assert_eq!(cfg.app_id, crate::models::settings::DEFAULT_APP_ID);
        assert!(cfg.scope().starts_with("https://contoso-dev.crm.dynamics.com/user_impersonation"));
    }

    #[test]
    fn unknown_environment_is_not_selected() {
        let selector = EnvironmentSelector::with_token_cache(AppSettings::default(), None);
        assert!(selector.select("staging").is_none());
        assert_eq!(selector.environments().len(), 2);
    }
}
