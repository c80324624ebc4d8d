// Application settings
//
// Layered with the `config` crate: compiled defaults, then an optional TOML file, then
// MAPPING_REMOVER__* environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::metadata::DEFAULT_BATCH_SIZE;
use crate::utils::validation::validate_environment_url;

/// Public client id registered for Dataverse sample/admin tooling.
pub const DEFAULT_APP_ID: &str = "51f81489-12ee-4a9e-aaae-a2591f45987d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub production: bool,
}

impl EnvironmentConfig {
    pub fn base_url(&self) -> &str {
        self.url.trim().trim_end_matches('/')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub app_id: String,
    pub authority: String,
    pub api_version: String,
    pub metadata_batch_size: usize,
    pub request_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub open_browser: bool,
    pub token_cache: bool,
    pub environments: Vec<EnvironmentConfig>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            authority: "https://login.microsoftonline.com/organizations".to_string(),
            api_version: "v9.2".to_string(),
            metadata_batch_size: DEFAULT_BATCH_SIZE,
            request_timeout_secs: 120,
            login_timeout_secs: 300,
            open_browser: true,
            token_cache: true,
            environments: vec![
                EnvironmentConfig {
                    name: "Production".to_string(),
                    url: "https://YOUR-DYNAMICS-PRODUCTION.crm.dynamics.com".to_string(),
                    production: true,
                },
                EnvironmentConfig {
                    name: "Sandbox".to_string(),
                    url: "https://YOUR-DYNAMICS-SANDBOX.crm.dynamics.com".to_string(),
                    production: false,
                },
            ],
        }
    }
}

impl AppSettings {
    /// Load settings. A missing file is fine; a malformed one is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&AppSettings::default())
            .context("Failed to seed default settings")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MAPPING_REMOVER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: AppSettings = builder
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Settings file is not valid")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            anyhow::bail!("app_id must not be empty");
        }
        url::Url::parse(&self.authority)
            .with_context(|| format!("authority is not a valid URL: {}", self.authority))?;

        if self.metadata_batch_size == 0 || self.metadata_batch_size > 1000 {
            anyhow::bail!(
                "metadata_batch_size must be between 1 and 1000 (got {})",
                self.metadata_batch_size
            );
        }

        if self.environments.is_empty() {
            anyhow::bail!("At least one environment must be configured");
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            let name = env.name.trim();
            if name.is_empty() {
                anyhow::bail!("Environment name must not be empty");
            }
            if !seen.insert(name.to_lowercase()) {
                anyhow::bail!("Environment name '{}' is configured more than once", name);
            }
            validate_environment_url(env.base_url())
                .with_context(|| format!("Environment '{}' is misconfigured", name))?;
        }
        Ok(())
    }

    pub fn find_environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        let wanted = name.trim();
        self.environments
            .iter()
            .find(|e| e.name.trim().eq_ignore_ascii_case(wanted))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }
}
