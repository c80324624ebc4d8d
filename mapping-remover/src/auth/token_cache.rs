// Encrypted per-environment token cache (JSON file).

use super::TokenSet;
use crate::security::secret_protector::SecretProtector;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    account: Option<String>,
}

pub struct TokenCache {
    path: PathBuf,
    protector: SecretProtector,
    io: Mutex<()>,
}

impl TokenCache {
    pub fn new(path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            path,
            protector: SecretProtector::new(key_path),
            io: Mutex::new(()),
        }
    }

    /// Cache key for an app registration against one environment.
    pub fn key(app_id: &str, environment_url: &str) -> String {
        format!(
            "{}|{}",
            app_id.trim().to_lowercase(),
            environment_url.trim().trim_end_matches('/').to_lowercase()
        )
    }

    pub async fn load(&self, key: &str) -> Result<Option<TokenSet>> {
        let _guard = self.io.lock().await;
        let file = self.read_file().await?;
        let Some(entry) = file.entries.get(key) else {
            return Ok(None);
        };
        if !self.protector.is_protected(&entry.access_token) {
            warn!(
                "[PHASE: auth] [STEP: token_cache] Ignoring unprotected entry for {}",
                key
            );
            return Ok(None);
        }

        let access_token = self.protector.unprotect(&entry.access_token).await?;
        let refresh_token = match &entry.refresh_token {
            Some(r) => Some(self.protector.unprotect(r).await?),
            None => None,
        };
        debug!("[PHASE: auth] [STEP: token_cache] Cache hit for {}", key);
        Ok(Some(TokenSet {
            access_token,
            refresh_token,
            expires_at: entry.expires_at,
            account: entry.account.clone(),
        }))
    }

    pub async fn store(&self, key: &str, tokens: &TokenSet) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut file = self.read_file().await.unwrap_or_default();
        file.version = CACHE_VERSION;

        let refresh_token = match &tokens.refresh_token {
            Some(r) => Some(self.protector.protect(r).await?),
            None => None,
        };
        file.entries.insert(
            key.to_string(),
            CacheEntry {
                access_token: self.protector.protect(&tokens.access_token).await?,
                refresh_token,
                expires_at: tokens.expires_at,
                account: tokens.account.clone(),
            },
        );
        self.write_file(&file).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut file = self.read_file().await.unwrap_or_default();
        if file.entries.remove(key).is_some() {
            info!("[PHASE: auth] [STEP: token_cache] Dropped cached tokens for {}", key);
            self.write_file(&file).await?;
        }
        Ok(())
    }

    async fn read_file(&self) -> Result<CacheFile> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(CacheFile::default());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read token cache {:?}", self.path))?;
        let file: CacheFile =
            serde_json::from_str(&raw).context("Token cache file is corrupt")?;
        if file.version != CACHE_VERSION {
            return Ok(CacheFile::default());
        }
        Ok(file)
    }

    async fn write_file(&self, file: &CacheFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}
