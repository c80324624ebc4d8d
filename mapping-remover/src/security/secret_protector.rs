// Token encryption at rest
//
// AES-256-GCM with a lazily created, file-backed master key next to the token cache.
// Protected values are `MRv1:` + base64(nonce || ciphertext || tag).
//
// NOTE: the key file is only as safe as the user's profile folder. An OS keyring would be
// stronger but is not available on every target.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const PREFIX: &str = "MRv1:";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

#[derive(Debug)]
pub struct SecretProtector {
    key_path: PathBuf,
    key: OnceCell<[u8; KEY_BYTES]>,
}

impl SecretProtector {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            key: OnceCell::new(),
        }
    }

    pub fn is_protected(&self, value: &str) -> bool {
        value.starts_with(PREFIX)
    }

    pub async fn protect(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher().await?;

        let mut nonce = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| anyhow::anyhow!("Failed to generate nonce"))?;

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("Token encryption failed"))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&sealed);
        Ok(format!("{}{}", PREFIX, STANDARD.encode(blob)))
    }

    /// Reverse `protect`. Values without the prefix are rejected; the cache never stores
    /// plaintext.
    pub async fn unprotect(&self, value: &str) -> Result<String> {
        let encoded = value
            .strip_prefix(PREFIX)
            .ok_or_else(|| anyhow::anyhow!("Value is not a protected secret"))?;
        let blob = STANDARD
            .decode(encoded)
            .context("Failed to base64-decode protected secret")?;
        if blob.len() <= NONCE_BYTES {
            anyhow::bail!("Protected secret is too short");
        }
        let (nonce, sealed) = blob.split_at(NONCE_BYTES);

        let cipher = self.cipher().await?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| anyhow::anyhow!("Token decryption failed (key changed?)"))?;
        String::from_utf8(plain).context("Decrypted secret is not valid UTF-8")
    }

    async fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self
            .key
            .get_or_try_init(|| load_or_create_key(&self.key_path))
            .await?;
        Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow::anyhow!("Internal error: invalid AES-256 key length"))
    }
}

async fn load_or_create_key(path: &Path) -> Result<[u8; KEY_BYTES]> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read key file: {:?}", path))?;
        let decoded = STANDARD
            .decode(raw.trim())
            .context("Key file is not valid base64")?;
        let key: [u8; KEY_BYTES] = decoded
            .try_into()
            .map_err(|_| anyhow::anyhow!("Key file must hold {} bytes", KEY_BYTES))?;
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create key directory: {:?}", parent))?;
    }

    let mut key = [0u8; KEY_BYTES];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| anyhow::anyhow!("Failed to generate master key"))?;
    let encoded = STANDARD.encode(key);

    let strategy = ExponentialBackoff::from_millis(50)
        .factor(2)
        .max_delay(Duration::from_millis(750))
        .take(3)
        .map(jitter);
    let write = || async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await
    };

    match RetryIf::spawn(strategy, write, is_transient).await {
        Ok(()) => debug!("[PHASE: auth] [STEP: master_key] Created key file {:?}", path),
        // Another process won the race or the folder is read-only: keep the in-memory key
        // for this run; cached tokens simply will not survive a restart.
        Err(e) => warn!(
            "[PHASE: auth] [STEP: master_key] Could not persist key file {:?}: {}",
            path, e
        ),
    }
    Ok(key)
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
