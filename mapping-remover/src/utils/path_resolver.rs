use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_FOLDER: &str = "DataverseMappingRemover";

/// Folder the executable runs from, or the working directory.
pub fn resolve_exe_folder() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Per-user data folder (`<data_local_dir>/DataverseMappingRemover`), not created.
pub fn resolve_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_FOLDER))
        .unwrap_or_else(resolve_exe_folder)
}

/// Log folder, created on demand. Falls back to `<exe dir>/logs` when the data folder is
/// not writable.
pub fn resolve_log_folder() -> Result<PathBuf> {
    let preferred = resolve_data_folder().join("logs");
    if std::fs::create_dir_all(&preferred).is_ok() {
        return Ok(preferred);
    }
    let fallback = resolve_exe_folder().join("logs");
    std::fs::create_dir_all(&fallback)
        .with_context(|| format!("Failed to create log folder: {:?}", fallback))?;
    Ok(fallback)
}

/// Default settings file location.
pub fn resolve_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_FOLDER))
        .unwrap_or_else(resolve_exe_folder)
        .join("settings.toml")
}

pub fn resolve_token_cache_path() -> PathBuf {
    resolve_data_folder().join("token-cache.json")
}

pub fn resolve_master_key_path() -> PathBuf {
    resolve_data_folder().join("secrets").join("token-cache.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_files_live_under_the_app_folder() {
        let data = resolve_data_folder();
        assert!(resolve_token_cache_path().starts_with(&data));
        assert!(resolve_master_key_path().starts_with(&data));
        assert_eq!(
            resolve_config_path().file_name().and_then(|n| n.to_str()),
            Some("settings.toml")
        );
    }
}
