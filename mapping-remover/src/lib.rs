// Dataverse Mapping Remover
// Main library entry point

mod auth;
mod dataverse;
mod environment;
mod error;
mod mapping;
mod metadata;
mod models;
mod security;
mod session;
mod tui;
mod utils;

use anyhow::{Context, Result};
use environment::EnvironmentSelector;
use log::{error, info};
use models::settings::AppSettings;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command-line options understood by the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    /// Settings file; defaults to the per-user config folder.
    pub config_path: Option<PathBuf>,
    /// Environment to connect to without showing the picker.
    pub environment: Option<String>,
}

impl CliOptions {
    fn resolved_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(utils::path_resolver::resolve_config_path)
    }
}

/// Initialize logging system with dual format (JSON + human-readable)
fn init_logging(with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder()?;
    std::fs::create_dir_all(&log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("mapping-remover-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("mapping-remover-{}.txt", timestamp));

    // - JSON format to .log file
    // - Human-readable format to .txt file
    // - Optional: human-readable to stdout (disabled for the TUI)
    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("reqwest", log::LevelFilter::Info)
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("hyper_util", log::LevelFilter::Info);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = utils::logging::mask_url_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = utils::logging::mask_url_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = utils::logging::mask_url_secrets(&message.to_string());
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

fn load_settings(options: &CliOptions) -> Result<AppSettings> {
    let path = options.resolved_config_path();
    info!(
        "[PHASE: initialization] [STEP: settings] Loading settings from {:?}",
        path
    );
    AppSettings::load(Some(path.as_path()))
}

/// Interactive lookup/delete TUI.
pub fn run_tui(options: CliOptions) {
    // Initialize logging (no stdout to avoid corrupting the TUI)
    if let Err(e) = init_logging(false) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!(
        "[PHASE: initialization] Mapping remover starting at {}",
        chrono::Utc::now()
    );

    let settings = match load_settings(&options) {
        Ok(s) => s,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: settings] {:#}", e);
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(2);
        }
    };
    info!(
        "[PHASE: initialization] [STEP: settings] {} environment(s) configured",
        settings.environments.len()
    );

    let selector = Arc::new(EnvironmentSelector::new(settings));
    if let Err(e) = tui::run(selector, options.environment) {
        error!("[PHASE: tui] [STEP: fatal] TUI exited with error: {:?}", e);
        eprintln!("Mapping remover error: {}", e);
        std::process::exit(1);
    }
}

/// Non-interactive TUI smoke mode (for automated checks).
/// Renders a single frame to an in-memory backend and exits.
pub fn run_tui_smoke(target: Option<String>) {
    // Initialize logging (no stdout to avoid corrupting the terminal)
    if let Err(e) = init_logging(false) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    info!(
        "[PHASE: initialization] TUI smoke starting at {}",
        chrono::Utc::now()
    );

    let target = target.as_deref().unwrap_or("environments");
    if let Err(e) = tui::smoke(target) {
        error!(
            "[PHASE: tui] [STEP: smoke] TUI smoke exited with error: {:?}",
            e
        );
        eprintln!("Mapping remover error: {}", e);
        std::process::exit(1);
    }
}

fn write_default_config_to(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists; not overwriting it", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let toml = AppSettings::default().to_toml()?;
    std::fs::write(path, toml).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// `--write-default-config`: write the compiled defaults as TOML and exit.
pub fn run_write_default_config(options: CliOptions) {
    // Console mode: mirror the log to stdout
    if let Err(e) = init_logging(true) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let path = options.resolved_config_path();
    match write_default_config_to(&path) {
        Ok(()) => info!(
            "[PHASE: config] [STEP: write_default] Wrote default settings to {}",
            path.display()
        ),
        Err(e) => {
            error!("[PHASE: config] [STEP: write_default] {:#}", e);
            eprintln!("Could not write default settings: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_written_once_and_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.toml");

        write_default_config_to(&path).expect("write");
        let loaded = AppSettings::load(Some(path.as_path())).expect("load");
        assert_eq!(loaded, AppSettings::default());

        let err = write_default_config_to(&path).expect_err("second write");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn explicit_config_path_wins() {
        let options = CliOptions {
            config_path: Some(PathBuf::from("/tmp/custom.toml")),
            environment: None,
        };
        assert_eq!(
            options.resolved_config_path(),
            PathBuf::from("/tmp/custom.toml")
        );
    }
}
