// Logging utilities
// Structured logging with JSON and human-readable formats

use log::Level;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

/// Mask sensitive data in logs
pub fn mask_sensitive(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let start: String = chars[..4].iter().collect();
    let end: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", start, end)
}

const SECRET_PARAMS: &[&str] = &[
    "code",
    "access_token",
    "refresh_token",
    "id_token",
    "code_verifier",
    "client_secret",
];

fn secret_param_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let names = SECRET_PARAMS.join("|");
        Regex::new(&format!(r#"(?i)\b({})=([^&\s"']+)"#, names)).ok()
    })
    .as_ref()
}

fn bearer_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9\-_\.=]+").ok())
        .as_ref()
}

/// Redact OAuth secrets carried in URLs, form bodies and Authorization headers.
pub fn mask_url_secrets(input: &str) -> String {
    let Some(params) = secret_param_regex() else {
        return "***".to_string();
    };
    let masked = params.replace_all(input, "$1=***");
    match bearer_regex() {
        Some(bearer) => bearer.replace_all(&masked, "Bearer ***").into_owned(),
        None => "***".to_string(),
    }
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...] and [STEP: ...] patterns
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let (phase, rest) = take_marker(message, "[PHASE:");
    let (step, rest) = take_marker(&rest, "[STEP:");
    (phase, step, rest)
}

fn take_marker(message: &str, marker: &str) -> (Option<String>, String) {
    let Some(start) = message.find(marker) else {
        return (None, message.to_string());
    };
    let Some(len) = message[start..].find(']') else {
        return (None, message.to_string());
    };
    let value = message[start + marker.len()..start + len].trim().to_string();
    let cleaned = format!("{} {}", &message[..start], &message[start + len + 1..])
        .trim()
        .to_string();
    (Some(value), cleaned)
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });
    if let Some(phase) = phase {
        entry["phase"] = json!(phase);
    }
    if let Some(step) = step {
        entry["step"] = json!(step);
    }
    serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut line = format!("[{}] [{}]", timestamp, level.as_str());
    if let Some(phase) = phase {
        line.push_str(&format!(" [PHASE: {}]", phase));
    }
    if let Some(step) = step {
        line.push_str(&format!(" [STEP: {}]", step));
    }
    line.push_str(&format!(" [{}] {}", target, message));
    line
}
