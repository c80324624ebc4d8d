// Input validation utilities

use crate::error::{ServiceError, ServiceResult};
use url::Url;

/// Validate a table or column logical name and normalize it to lower case.
///
/// The raw value is checked, so leading/trailing whitespace is rejected rather than trimmed.
pub fn validate_logical_name(value: &str, what: &str) -> ServiceResult<String> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidArgument(format!("{} is required", what)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ServiceError::InvalidArgument(format!(
            "{} '{}' must not contain spaces",
            what, value
        )));
    }
    Ok(value.to_lowercase())
}

/// Environment URLs must be absolute https URLs with a host.
pub fn validate_environment_url(value: &str) -> anyhow::Result<Url> {
    let url = Url::parse(value.trim())
        .map_err(|e| anyhow::anyhow!("Environment URL '{}' is not valid: {}", value, e))?;
    if url.scheme() != "https" {
        return Err(anyhow::anyhow!(
            "Environment URL '{}' must use https",
            value
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(anyhow::anyhow!("Environment URL '{}' has no host", value));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_names_are_lowercased() {
        assert_eq!(
            validate_logical_name("EmailAddress1", "Field").ok().as_deref(),
            Some("emailaddress1")
        );
    }

    #[test]
    fn blank_or_spaced_names_are_rejected() {
        for bad in ["", "   ", " contact", "contact ", "new entity", "a\tb"] {
            let err = validate_logical_name(bad, "Table").unwrap_err();
            assert!(matches!(err, ServiceError::InvalidArgument(_)), "{:?}", bad);
        }
    }

    #[test]
    fn environment_urls_must_be_https() {
        assert!(validate_environment_url("https://org.crm.dynamics.com").is_ok());
        assert!(validate_environment_url("http://org.crm.dynamics.com").is_err());
        assert!(validate_environment_url("org.crm.dynamics.com").is_err());
    }
}
