use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.host.trim().is_empty() {
        return Err(validation_err("server.host cannot be empty"));
    }
    if server.port == 0 {
        return Err(validation_err("server.port must be greater than 0"));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_base_url(&upstream.base_url)?;

    if let Some(key) = upstream.api_key.as_deref() {
        if key.trim().is_empty() {
            return Err(validation_err("upstream.api_key cannot be empty when set"));
        }
    }
    if let Some(model) = upstream.model.as_deref() {
        if model.trim().is_empty() {
            return Err(validation_err("upstream.model cannot be empty when set"));
        }
    }
    if upstream.tool_tags.is_empty() {
        return Err(validation_err("upstream.tool_tags cannot be empty"));
    }
    for tag in &upstream.tool_tags {
        if tag.trim().is_empty() {
            return Err(validation_err("upstream.tool_tags contains an empty tag"));
        }
        if tag.contains(['<', '>', '/']) || tag.chars().any(char::is_whitespace) {
            return Err(validation_err(format!(
                "upstream.tool_tags entry '{tag}' must be a bare element name"
            )));
        }
    }
    if upstream.max_markup_buffer_bytes == 0 {
        return Err(validation_err(
            "upstream.max_markup_buffer_bytes must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_base_url(base_url: &str) -> Result<(), ConfigError> {
    let base_url = base_url.trim();
    if base_url.is_empty() {
        return Err(validation_err("upstream.base_url cannot be empty"));
    }
    let parsed = url::Url::parse(base_url)
        .map_err(|err| validation_err(format!("upstream.base_url is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "upstream.base_url must use http:// or https://",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
