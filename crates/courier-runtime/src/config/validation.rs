//! Checks that loaded configuration is usable before anything starts.

use super::error::{ConfigError, ConfigResult};
use super::schema::{
    BotConfig, CourierConfig, LogOutput, LoggingConfig, PersistenceBackend, PersistenceConfig,
    PollingConfig, RetrySettings, WebhookConfig,
};

/// Validates every section; the first problem found is returned.
pub fn validate_config(config: &CourierConfig) -> ConfigResult<()> {
    validate_bot_config(&config.bot)?;
    validate_polling_config(&config.polling)?;
    validate_webhook_config(&config.webhook)?;
    validate_persistence_config(&config.persistence)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

fn validate_bot_config(bot: &BotConfig) -> ConfigResult<()> {
    validate_url(&bot.api_url)?;

    if let Some(token) = &bot.token
        && (token.is_empty() || token.contains(char::is_whitespace))
    {
        return Err(ConfigError::invalid(
            "bot.token",
            "must be non-empty and contain no whitespace",
        ));
    }

    if let Some(username) = &bot.username
        && username.starts_with('@')
    {
        return Err(ConfigError::invalid(
            "bot.username",
            "give the name without the leading '@'",
        ));
    }

    Ok(())
}

fn validate_polling_config(polling: &PollingConfig) -> ConfigResult<()> {
    if !(1..=100).contains(&polling.limit) {
        return Err(ConfigError::invalid(
            "polling.limit",
            format!("must be between 1 and 100, got {}", polling.limit),
        ));
    }
    validate_retry_config(&polling.retry)
}

fn validate_retry_config(retry: &RetrySettings) -> ConfigResult<()> {
    if retry.initial_delay_ms == 0 {
        return Err(ConfigError::invalid(
            "polling.retry.initial_delay_ms",
            "must be greater than 0",
        ));
    }

    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(ConfigError::invalid(
            "polling.retry.max_delay_ms",
            "must not be below initial_delay_ms",
        ));
    }

    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::invalid(
            "polling.retry.backoff_multiplier",
            "must be at least 1.0",
        ));
    }

    Ok(())
}

fn validate_webhook_config(webhook: &WebhookConfig) -> ConfigResult<()> {
    if webhook.port == 0 {
        return Err(ConfigError::invalid("webhook.port", "must not be 0"));
    }
    if !webhook.path.starts_with('/') {
        return Err(ConfigError::invalid("webhook.path", "must start with '/'"));
    }
    if webhook.queue_capacity == 0 {
        return Err(ConfigError::invalid(
            "webhook.queue_capacity",
            "must be greater than 0",
        ));
    }

    // The Bot API accepts 1-256 characters from A-Z, a-z, 0-9, '_' and '-'.
    if let Some(secret) = &webhook.secret_token {
        let valid_chars = secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if secret.is_empty() || secret.len() > 256 || !valid_chars {
            return Err(ConfigError::invalid(
                "webhook.secret_token",
                "must be 1-256 characters of A-Z, a-z, 0-9, '_' or '-'",
            ));
        }
    }

    Ok(())
}

fn validate_persistence_config(persistence: &PersistenceConfig) -> ConfigResult<()> {
    if persistence.backend == PersistenceBackend::None {
        return Ok(());
    }
    if persistence.update_interval_secs == 0 {
        return Err(ConfigError::invalid(
            "persistence.update_interval_secs",
            "must be greater than 0",
        ));
    }
    if persistence.backend == PersistenceBackend::Json
        && persistence.path.as_os_str().is_empty()
    {
        return Err(ConfigError::missing_field("persistence.path"));
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn validate_url(url: &str) -> ConfigResult<()> {
    if url.is_empty() {
        return Err(ConfigError::missing_field("bot.api_url"));
    }

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::invalid_url(url, "expected an http or https URL"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&CourierConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_api_url() {
        let mut config = CourierConfig::default();
        config.bot.api_url = "ftp://example.org".to_string();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_validate_webhook_secret() {
        let mut config = CourierConfig::default();
        config.webhook.secret_token = Some("s3cr3t_token-1".to_string());
        assert!(validate_config(&config).is_ok());

        config.webhook.secret_token = Some("not allowed!".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_retry() {
        let mut config = CourierConfig::default();
        config.polling.retry.max_delay_ms = 10;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.field(), Some("polling.retry.max_delay_ms"));
    }

    #[test]
    fn test_validate_file_logging_needs_path() {
        let mut config = CourierConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }
}
