use crate::adapters::whatsapp::{WhatsAppCredentials, DEFAULT_API_VERSION, DEFAULT_BASE_URL};
use crate::core::engine::DispatchSettings;
use crate::core::extractor::RecipientExtractor;
use crate::core::rate_limiter::RateLimitConfig;
use crate::core::retry::RetryPolicy;
use crate::utils::error::{DispatchError, Result};
use crate::utils::validation::{
    validate_digits, validate_non_empty_string, validate_positive_number, validate_range,
    validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
    #[serde(default)]
    pub dispatch: DispatchFileConfig,
    #[serde(default)]
    pub recipients: RecipientsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub business_account_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchFileConfig {
    pub concurrency: Option<usize>,
    pub rate_limit: Option<u32>,
    pub window_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub attempt_timeout_seconds: Option<u64>,
    pub deadline_seconds: Option<u64>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientsConfig {
    pub column_patterns: Option<Vec<String>>,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| DispatchError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replaces `${VAR}` with the environment value. Unset variables are left verbatim.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| DispatchError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.into_owned())
    }

    pub fn base_url(&self) -> &str {
        self.api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn api_version(&self) -> &str {
        self.api.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_seconds.unwrap_or(30))
    }

    /// Picks the named account, or the only one when no name is given.
    pub fn account(&self, name: Option<&str>) -> Result<(&str, &AccountConfig)> {
        match name {
            Some(name) => self
                .accounts
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| DispatchError::InvalidConfigValueError {
                    field: "account".to_string(),
                    value: name.to_string(),
                    reason: format!(
                        "No such account. Configured accounts: {}",
                        self.account_names().join(", ")
                    ),
                }),
            None if self.accounts.len() == 1 => self
                .accounts
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| DispatchError::MissingConfigError {
                    field: "accounts".to_string(),
                }),
            None => Err(DispatchError::MissingConfigError {
                field: if self.accounts.is_empty() {
                    "accounts".to_string()
                } else {
                    format!("account (one of: {})", self.account_names().join(", "))
                },
            }),
        }
    }

    fn account_names(&self) -> Vec<&str> {
        self.accounts.keys().map(String::as_str).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.dispatch.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff: self
                .dispatch
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            backoff_factor: self.dispatch.backoff_factor.unwrap_or(defaults.backoff_factor),
            max_backoff: defaults.max_backoff,
            attempt_timeout: self
                .dispatch
                .attempt_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        let defaults = RateLimitConfig::default();
        RateLimitConfig {
            permits: self.dispatch.rate_limit.unwrap_or(defaults.permits),
            window: self
                .dispatch
                .window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.window),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let defaults = DispatchSettings::default();
        DispatchSettings {
            concurrency: self.dispatch.concurrency.unwrap_or(defaults.concurrency),
            rate_limit: self.rate_limit(),
            retry: self.retry_policy(),
            deadline: self.dispatch.deadline_seconds.map(Duration::from_secs),
            routing_prefix: self.dispatch.country_code.clone(),
        }
    }

    pub fn extractor(&self) -> RecipientExtractor {
        match &self.recipients.column_patterns {
            Some(patterns) => RecipientExtractor::new(patterns.iter().map(String::as_str)),
            None => RecipientExtractor::default(),
        }
    }

    pub fn validate_config(&self) -> Result<()> {
        validate_url("api.base_url", self.base_url())?;
        validate_non_empty_string("api.api_version", self.api_version())?;
        if let Some(timeout) = self.api.timeout_seconds {
            validate_range("api.timeout_seconds", timeout, 1, 600)?;
        }

        for (name, account) in &self.accounts {
            account.validate_named(name)?;
        }

        let dispatch = &self.dispatch;
        if let Some(concurrency) = dispatch.concurrency {
            validate_positive_number("dispatch.concurrency", concurrency, 1)?;
        }
        if let Some(rate_limit) = dispatch.rate_limit {
            validate_positive_number("dispatch.rate_limit", rate_limit as usize, 1)?;
        }
        if let Some(window_ms) = dispatch.window_ms {
            validate_range("dispatch.window_ms", window_ms, 1, 3_600_000)?;
        }
        if let Some(max_retries) = dispatch.max_retries {
            validate_range("dispatch.max_retries", max_retries, 0, 10)?;
        }
        if let Some(factor) = dispatch.backoff_factor {
            validate_range("dispatch.backoff_factor", factor, 1, 10)?;
        }
        if let Some(timeout) = dispatch.attempt_timeout_seconds {
            validate_range("dispatch.attempt_timeout_seconds", timeout, 1, 600)?;
        }
        if let Some(deadline) = dispatch.deadline_seconds {
            validate_positive_number("dispatch.deadline_seconds", deadline as usize, 1)?;
        }
        if let Some(code) = &dispatch.country_code {
            validate_digits("dispatch.country_code", code)?;
        }

        if let Some(patterns) = &self.recipients.column_patterns {
            if patterns.iter().all(|p| p.trim().is_empty()) {
                return Err(DispatchError::InvalidConfigValueError {
                    field: "recipients.column_patterns".to_string(),
                    value: format!("{:?}", patterns),
                    reason: "At least one non-empty pattern is required".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl AccountConfig {
    fn validate_named(&self, name: &str) -> Result<()> {
        let fields = [
            ("access_token", &self.access_token),
            ("phone_number_id", &self.phone_number_id),
            ("business_account_id", &self.business_account_id),
        ];
        for (field, value) in fields {
            let field = format!("accounts.{}.{}", name, field);
            validate_non_empty_string(&field, value)?;
            if value.starts_with("${") {
                return Err(DispatchError::MissingConfigError {
                    field: format!("{} (environment variable {} is not set)", field, value),
                });
            }
        }
        validate_digits(&format!("accounts.{}.phone_number_id", name), &self.phone_number_id)?;
        validate_digits(
            &format!("accounts.{}.business_account_id", name),
            &self.business_account_id,
        )?;
        Ok(())
    }

    pub fn credentials(&self) -> WhatsAppCredentials {
        WhatsAppCredentials {
            access_token: self.access_token.clone(),
            phone_number_id: self.phone_number_id.clone(),
            business_account_id: self.business_account_id.clone(),
        }
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"
[api]
base_url = "https://graph.facebook.com"
api_version = "v24.0"
timeout_seconds = 20

[accounts.retail]
access_token = "EAAG-retail"
phone_number_id = "1111"
business_account_id = "2222"

[accounts.support]
access_token = "EAAG-support"
phone_number_id = "3333"
business_account_id = "4444"

[dispatch]
concurrency = 40
rate_limit = 50
window_ms = 2000
max_retries = 3
initial_backoff_ms = 250
country_code = "91"

[recipients]
column_patterns = ["whatsapp", "mobile"]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_toml_str(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.request_timeout(), Duration::from_secs(20));
        let (name, account) = config.account(Some("support")).unwrap();
        assert_eq!(name, "support");
        assert_eq!(account.credentials().phone_number_id, "3333");

        let settings = config.dispatch_settings();
        assert_eq!(settings.concurrency, 40);
        assert_eq!(settings.rate_limit.permits, 50);
        assert_eq!(settings.rate_limit.window, Duration::from_secs(2));
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(settings.retry.backoff_factor, 2);
        assert_eq!(settings.routing_prefix.as_deref(), Some("91"));
        assert_eq!(config.extractor().patterns(), ["whatsapp", "mobile"]);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = AppConfig::from_toml_str(
            r#"
[accounts.only]
access_token = "t"
phone_number_id = "1"
business_account_id = "2"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.account(None).unwrap().0, "only");
        let settings = config.dispatch_settings();
        assert_eq!(settings.concurrency, 80);
        assert_eq!(settings.rate_limit.permits, 80);
        assert_eq!(settings.retry.max_attempts(), 3);
        assert!(settings.deadline.is_none());
    }

    #[test]
    fn test_account_selection_errors() {
        let config = AppConfig::from_toml_str(FULL_CONFIG).unwrap();
        assert!(matches!(
            config.account(None),
            Err(DispatchError::MissingConfigError { .. })
        ));
        assert!(matches!(
            config.account(Some("marketing")),
            Err(DispatchError::InvalidConfigValueError { .. })
        ));
        assert!(AppConfig::default().account(None).is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("BULK_DISPATCH_TEST_TOKEN", "EAAG-from-env");

        let config = AppConfig::from_toml_str(
            r#"
[accounts.main]
access_token = "${BULK_DISPATCH_TEST_TOKEN}"
phone_number_id = "1"
business_account_id = "2"
"#,
        )
        .unwrap();
        assert_eq!(config.accounts["main"].access_token, "EAAG-from-env");

        std::env::remove_var("BULK_DISPATCH_TEST_TOKEN");
    }

    #[test]
    fn test_unset_env_var_fails_validation() {
        let config = AppConfig::from_toml_str(
            r#"
[accounts.main]
access_token = "${BULK_DISPATCH_SURELY_UNSET_VAR}"
phone_number_id = "1"
business_account_id = "2"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(DispatchError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_url = AppConfig::from_toml_str("[api]\nbase_url = \"graph\"\n").unwrap();
        assert!(bad_url.validate().is_err());

        let bad_code = AppConfig::from_toml_str("[dispatch]\ncountry_code = \"+91\"\n").unwrap();
        assert!(bad_code.validate().is_err());

        let zero = AppConfig::from_toml_str("[dispatch]\nconcurrency = 0\n").unwrap();
        assert!(zero.validate().is_err());

        assert!(matches!(
            AppConfig::from_toml_str("[dispatch\n"),
            Err(DispatchError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(FULL_CONFIG.as_bytes()).unwrap();

        let config = AppConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.accounts.len(), 2);
    }
}
