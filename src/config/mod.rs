pub mod cli;
pub mod toml_config;

#[cfg(feature = "cli")]
pub use cli_args::CliConfig;

#[cfg(feature = "cli")]
mod cli_args {
    use super::toml_config::AppConfig;
    use crate::adapters::tabular::SUPPORTED_EXTENSIONS;
    use crate::core::engine::DispatchSettings;
    use crate::utils::error::{DispatchError, Result};
    use crate::utils::validation::{
        validate_digits, validate_file_extensions, validate_path, validate_positive_number,
        Validate,
    };
    use clap::{ArgGroup, Parser};
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Parser)]
    #[command(name = "bulk-dispatch")]
    #[command(about = "Send an approved WhatsApp template to a list of recipients")]
    #[command(group(ArgGroup::new("audience").required(true).args(["recipients", "phone"])))]
    pub struct CliConfig {
        #[arg(long, default_value = "bulk-dispatch.toml", help = "TOML configuration file")]
        pub config: String,

        #[arg(long, help = "Account name from the [accounts] section")]
        pub account: Option<String>,

        #[arg(long, help = "Approved template name")]
        pub template: String,

        #[arg(long, help = "Recipient file (.csv, .tsv or .json workbook grid)")]
        pub recipients: Option<String>,

        #[arg(long, help = "Send to a single phone number")]
        pub phone: Option<String>,

        #[arg(long, help = "Header media file for image, video or document templates")]
        pub header_media: Option<String>,

        #[arg(long = "var", help = "Body variable value, in order (repeatable)")]
        pub vars: Vec<String>,

        #[arg(long, help = "Digits prepended to every recipient")]
        pub country_code: Option<String>,

        #[arg(long)]
        pub concurrency: Option<usize>,

        #[arg(long, help = "Sends per second")]
        pub rate_limit: Option<u32>,

        #[arg(long, help = "Cancel unsent messages after this many seconds")]
        pub deadline_seconds: Option<u64>,

        #[arg(long, help = "Write failed numbers to this CSV file")]
        pub failed_output: Option<String>,

        #[arg(long, help = "Write the JSON run report to this file")]
        pub report: Option<String>,

        #[arg(long, help = "Enable verbose output")]
        pub verbose: bool,

        #[arg(long, help = "Log as JSON lines")]
        pub log_json: bool,

        #[arg(long, help = "Resolve the template and recipients without sending")]
        pub dry_run: bool,

        #[arg(long, help = "Exit non-zero when any recipient failed")]
        pub fail_on_error: bool,
    }

    impl CliConfig {
        /// File settings with command-line overrides applied.
        pub fn dispatch_settings(&self, file: &AppConfig) -> DispatchSettings {
            let mut settings = file.dispatch_settings();
            if let Some(concurrency) = self.concurrency {
                settings.concurrency = concurrency;
            }
            if let Some(rate_limit) = self.rate_limit {
                settings.rate_limit.permits = rate_limit;
                settings.rate_limit.window = Duration::from_secs(1);
            }
            if let Some(deadline) = self.deadline_seconds {
                settings.deadline = Some(Duration::from_secs(deadline));
            }
            if let Some(code) = &self.country_code {
                settings.routing_prefix = Some(code.clone());
            }
            settings
        }
    }

    impl Validate for CliConfig {
        fn validate(&self) -> Result<()> {
            validate_path("config", &self.config)?;

            if self.template.trim().is_empty() {
                return Err(DispatchError::MissingConfigError {
                    field: "template".to_string(),
                });
            }

            match (&self.recipients, &self.phone) {
                (Some(path), None) => {
                    validate_file_extensions(
                        "recipients",
                        std::slice::from_ref(path),
                        SUPPORTED_EXTENSIONS,
                    )?;
                }
                (None, Some(_)) => {}
                _ => {
                    return Err(DispatchError::InvalidConfigValueError {
                        field: "recipients".to_string(),
                        value: String::new(),
                        reason: "Give exactly one of --recipients or --phone".to_string(),
                    })
                }
            }

            if let Some(media) = &self.header_media {
                validate_path("header_media", media)?;
            }
            if self.vars.iter().any(|v| v.trim().is_empty()) {
                return Err(DispatchError::validation("template variables cannot be blank"));
            }
            if let Some(code) = &self.country_code {
                validate_digits("country_code", code)?;
            }
            if let Some(concurrency) = self.concurrency {
                validate_positive_number("concurrency", concurrency, 1)?;
            }
            if let Some(rate_limit) = self.rate_limit {
                validate_positive_number("rate_limit", rate_limit as usize, 1)?;
            }
            if let Some(deadline) = self.deadline_seconds {
                validate_positive_number("deadline_seconds", deadline as usize, 1)?;
            }
            if let Some(path) = &self.failed_output {
                validate_path("failed_output", path)?;
            }
            if let Some(path) = &self.report {
                validate_path("report", path)?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn parse(args: &[&str]) -> CliConfig {
            let mut argv = vec!["bulk-dispatch"];
            argv.extend_from_slice(args);
            CliConfig::try_parse_from(argv).unwrap()
        }

        #[test]
        fn test_parse_and_validate() {
            let config = parse(&[
                "--template",
                "diwali_offer",
                "--recipients",
                "leads.csv",
                "--var",
                "Asha",
                "--var",
                "20%",
                "--country-code",
                "91",
            ]);
            config.validate().unwrap();
            assert_eq!(config.vars, vec!["Asha", "20%"]);
            assert_eq!(config.config, "bulk-dispatch.toml");
        }

        #[test]
        fn test_audience_is_required_and_exclusive() {
            assert!(CliConfig::try_parse_from(["bulk-dispatch", "--template", "t"]).is_err());
            assert!(CliConfig::try_parse_from([
                "bulk-dispatch",
                "--template",
                "t",
                "--phone",
                "1",
                "--recipients",
                "a.csv"
            ])
            .is_err());
        }

        #[test]
        fn test_validation_failures() {
            let xlsx = parse(&["--template", "t", "--recipients", "leads.xlsx"]);
            assert!(xlsx.validate().is_err());

            let code = parse(&["--template", "t", "--phone", "1", "--country-code", "+1"]);
            assert!(code.validate().is_err());

            let zero = parse(&["--template", "t", "--phone", "1", "--concurrency", "0"]);
            assert!(zero.validate().is_err());
        }

        #[test]
        fn test_flags_override_file_settings() {
            let file = AppConfig::from_toml_str(
                "[dispatch]\nconcurrency = 10\nrate_limit = 20\nwindow_ms = 5000\ncountry_code = \"44\"\n",
            )
            .unwrap();

            let untouched = parse(&["--template", "t", "--phone", "1"]).dispatch_settings(&file);
            assert_eq!(untouched.concurrency, 10);
            assert_eq!(untouched.rate_limit.window, Duration::from_secs(5));

            let overridden = parse(&[
                "--template",
                "t",
                "--phone",
                "1",
                "--rate-limit",
                "5",
                "--country-code",
                "91",
                "--deadline-seconds",
                "60",
            ])
            .dispatch_settings(&file);
            assert_eq!(overridden.concurrency, 10);
            assert_eq!(overridden.rate_limit.permits, 5);
            assert_eq!(overridden.rate_limit.window, Duration::from_secs(1));
            assert_eq!(overridden.routing_prefix.as_deref(), Some("91"));
            assert_eq!(overridden.deadline, Some(Duration::from_secs(60)));
        }
    }
}
