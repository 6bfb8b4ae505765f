pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::{cli::LocalStorage, toml_config::AppConfig};

pub use adapters::whatsapp::{WhatsAppClient, WhatsAppCredentials};
pub use core::engine::{DispatchEngine, DispatchRun, DispatchSettings};
pub use core::extractor::RecipientExtractor;
pub use core::rate_limiter::{RateLimitConfig, RateLimiter};
pub use core::retry::RetryPolicy;
pub use domain::model::{
    DispatchFailure, DispatchOutcome, DispatchReport, FailureKind, ProgressSnapshot,
    RecipientBatch, RecipientIdentifier, TemplateMessage,
};
pub use domain::ports::{MessagingApi, SendResult, Storage};
pub use utils::error::{DispatchError, Result};
