#![allow(dead_code)]

use async_trait::async_trait;
use bulk_dispatch::domain::model::{HeaderKind, TemplateDirectory, TemplateInfo};
use bulk_dispatch::domain::ports::ProviderError;
use bulk_dispatch::{
    DispatchError, MessagingApi, RecipientBatch, RecipientIdentifier, Result, SendResult,
    TemplateMessage,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// What the fake provider does with one send attempt.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject { code: i64, http_status: u16 },
    Transport,
    Delay(Duration),
    Panic,
}

/// In-memory provider. Sends follow a per-recipient script, then accept.
#[derive(Default)]
pub struct FakeProvider {
    templates: Mutex<Option<TemplateDirectory>>,
    auth_failure: Mutex<bool>,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    sends: Mutex<Vec<(String, Instant)>>,
    uploads: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn with_templates(self, templates: Vec<TemplateInfo>) -> Self {
        *self.templates.lock() = Some(
            templates
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        );
        self
    }

    pub fn with_expired_token(self) -> Self {
        *self.auth_failure.lock() = true;
        self
    }

    pub fn script(self, recipient: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .insert(recipient.to_string(), replies.into());
        self
    }

    /// Every send attempt in the order it reached the provider.
    pub fn send_log(&self) -> Vec<(String, Instant)> {
        self.sends.lock().clone()
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.sends.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn attempts_for(&self, recipient: &str) -> Vec<Instant> {
        self.sends
            .lock()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl MessagingApi for FakeProvider {
    async fn list_approved_templates(&self) -> Result<TemplateDirectory> {
        if *self.auth_failure.lock() {
            return Err(DispatchError::AuthError {
                message: "Error validating access token: Session has expired".to_string(),
            });
        }
        Ok(self.templates.lock().clone().unwrap_or_default())
    }

    async fn upload_media(&self, _bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        self.uploads.lock().push(mime_type.to_string());
        Ok(format!("media-{}", self.uploads.lock().len()))
    }

    async fn send_template_message(
        &self,
        recipient: &RecipientIdentifier,
        _message: &TemplateMessage,
    ) -> Result<SendResult> {
        self.sends
            .lock()
            .push((recipient.to_string(), Instant::now()));
        let reply = self
            .scripts
            .lock()
            .get_mut(recipient.as_str())
            .and_then(|replies| replies.pop_front())
            .unwrap_or(Reply::Accept);

        match reply {
            Reply::Accept => Ok(SendResult::Accepted {
                message_id: format!("wamid.{}", recipient),
            }),
            Reply::Reject { code, http_status } => Ok(SendResult::Rejected(ProviderError {
                code,
                subcode: None,
                http_status: Some(http_status),
                message: format!("scripted rejection {}", code),
            })),
            Reply::Transport => Err(DispatchError::transport("connection reset by peer")),
            Reply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(SendResult::Accepted {
                    message_id: format!("wamid.{}", recipient),
                })
            }
            Reply::Panic => panic!("provider client crashed sending to {}", recipient),
        }
    }
}

pub fn template(name: &str, header_kind: HeaderKind, body_variable_count: usize) -> TemplateInfo {
    TemplateInfo {
        name: name.to_string(),
        language: "en_US".to_string(),
        header_kind,
        body_variable_count,
    }
}

pub fn rid(value: &str) -> RecipientIdentifier {
    RecipientIdentifier::parse(value).unwrap()
}

/// `count` distinct ten-digit numbers starting at 9000000000.
pub fn numbered_batch(label: &str, count: usize) -> RecipientBatch {
    let mut batch = RecipientBatch::new();
    batch.push_group(
        label,
        (0..count)
            .map(|i| rid(&(9_000_000_000u64 + i as u64).to_string()))
            .collect(),
    );
    batch
}
