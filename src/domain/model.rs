use crate::utils::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A normalized destination: non-empty, ASCII digits only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecipientIdentifier(String);

impl RecipientIdentifier {
    pub fn parse(value: &str) -> Option<Self> {
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    /// Prepends a routing prefix such as a country code. The prefix must be digits.
    pub fn with_prefix(&self, prefix: &str) -> Option<Self> {
        Self::parse(&format!("{}{}", prefix, self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecipientIdentifier {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
            .ok_or_else(|| DispatchError::validation(format!("invalid recipient '{}'", value)))
    }
}

impl From<RecipientIdentifier> for String {
    fn from(value: RecipientIdentifier) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientGroup {
    pub label: String,
    pub recipients: Vec<RecipientIdentifier>,
}

/// Recipients keyed by source group (sheet, table, file), in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecipientBatch {
    groups: Vec<RecipientGroup>,
}

impl RecipientBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups without recipients are dropped rather than kept empty.
    pub fn push_group(&mut self, label: impl Into<String>, recipients: Vec<RecipientIdentifier>) {
        if recipients.is_empty() {
            return;
        }
        self.groups.push(RecipientGroup {
            label: label.into(),
            recipients,
        });
    }

    pub fn groups(&self) -> &[RecipientGroup] {
        &self.groups
    }

    pub fn get(&self, label: &str) -> Option<&[RecipientIdentifier]> {
        self.groups
            .iter()
            .find(|g| g.label == label)
            .map(|g| g.recipients.as_slice())
    }

    /// Total recipients across all groups, duplicates between groups included.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.recipients.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// One cell of a tabular source.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Integer(i64),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableGroup {
    pub label: String,
    /// First row is the header row.
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularSource {
    pub groups: Vec<TableGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderKind {
    None,
    Text,
    Image,
    Video,
    Document,
    Location,
}

impl HeaderKind {
    pub fn from_format(format: &str) -> Self {
        match format.to_ascii_uppercase().as_str() {
            "TEXT" => Self::Text,
            "IMAGE" => Self::Image,
            "VIDEO" => Self::Video,
            "DOCUMENT" => Self::Document,
            "LOCATION" => Self::Location,
            _ => Self::None,
        }
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            Self::Image => Some(MediaKind::Image),
            Self::Video => Some(MediaKind::Video),
            Self::Document => Some(MediaKind::Document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    pub name: String,
    pub language: String,
    pub header_kind: HeaderKind,
    pub body_variable_count: usize,
}

pub type TemplateDirectory = BTreeMap<String, TemplateInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime_type: &str) -> Result<Self> {
        match mime_type {
            "image/jpeg" | "image/jpg" | "image/png" => Ok(Self::Image),
            "video/mp4" | "video/3gpp" => Ok(Self::Video),
            "application/pdf" => Ok(Self::Document),
            other => Err(DispatchError::UnsupportedMediaType {
                mime_type: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderParam {
    pub kind: MediaKind,
    pub media_id: String,
}

/// Everything a send needs besides the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateMessage {
    pub template_name: String,
    pub language_code: String,
    pub header: Option<HeaderParam>,
    pub body: Vec<String>,
}

impl TemplateMessage {
    pub fn new(template_name: impl Into<String>, language_code: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            language_code: language_code.into(),
            header: None,
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, header: HeaderParam) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_body(mut self, body: Vec<String>) -> Self {
        self.body = body;
        self
    }

    /// Builds a message for a directory entry, rejecting missing media or a
    /// variable count the template cannot take.
    pub fn for_template(
        template: &TemplateInfo,
        header: Option<HeaderParam>,
        body: Vec<String>,
    ) -> Result<Self> {
        match (template.header_kind.media_kind(), &header) {
            (Some(expected), None) => {
                return Err(DispatchError::validation(format!(
                    "template '{}' needs {} header media",
                    template.name,
                    expected.as_str()
                )));
            }
            (Some(expected), Some(param)) if param.kind != expected => {
                return Err(DispatchError::validation(format!(
                    "template '{}' needs {} header media, got {}",
                    template.name,
                    expected.as_str(),
                    param.kind.as_str()
                )));
            }
            (None, Some(_)) => {
                return Err(DispatchError::validation(format!(
                    "template '{}' has no media header",
                    template.name
                )));
            }
            _ => {}
        }

        if body.len() != template.body_variable_count {
            return Err(DispatchError::validation(format!(
                "template '{}' takes {} body variables, got {}",
                template.name,
                template.body_variable_count,
                body.len()
            )));
        }
        if let Some(position) = body.iter().position(|v| v.trim().is_empty()) {
            return Err(DispatchError::validation(format!(
                "body variable {{{{{}}}}} is empty",
                position + 1
            )));
        }

        Ok(Self {
            template_name: template.name.clone(),
            language_code: template.language.clone(),
            header,
            body,
        })
    }
}

/// One recipient paired with the shared message parameters.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub recipient: RecipientIdentifier,
    pub group: Arc<str>,
    pub message: Arc<TemplateMessage>,
}

impl DispatchTask {
    /// Flattens a batch into a work list. Duplicates across groups are dropped
    /// after the prefix is applied; the first occurrence keeps its group.
    pub fn flatten(
        batch: &RecipientBatch,
        message: Arc<TemplateMessage>,
        routing_prefix: Option<&str>,
    ) -> Result<Vec<DispatchTask>> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(batch.len());

        for group in batch.groups() {
            let label: Arc<str> = Arc::from(group.label.as_str());
            for recipient in &group.recipients {
                let recipient = match routing_prefix {
                    Some(prefix) => recipient.with_prefix(prefix).ok_or_else(|| {
                        DispatchError::validation(format!("invalid routing prefix '{}'", prefix))
                    })?,
                    None => recipient.clone(),
                };
                if !seen.insert(recipient.clone()) {
                    tracing::debug!(recipient = %recipient, group = %label, "Skipping duplicate recipient");
                    continue;
                }
                tasks.push(DispatchTask {
                    recipient,
                    group: label.clone(),
                    message: message.clone(),
                });
            }
        }

        Ok(tasks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    RateLimited,
    ServerError,
    Rejected,
    Unauthorized,
    Cancelled,
}

impl FailureKind {
    /// Failures that a later manual re-run of the same recipient may clear.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::RateLimited | Self::ServerError | Self::Cancelled
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Rejected => "rejected",
            Self::Unauthorized => "unauthorized",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    pub recipient: RecipientIdentifier,
    pub group: String,
    pub kind: FailureKind,
    pub detail: String,
    /// Attempts actually sent. Zero only for tasks cancelled before their first attempt.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success {
        recipient: RecipientIdentifier,
        group: String,
        provider_message_id: String,
        attempts: u32,
    },
    Failure(DispatchFailure),
}

impl DispatchOutcome {
    pub fn recipient(&self) -> &RecipientIdentifier {
        match self {
            Self::Success { recipient, .. } => recipient,
            Self::Failure(failure) => &failure.recipient,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } => *attempts,
            Self::Failure(failure) => failure.attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sent: {} | Failed: {} | Total: {}",
            self.succeeded, self.failed, self.total
        )
    }
}

/// Final accounting of one run. Failures are in completion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<DispatchFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchReport {
    pub fn recoverable_failures(&self) -> impl Iterator<Item = &DispatchFailure> {
        self.failures.iter().filter(|f| f.kind.is_recoverable())
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &DispatchFailure> {
        self.failures.iter().filter(|f| !f.kind.is_recoverable())
    }

    /// Recoverable failures regrouped by their source group, ready for a re-run.
    pub fn retry_candidates(&self) -> RecipientBatch {
        let mut grouped: Vec<(String, Vec<RecipientIdentifier>)> = Vec::new();
        for failure in self.recoverable_failures() {
            match grouped.iter_mut().find(|(label, _)| *label == failure.group) {
                Some((_, recipients)) => recipients.push(failure.recipient.clone()),
                None => grouped.push((failure.group.clone(), vec![failure.recipient.clone()])),
            }
        }

        let mut batch = RecipientBatch::new();
        for (label, recipients) in grouped {
            batch.push_group(label, recipients);
        }
        batch
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RecipientIdentifier {
        RecipientIdentifier::parse(s).unwrap()
    }

    fn image_template(vars: usize) -> TemplateInfo {
        TemplateInfo {
            name: "promo".into(),
            language: "en_US".into(),
            header_kind: HeaderKind::Image,
            body_variable_count: vars,
        }
    }

    #[test]
    fn test_recipient_identifier_rejects_non_digits() {
        assert!(RecipientIdentifier::parse("9876543210").is_some());
        assert!(RecipientIdentifier::parse("").is_none());
        assert!(RecipientIdentifier::parse("+9876543210").is_none());
        assert!(RecipientIdentifier::parse("98765 43210").is_none());
        assert_eq!(rid("9876543210").with_prefix("91").unwrap().as_str(), "919876543210");
        assert!(rid("1").with_prefix("+1").is_none());
    }

    #[test]
    fn test_batch_omits_empty_groups() {
        let mut batch = RecipientBatch::new();
        batch.push_group("Sheet1", vec![rid("1"), rid("2")]);
        batch.push_group("Empty", vec![]);
        assert_eq!(batch.groups().len(), 1);
        assert_eq!(batch.len(), 2);
        assert!(batch.get("Empty").is_none());
    }

    #[test]
    fn test_flatten_dedupes_across_groups_after_prefix() {
        let mut batch = RecipientBatch::new();
        batch.push_group("A", vec![rid("9876543210"), rid("1111111111")]);
        batch.push_group("B", vec![rid("919876543210"), rid("2222222222")]);
        let message = Arc::new(TemplateMessage::new("hello", "en"));

        let tasks = DispatchTask::flatten(&batch, message, Some("91")).unwrap();
        let recipients: Vec<&str> = tasks.iter().map(|t| t.recipient.as_str()).collect();
        assert_eq!(
            recipients,
            vec!["919876543210", "911111111111", "91919876543210", "912222222222"]
        );

        let unprefixed = {
            let mut b = RecipientBatch::new();
            b.push_group("A", vec![rid("5")]);
            b.push_group("B", vec![rid("5"), rid("6")]);
            b
        };
        let tasks = DispatchTask::flatten(
            &unprefixed,
            Arc::new(TemplateMessage::new("hello", "en")),
            None,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(&*tasks[0].group, "A");
        assert_eq!(&*tasks[1].group, "B");
    }

    #[test]
    fn test_for_template_requires_header_media() {
        let template = image_template(1);
        let err = TemplateMessage::for_template(&template, None, vec!["x".into()]).unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError { .. }));

        let video = HeaderParam {
            kind: MediaKind::Video,
            media_id: "m1".into(),
        };
        assert!(TemplateMessage::for_template(&template, Some(video), vec!["x".into()]).is_err());

        let image = HeaderParam {
            kind: MediaKind::Image,
            media_id: "m1".into(),
        };
        let message =
            TemplateMessage::for_template(&template, Some(image), vec!["Asha".into()]).unwrap();
        assert_eq!(message.language_code, "en_US");
    }

    #[test]
    fn test_for_template_checks_variable_count() {
        let template = TemplateInfo {
            header_kind: HeaderKind::None,
            ..image_template(2)
        };
        assert!(TemplateMessage::for_template(&template, None, vec!["a".into()]).is_err());
        assert!(
            TemplateMessage::for_template(&template, None, vec!["a".into(), " ".into()]).is_err()
        );
        assert!(
            TemplateMessage::for_template(&template, None, vec!["a".into(), "b".into()]).is_ok()
        );
    }

    #[test]
    fn test_media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("image/png").unwrap(), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("video/3gpp").unwrap(), MediaKind::Video);
        assert!(matches!(
            MediaKind::from_mime("image/gif"),
            Err(DispatchError::UnsupportedMediaType { .. })
        ));
    }

    #[test]
    fn test_retry_candidates_keep_recoverable_only() {
        let failure = |n: &str, group: &str, kind| DispatchFailure {
            recipient: rid(n),
            group: group.into(),
            kind,
            detail: String::new(),
            attempts: 1,
        };
        let now = Utc::now();
        let report = DispatchReport {
            total: 4,
            succeeded: 0,
            failed: 4,
            failures: vec![
                failure("1", "A", FailureKind::Transport),
                failure("2", "A", FailureKind::Rejected),
                failure("3", "B", FailureKind::RateLimited),
                failure("4", "A", FailureKind::Cancelled),
            ],
            started_at: now,
            finished_at: now,
        };

        let batch = report.retry_candidates();
        assert_eq!(batch.get("A").unwrap(), &[rid("1"), rid("4")]);
        assert_eq!(batch.get("B").unwrap(), &[rid("3")]);
        assert_eq!(report.permanent_failures().count(), 1);
    }
}
