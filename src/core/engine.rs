use crate::core::aggregator::ResultAggregator;
use crate::core::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::core::retry::RetryPolicy;
use crate::core::worker_pool::{DispatchWorkerPool, DispatchWorkers, DEFAULT_CONCURRENCY};
use crate::domain::model::{
    DispatchOutcome, DispatchReport, DispatchTask, HeaderParam, MediaKind, ProgressSnapshot,
    RecipientBatch, TemplateInfo, TemplateMessage,
};
use crate::domain::ports::MessagingApi;
use crate::utils::error::{DispatchError, Result};
use crate::utils::validation::{validate_digits, validate_non_empty_string};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    /// Cancel whatever has not started once this much time has passed.
    pub deadline: Option<Duration>,
    /// Digits prepended to every recipient, usually a country code.
    pub routing_prefix: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            deadline: None,
            routing_prefix: None,
        }
    }
}

/// Runs template sends for a recipient batch against one messaging account.
pub struct DispatchEngine<A: MessagingApi + ?Sized> {
    api: Arc<A>,
    settings: DispatchSettings,
    shared_limiter: Option<Arc<RateLimiter>>,
}

impl<A: MessagingApi + ?Sized + 'static> DispatchEngine<A> {
    pub fn new(api: Arc<A>, settings: DispatchSettings) -> Self {
        Self {
            api,
            settings,
            shared_limiter: None,
        }
    }

    /// Runs started by this engine draw from `limiter` instead of a fresh one,
    /// so back-to-back or parallel runs share one throughput ceiling.
    pub fn with_shared_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.shared_limiter = Some(limiter);
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Looks the template up among the account's approved templates.
    ///
    /// Credential failures surface as `AuthError` and abort before any send.
    pub async fn resolve_template(&self, name: &str) -> Result<TemplateInfo> {
        let directory = self.api.list_approved_templates().await?;
        if directory.is_empty() {
            return Err(DispatchError::validation(
                "the account has no approved templates",
            ));
        }

        directory.get(name).cloned().ok_or_else(|| {
            let available: Vec<&str> = directory.keys().map(String::as_str).collect();
            DispatchError::validation(format!(
                "template '{}' is not approved for this account (available: {})",
                name,
                available.join(", ")
            ))
        })
    }

    /// Uploads header media when the template has a media header.
    pub async fn prepare_header(
        &self,
        template: &TemplateInfo,
        media: Option<(Vec<u8>, String)>,
    ) -> Result<Option<HeaderParam>> {
        let mime_type = media.as_ref().map(|(_, mime)| mime.as_str());
        let Some(kind) = header_media_kind(template, mime_type)? else {
            return Ok(None);
        };
        let Some((bytes, mime_type)) = media else {
            return Ok(None);
        };

        let media_id = self.api.upload_media(bytes, &mime_type).await?;
        tracing::info!(media_id = %media_id, mime_type = %mime_type, "Uploaded header media");
        Ok(Some(HeaderParam { kind, media_id }))
    }

    /// Validates the request and flattens the batch into the work list a run would send.
    pub fn plan(
        &self,
        message: Arc<TemplateMessage>,
        recipients: &RecipientBatch,
    ) -> Result<Vec<DispatchTask>> {
        validate_non_empty_string("template_name", &message.template_name)?;
        validate_non_empty_string("language_code", &message.language_code)?;
        if let Some(prefix) = &self.settings.routing_prefix {
            validate_digits("routing_prefix", prefix)?;
        }

        let tasks = DispatchTask::flatten(
            recipients,
            message,
            self.settings.routing_prefix.as_deref(),
        )?;
        if tasks.is_empty() {
            return Err(DispatchError::validation("no valid recipients to send to"));
        }
        Ok(tasks)
    }

    /// Validates the request and starts sending. Must be called inside a tokio runtime.
    pub fn start(&self, message: TemplateMessage, recipients: &RecipientBatch) -> Result<DispatchRun> {
        let message = Arc::new(message);
        let tasks = self.plan(message.clone(), recipients)?;

        let limiter = self
            .shared_limiter
            .clone()
            .unwrap_or_else(|| Arc::new(RateLimiter::new(self.settings.rate_limit)));
        let cancel = CancellationToken::new();
        let aggregator = Arc::new(ResultAggregator::new(tasks.len()));

        tracing::info!(
            template = %message.template_name,
            language = %message.language_code,
            recipients = tasks.len(),
            groups = recipients.groups().len(),
            concurrency = self.settings.concurrency,
            permits = limiter.config().permits,
            window = ?limiter.config().window,
            "Starting dispatch"
        );

        let pool = DispatchWorkerPool::new(
            self.api.clone(),
            limiter,
            self.settings.retry,
            self.settings.concurrency,
            cancel.clone(),
        );
        let (outcomes, workers) = pool.spawn(tasks);
        let deadline = self
            .settings
            .deadline
            .map(|limit| spawn_deadline(limit, cancel.clone()));

        Ok(DispatchRun {
            outcomes,
            workers,
            aggregator,
            cancel,
            deadline,
        })
    }

    /// Starts a run and waits for its report.
    pub async fn dispatch(
        &self,
        message: TemplateMessage,
        recipients: &RecipientBatch,
    ) -> Result<DispatchReport> {
        self.start(message, recipients)?.finish().await
    }
}

/// Media kind the header needs, checked against the MIME type of the file on hand.
///
/// A media file for a template without a media header is ignored with a warning.
pub fn header_media_kind(template: &TemplateInfo, mime_type: Option<&str>) -> Result<Option<MediaKind>> {
    match (template.header_kind.media_kind(), mime_type) {
        (Some(expected), Some(mime_type)) => {
            let kind = MediaKind::from_mime(mime_type)?;
            if kind != expected {
                return Err(DispatchError::validation(format!(
                    "template '{}' needs {} header media, got {}",
                    template.name,
                    expected.as_str(),
                    mime_type
                )));
            }
            Ok(Some(kind))
        }
        (Some(expected), None) => Err(DispatchError::validation(format!(
            "template '{}' needs {} header media but none was provided",
            template.name,
            expected.as_str()
        ))),
        (None, Some(_)) => {
            tracing::warn!(template = %template.name, "Template has no media header, ignoring media file");
            Ok(None)
        }
        (None, None) => Ok(None),
    }
}

fn spawn_deadline(limit: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(?limit, "Dispatch deadline reached, cancelling unsent messages");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

/// A run in progress: a stream of outcomes feeding the aggregator.
pub struct DispatchRun {
    outcomes: mpsc::Receiver<DispatchOutcome>,
    workers: DispatchWorkers,
    aggregator: Arc<ResultAggregator>,
    cancel: CancellationToken,
    deadline: Option<JoinHandle<()>>,
}

impl DispatchRun {
    pub fn total(&self) -> usize {
        self.aggregator.snapshot().total
    }

    /// Next outcome in completion order, already recorded. `None` once all are in.
    pub async fn next_outcome(&mut self) -> Result<Option<DispatchOutcome>> {
        match self.outcomes.recv().await {
            Some(outcome) => {
                self.aggregator.record(outcome.clone())?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.aggregator.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.aggregator.subscribe()
    }

    /// Token that cancels this run; hand it to signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops new attempts. In-flight sends finish; unsent recipients come back as cancelled.
    pub fn cancel(&self) {
        tracing::warn!("Dispatch cancelled, no new attempts will start");
        self.cancel.cancel();
    }

    /// Drains the remaining outcomes and returns the final report.
    ///
    /// Recipients lost to a crashed worker are recorded as failures, so the
    /// report still accounts for every recipient.
    pub async fn finish(mut self) -> Result<DispatchReport> {
        while self.next_outcome().await?.is_some() {}

        let workers = std::mem::take(&mut self.workers);
        for failure in workers.join().await {
            self.aggregator.record(DispatchOutcome::Failure(failure))?;
        }

        let report = self.aggregator.finalize()?;
        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            recoverable = report.recoverable_failures().count(),
            elapsed_ms = report.elapsed().num_milliseconds(),
            "Dispatch finished"
        );
        Ok(report)
    }
}

impl Drop for DispatchRun {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}
