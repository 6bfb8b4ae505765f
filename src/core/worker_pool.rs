use crate::core::rate_limiter::RateLimiter;
use crate::core::retry::{classify, Classification, RetryPolicy};
use crate::domain::model::{
    DispatchFailure, DispatchOutcome, DispatchTask, FailureKind, RecipientIdentifier,
};
use crate::domain::ports::MessagingApi;
use crate::utils::error::DispatchError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default worker count, matched to the default rate limit.
pub const DEFAULT_CONCURRENCY: usize = 80;

/// Shared queue plus the task each worker currently holds.
#[derive(Debug, Default)]
struct WorkQueue {
    pending: VecDeque<DispatchTask>,
    in_flight: Vec<Option<(RecipientIdentifier, Arc<str>)>>,
}

impl WorkQueue {
    fn take(&mut self, worker_id: usize) -> Option<DispatchTask> {
        let task = self.pending.pop_front()?;
        self.in_flight[worker_id] = Some((task.recipient.clone(), task.group.clone()));
        Some(task)
    }

    fn release(&mut self, worker_id: usize) {
        self.in_flight[worker_id] = None;
    }

    /// Tasks that will never produce an outcome because their worker is gone.
    fn orphaned(&mut self) -> Vec<DispatchFailure> {
        let in_flight = self
            .in_flight
            .iter_mut()
            .filter_map(Option::take)
            .map(|(recipient, group)| aborted(recipient, &group, "worker aborted mid-send"));
        let pending = self
            .pending
            .drain(..)
            .map(|task| aborted(task.recipient, &task.group, "worker aborted before send"));
        in_flight.chain(pending).collect()
    }
}

struct WorkerContext<A: ?Sized> {
    api: Arc<A>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    queue: Arc<Mutex<WorkQueue>>,
}

/// Handle on a pool's running workers.
#[derive(Default)]
pub struct DispatchWorkers {
    set: JoinSet<()>,
    queue: Arc<Mutex<WorkQueue>>,
}

impl DispatchWorkers {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for every worker to end. Tasks held or left queued by a worker
    /// that panicked come back as `Transport` failures.
    pub async fn join(mut self) -> Vec<DispatchFailure> {
        while let Some(joined) = self.set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch worker ended abnormally");
            }
        }

        let orphaned = self.queue.lock().orphaned();
        if !orphaned.is_empty() {
            tracing::error!(count = orphaned.len(), "Recipients lost by aborted workers");
        }
        orphaned
    }
}

/// Bounded-concurrency executor: one outcome per task, streamed as each finishes.
pub struct DispatchWorkerPool<A: MessagingApi + ?Sized> {
    api: Arc<A>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    concurrency: usize,
    cancel: CancellationToken,
}

impl<A: MessagingApi + ?Sized + 'static> DispatchWorkerPool<A> {
    pub fn new(
        api: Arc<A>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            limiter,
            policy,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Starts the workers. The receiver closes once every task has produced its
    /// outcome; tasks never started because of cancellation come out as
    /// `Cancelled` failures.
    pub fn spawn(self, tasks: Vec<DispatchTask>) -> (mpsc::Receiver<DispatchOutcome>, DispatchWorkers) {
        let worker_count = self.concurrency.min(tasks.len());
        let (outcome_tx, outcome_rx) = mpsc::channel(self.concurrency * 2);
        let queue = Arc::new(Mutex::new(WorkQueue {
            pending: tasks.into(),
            in_flight: vec![None; worker_count],
        }));
        let ctx = Arc::new(WorkerContext {
            api: self.api,
            limiter: self.limiter,
            policy: self.policy,
            cancel: self.cancel,
            queue: queue.clone(),
        });

        let mut set = JoinSet::new();
        for worker_id in 0..worker_count {
            set.spawn(worker_loop(worker_id, ctx.clone(), outcome_tx.clone()));
        }
        tracing::debug!(workers = worker_count, "Dispatch workers started");

        (outcome_rx, DispatchWorkers { set, queue })
    }
}

async fn worker_loop<A: MessagingApi + ?Sized>(
    worker_id: usize,
    ctx: Arc<WorkerContext<A>>,
    outcomes: mpsc::Sender<DispatchOutcome>,
) {
    loop {
        let next = ctx.queue.lock().take(worker_id);
        let Some(task) = next else {
            break;
        };

        let outcome = execute_task(&ctx, task).await;
        ctx.queue.lock().release(worker_id);
        if outcomes.send(outcome).await.is_err() {
            tracing::warn!(worker_id, "Outcome receiver dropped, worker stopping");
            break;
        }
    }
}

async fn execute_task<A: MessagingApi + ?Sized>(
    ctx: &WorkerContext<A>,
    task: DispatchTask,
) -> DispatchOutcome {
    let mut attempts = 0u32;
    let mut last_failure: Option<(FailureKind, String)> = None;

    loop {
        if attempts > 0 {
            let delay = ctx.policy.backoff_for(attempts);
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return cancelled(task, attempts, last_failure),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return cancelled(task, attempts, last_failure),
            _ = ctx.limiter.acquire() => {}
        }

        attempts += 1;
        let result = match tokio::time::timeout(
            ctx.policy.attempt_timeout,
            ctx.api.send_template_message(&task.recipient, &task.message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::transport(format!(
                "attempt timed out after {:?}",
                ctx.policy.attempt_timeout
            ))),
        };

        match classify(&result) {
            Classification::Accepted { message_id } => {
                tracing::debug!(
                    recipient = %task.recipient,
                    group = %task.group,
                    attempt = attempts,
                    message_id = %message_id,
                    "Message accepted"
                );
                return DispatchOutcome::Success {
                    recipient: task.recipient,
                    group: task.group.to_string(),
                    provider_message_id: message_id,
                    attempts,
                };
            }
            Classification::Retryable { kind, detail } if attempts < ctx.policy.max_attempts() => {
                tracing::warn!(
                    recipient = %task.recipient,
                    attempt = attempts,
                    %kind,
                    error = %detail,
                    "Retryable send failure"
                );
                last_failure = Some((kind, detail));
            }
            Classification::Retryable { kind, detail } => {
                let detail = format!("{} (gave up after {} attempts)", detail, attempts);
                return failed(task, kind, detail, attempts);
            }
            Classification::Terminal { kind, detail } => {
                return failed(task, kind, detail, attempts);
            }
        }
    }
}

fn failed(task: DispatchTask, kind: FailureKind, detail: String, attempts: u32) -> DispatchOutcome {
    tracing::error!(
        recipient = %task.recipient,
        group = %task.group,
        attempts,
        %kind,
        error = %detail,
        "Send failed"
    );
    DispatchOutcome::Failure(DispatchFailure {
        recipient: task.recipient,
        group: task.group.to_string(),
        kind,
        detail,
        attempts,
    })
}

fn aborted(recipient: RecipientIdentifier, group: &str, detail: &str) -> DispatchFailure {
    DispatchFailure {
        recipient,
        group: group.to_string(),
        kind: FailureKind::Transport,
        detail: detail.to_string(),
        attempts: 0,
    }
}

fn cancelled(
    task: DispatchTask,
    attempts: u32,
    last_failure: Option<(FailureKind, String)>,
) -> DispatchOutcome {
    let detail = match last_failure {
        Some((kind, detail)) => format!(
            "cancelled after {} attempts; last error ({}): {}",
            attempts, kind, detail
        ),
        None => "cancelled before first attempt".to_string(),
    };
    DispatchOutcome::Failure(DispatchFailure {
        recipient: task.recipient,
        group: task.group.to_string(),
        kind: FailureKind::Cancelled,
        detail,
        attempts,
    })
}
