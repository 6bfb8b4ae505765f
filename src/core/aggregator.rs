use crate::domain::model::{DispatchFailure, DispatchOutcome, DispatchReport, ProgressSnapshot};
use crate::utils::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug)]
struct AggregatorState {
    snapshot: ProgressSnapshot,
    failures: Vec<DispatchFailure>,
}

/// Thread-safe tally of a run's outcomes.
///
/// Counts and the failure list sit behind one lock, so every snapshot
/// satisfies `succeeded + failed == completed <= total`.
#[derive(Debug)]
pub struct ResultAggregator {
    state: Mutex<AggregatorState>,
    progress: watch::Sender<ProgressSnapshot>,
    started_at: DateTime<Utc>,
}

impl ResultAggregator {
    pub fn new(total: usize) -> Self {
        let snapshot = ProgressSnapshot {
            total,
            ..ProgressSnapshot::default()
        };
        let (progress, _) = watch::channel(snapshot);
        Self {
            state: Mutex::new(AggregatorState {
                snapshot,
                failures: Vec::new(),
            }),
            progress,
            started_at: Utc::now(),
        }
    }

    /// Records one outcome. Recording past `total` is refused.
    pub fn record(&self, outcome: DispatchOutcome) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let snapshot = &mut state.snapshot;
        if snapshot.completed >= snapshot.total {
            return Err(DispatchError::validation(format!(
                "outcome for {} recorded after all {} outcomes were in",
                outcome.recipient(),
                snapshot.total
            )));
        }

        snapshot.completed += 1;
        match outcome {
            DispatchOutcome::Success { .. } => snapshot.succeeded += 1,
            DispatchOutcome::Failure(failure) => {
                snapshot.failed += 1;
                state.failures.push(failure);
            }
        }

        self.progress.send_replace(state.snapshot);
        Ok(())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().snapshot
    }

    /// Pushed progress: the receiver sees the latest snapshot after every `record`.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// Builds the report. Only valid once every expected outcome is recorded.
    pub fn finalize(&self) -> Result<DispatchReport> {
        let state = self.state.lock();
        let snapshot = state.snapshot;
        if !snapshot.is_complete() {
            return Err(DispatchError::IncompleteRun {
                completed: snapshot.completed,
                total: snapshot.total,
            });
        }

        Ok(DispatchReport {
            total: snapshot.total,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            failures: state.failures.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        })
    }
}
