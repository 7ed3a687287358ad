//! Single-object delete with finalizer escalation.
//!
//! ```text
//! absent ──────────────────────────────────────────────► Deleted
//! present ─► clear finalizers ─► delete ─► wait(primary) ─► Deleted
//!                                              │ timeout
//!                                              ▼
//!            clear finalizers ─► delete ─► wait(secondary) ─► Deleted (escalated)
//!                                              │ timeout
//!                                              ▼
//!                                     Failed(current state)
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::retry::retry_transient;
use super::TeardownEngine;
use crate::report::DeletionOutcome;
use crate::resource::ResourceRef;

/// Terminal result of [`TeardownEngine::delete_with_escalation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAttempt {
    pub outcome: DeletionOutcome,
    /// Whether the finalizer-clear + re-delete cycle ran.
    pub escalated: bool,
}

impl DeleteAttempt {
    fn done(outcome: DeletionOutcome, escalated: bool) -> Self {
        Self { outcome, escalated }
    }
}

enum DeleteRequest {
    Accepted,
    AlreadyGone,
}

impl TeardownEngine {
    /// Delete one object, escalating to finalizer removal once if it outlives
    /// `primary`. Never returns an error: failures become
    /// [`DeletionOutcome::Failed`] so the caller can continue with its plan.
    pub async fn delete_with_escalation(
        &self,
        target: &ResourceRef,
        primary: Duration,
    ) -> DeleteAttempt {
        match self.cluster.get(target).await {
            Ok(None) => {
                debug!(resource = %target, "Already absent");
                return DeleteAttempt::done(DeletionOutcome::Deleted, false);
            }
            Err(err) if err.is_not_found() => {
                return DeleteAttempt::done(DeletionOutcome::Deleted, false);
            }
            Ok(Some(_)) => {}
            Err(err) => {
                warn!(resource = %target, error = %err, "Existence unknown, treating as present");
            }
        }

        let timeouts = &self.config.timeouts;
        let poll = timeouts.poll_interval();

        info!(resource = %target, timeout_secs = primary.as_secs(), "Deleting");
        let deadline = Instant::now() + primary;
        self.strip_finalizers(target, deadline).await;
        match self.request_delete(target, deadline).await {
            Ok(DeleteRequest::AlreadyGone) => {
                return DeleteAttempt::done(DeletionOutcome::NotFound, false);
            }
            Ok(DeleteRequest::Accepted) => {}
            Err(reason) => {
                error!(resource = %target, reason = %reason, "Delete request failed");
                return DeleteAttempt::done(DeletionOutcome::Failed(reason), false);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = self.cluster.wait_for_absence(target, remaining, poll);
        match self.until_cancelled(wait).await {
            Some(true) => {
                info!(resource = %target, "Deleted");
                return DeleteAttempt::done(DeletionOutcome::Deleted, false);
            }
            Some(false) if !self.is_cancelled() => {}
            _ => {
                if let Ok(None) = self.cluster.get(target).await {
                    return DeleteAttempt::done(DeletionOutcome::Deleted, false);
                }
                warn!(resource = %target, "Still present and run cancelled, not escalating");
                return DeleteAttempt::done(DeletionOutcome::TimedOut, false);
            }
        }

        let secondary = timeouts.secondary();
        warn!(
            resource = %target,
            timeout_secs = primary.as_secs(),
            "Still present after primary timeout, removing finalizers and retrying"
        );
        let deadline = Instant::now() + secondary;
        self.strip_finalizers(target, deadline).await;
        if let Err(reason) = self.request_delete(target, deadline).await {
            error!(resource = %target, reason = %reason, "Forced delete request failed");
            return DeleteAttempt::done(DeletionOutcome::Failed(reason), true);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.cluster.wait_for_absence(target, remaining, poll).await {
            info!(resource = %target, "Deleted after removing finalizers");
            return DeleteAttempt::done(DeletionOutcome::Deleted, true);
        }

        let state = self.describe(target).await;
        error!(resource = %target, state = %state, "Still present after forced deletion");
        DeleteAttempt::done(
            DeletionOutcome::Failed(format!(
                "still present {}s after removing finalizers ({state})",
                secondary.as_secs()
            )),
            true,
        )
    }

    /// Best-effort finalizer removal; a missing object is not an error.
    pub(super) async fn strip_finalizers(&self, target: &ResourceRef, deadline: Instant) {
        let result = retry_transient("clear finalizers", deadline, || {
            self.cluster.clear_finalizers(target)
        })
        .await;

        match result {
            Ok(()) => debug!(resource = %target, "Finalizers cleared"),
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(resource = %target, error = %err, "Failed to clear finalizers"),
        }
    }

    async fn request_delete(
        &self,
        target: &ResourceRef,
        deadline: Instant,
    ) -> Result<DeleteRequest, String> {
        match retry_transient("delete", deadline, || self.cluster.delete(target)).await {
            Ok(()) => Ok(DeleteRequest::Accepted),
            Err(err) if err.is_not_found() => Ok(DeleteRequest::AlreadyGone),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Current state of an object, for diagnostics.
    async fn describe(&self, target: &ResourceRef) -> String {
        match self.cluster.get(target).await {
            Ok(Some(state)) => state.to_string(),
            Ok(None) => "absent".to_string(),
            Err(err) => format!("state unknown: {err}"),
        }
    }
}
