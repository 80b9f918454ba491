//! The bug resolution workflow: apply a partial update, conditionally append
//! an audit entry, then recompute and broadcast an analytics snapshot.
//!
//! Only the update itself can fail the request. The audit append and the
//! broadcast are best-effort: their failures are logged, swallowed, and
//! reported back as [`SideOutcome`]s so callers and tests can observe
//! degraded-but-successful states.

use chrono::Utc;
use tracing::warn;

use crate::analytics;
use crate::api::AppState;
use crate::errors::ApiError;
use crate::models::BugUpdate;
use crate::ws::{self, ServerEvent};

/// Fate of one best-effort step of the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum SideOutcome {
    Completed,
    /// The step's precondition didn't hold (e.g. the update doesn't close
    /// the bug with a resolution), so nothing was attempted.
    Skipped,
    Failed(String),
}

impl SideOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Outcome of a bug update whose primary mutation succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub audit: SideOutcome,
    pub broadcast: SideOutcome,
}

/// Apply `update` to the bug, append an audit entry when the update closes
/// the bug with a non-empty resolution, and broadcast a fresh analytics
/// snapshot to all connected clients.
///
/// The update applies unconditionally: no status-transition guard, and a
/// missing bug id succeeds vacuously (the audit entry is still appended
/// under that id — the store tolerates dangling references). Two concurrent
/// closes of the same bug each append their own entry.
pub async fn apply_bug_update(
    state: &AppState,
    bug_id: i64,
    update: BugUpdate,
    caller_id: i64,
) -> Result<UpdateReport, ApiError> {
    {
        let update = update.clone();
        state
            .db
            .call(move |db| db.update_bug(bug_id, &update))
            .await
            .map_err(ApiError::internal)?;
    }

    let audit = if update.closes_with_resolution() {
        let resolved_by = update.resolved_by.or(Some(caller_id));
        let text = update.resolution.clone().unwrap_or_default();
        let created_at = update.resolved_at.unwrap_or_else(Utc::now);
        match state
            .db
            .call(move |db| db.append_resolution(bug_id, resolved_by, &text, created_at))
            .await
        {
            Ok(_) => SideOutcome::Completed,
            Err(e) => {
                warn!("Failed to create resolution audit record: {}", e);
                SideOutcome::Failed(e.to_string())
            }
        }
    } else {
        SideOutcome::Skipped
    };

    // The snapshot refresh runs whether or not an audit entry was written.
    let broadcast = match analytics::push_snapshot(&state.db, caller_id).await {
        Ok(push) => {
            ws::broadcast_event(&state.ws_tx, &ServerEvent::Analysis(push));
            SideOutcome::Completed
        }
        Err(e) => {
            warn!("Failed to compute analytics snapshot: {}", e);
            SideOutcome::Failed(e.to_string())
        }
    };

    Ok(UpdateReport { audit, broadcast })
}
