//! Derived statistics over the store: totals, average resolution latency,
//! solver leaderboard, and the priority histogram.
//!
//! Field names serialize in camelCase because connected clients key off the
//! exact `totalResolved` / `avgResolutionMs` / `topSolvers` /
//! `priorityCounts` names.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;

/// How many leaderboard entries a snapshot carries.
const TOP_SOLVER_LIMIT: i64 = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopSolver {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PriorityCounts {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

/// Pull-variant snapshot returned from `GET /api/analytics/summary`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total_resolved: i64,
    pub total_resolved_by: i64,
    pub avg_resolution_ms: i64,
    pub top_solvers: Vec<TopSolver>,
    pub priority_counts: PriorityCounts,
}

/// Push-variant snapshot broadcast to every connected client after a bug
/// update. `solved` is always 1: each broadcast describes a single
/// resolution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPush {
    pub solved: u32,
    #[serde(flatten)]
    pub summary: AnalyticsSummary,
    pub resolved_by_user_id: i64,
    pub timestamp: i64,
}

/// Compute the aggregate snapshot for the requesting identity. Every
/// underlying query tolerates zero rows, so an empty store yields all-zero
/// defaults rather than an error.
pub async fn summary(db: &DbHandle, user_id: i64) -> Result<AnalyticsSummary> {
    db.call(move |db| {
        Ok(AnalyticsSummary {
            total_resolved: db.count_resolutions()?,
            total_resolved_by: db.count_resolutions_by(user_id)?,
            avg_resolution_ms: db.avg_resolution_ms()?,
            top_solvers: db.top_solvers(TOP_SOLVER_LIMIT)?,
            priority_counts: db.priority_counts()?,
        })
    })
    .await
}

/// Compute the push-variant payload for a single resolution event performed
/// by `user_id`.
pub async fn push_snapshot(db: &DbHandle, user_id: i64) -> Result<AnalyticsPush> {
    let summary = summary(db, user_id).await?;
    Ok(AnalyticsPush {
        solved: 1,
        summary,
        resolved_by_user_id: user_id,
        timestamp: Utc::now().timestamp_millis(),
    })
}
