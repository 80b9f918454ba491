use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    /// Argon2 PHC string. Never serialized.
    #[serde(skip)]
    pub password_hash: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub owner_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BugStatus {
    Open,
    Closed,
}

impl BugStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for BugStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid bug status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bug {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: BugStatus,
    pub priority: Priority,
    pub project_id: i64,
    pub reporter_id: i64,
    pub assignee_id: Option<i64>,
    pub resolution: String,
    pub resolved_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: String,
}

/// One immutable audit entry describing a resolution attempt for a bug.
/// Rows are only ever inserted; a deleted bug leaves its entries behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub id: i64,
    pub bug_id: i64,
    pub resolved_by: Option<i64>,
    pub resolution: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub read: bool,
    pub created_at: String,
}

/// Partial update for a bug. Absent fields are left unchanged; there is no
/// way to reset a field to null through this payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BugUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<BugStatus>,
    pub priority: Option<Priority>,
    pub assignee_id: Option<i64>,
    pub resolution: Option<String>,
    pub resolved_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BugUpdate {
    /// True when this update closes the bug with a non-empty resolution
    /// text, which is the condition for appending an audit entry.
    pub fn closes_with_resolution(&self) -> bool {
        self.status == Some(BugStatus::Closed)
            && self.resolution.as_deref().is_some_and(|r| !r.is_empty())
    }
}
