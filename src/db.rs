use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, params};

use crate::analytics::{PriorityCounts, TopSolver};
use crate::models::*;

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct TrackerDb {
    conn: Connection,
}

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    // Cross-entity references deliberately carry no REFERENCES clauses:
    // deleting a bug must leave its resolutions behind, and updates against
    // missing ids must succeed vacuously.
    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'user',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    owner_id INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS bugs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'open',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    project_id INTEGER NOT NULL,
                    reporter_id INTEGER NOT NULL,
                    assignee_id INTEGER,
                    resolution TEXT NOT NULL DEFAULT '',
                    resolved_by INTEGER,
                    resolved_at INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS resolutions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    bug_id INTEGER NOT NULL,
                    resolved_by INTEGER,
                    resolution TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    message TEXT NOT NULL,
                    read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
                CREATE INDEX IF NOT EXISTS idx_bugs_project ON bugs(project_id);
                CREATE INDEX IF NOT EXISTS idx_bugs_priority ON bugs(priority);
                CREATE INDEX IF NOT EXISTS idx_resolutions_bug ON resolutions(bug_id);
                CREATE INDEX IF NOT EXISTS idx_resolutions_solver ON resolutions(resolved_by);
                CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, email: &str, password_hash: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (name, email, password_hash) VALUES (?1, ?2, ?3)",
                params![name, email, password_hash],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, email, password_hash, role, created_at FROM users WHERE id = ?1",
            )
            .context("Failed to prepare get_user")?;
        let mut rows = stmt
            .query_map(params![id], user_from_row)
            .context("Failed to query user")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read user row")?)),
            None => Ok(None),
        }
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, email, password_hash, role, created_at FROM users WHERE email = ?1",
            )
            .context("Failed to prepare find_user_by_email")?;
        let mut rows = stmt
            .query_map(params![email], user_from_row)
            .context("Failed to query user by email")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read user row")?)),
            None => Ok(None),
        }
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, email, password_hash, role, created_at FROM users ORDER BY id")
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map([], user_from_row)
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?);
        }
        Ok(users)
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, description: &str, owner_id: i64) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, description, owner_id) VALUES (?1, ?2, ?3)",
                params![name, description, owner_id],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, owner_id, created_at FROM projects WHERE id = ?1",
            )
            .context("Failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], project_from_row)
            .context("Failed to query project")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read project row")?)),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, owner_id, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    // ── Bugs ──────────────────────────────────────────────────────────

    pub fn create_bug(
        &self,
        title: &str,
        description: &str,
        priority: &Priority,
        project_id: i64,
        reporter_id: i64,
        assignee_id: Option<i64>,
    ) -> Result<Bug> {
        self.conn
            .execute(
                "INSERT INTO bugs (title, description, priority, project_id, reporter_id, assignee_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    title,
                    description,
                    priority.as_str(),
                    project_id,
                    reporter_id,
                    assignee_id
                ],
            )
            .context("Failed to insert bug")?;
        let id = self.conn.last_insert_rowid();
        self.get_bug(id)?.context("Bug not found after insert")
    }

    pub fn get_bug(&self, id: i64) -> Result<Option<Bug>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, description, status, priority, project_id, reporter_id,
                        assignee_id, resolution, resolved_by, resolved_at, created_at
                 FROM bugs WHERE id = ?1",
            )
            .context("Failed to prepare get_bug")?;
        let mut rows = stmt
            .query_map(params![id], bug_row_from_row)
            .context("Failed to query bug")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read bug row")?;
                Ok(Some(r.into_bug()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_bugs(&self) -> Result<Vec<Bug>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, description, status, priority, project_id, reporter_id,
                        assignee_id, resolution, resolved_by, resolved_at, created_at
                 FROM bugs ORDER BY id",
            )
            .context("Failed to prepare list_bugs")?;
        let rows = stmt
            .query_map([], bug_row_from_row)
            .context("Failed to query bugs")?;
        let mut bugs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read bug row")?;
            bugs.push(r.into_bug()?);
        }
        Ok(bugs)
    }

    /// Apply a partial update. Fields absent from the update are untouched;
    /// a missing id is a vacuous success. No status-transition guard.
    pub fn update_bug(&self, id: i64, update: &BugUpdate) -> Result<()> {
        // Use unchecked_transaction so all field updates are atomic.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(ref t) = update.title {
            tx.execute("UPDATE bugs SET title = ?1 WHERE id = ?2", params![t, id])
                .context("Failed to update bug title")?;
        }
        if let Some(ref d) = update.description {
            tx.execute(
                "UPDATE bugs SET description = ?1 WHERE id = ?2",
                params![d, id],
            )
            .context("Failed to update bug description")?;
        }
        if let Some(ref s) = update.status {
            tx.execute(
                "UPDATE bugs SET status = ?1 WHERE id = ?2",
                params![s.as_str(), id],
            )
            .context("Failed to update bug status")?;
        }
        if let Some(ref p) = update.priority {
            tx.execute(
                "UPDATE bugs SET priority = ?1 WHERE id = ?2",
                params![p.as_str(), id],
            )
            .context("Failed to update bug priority")?;
        }
        if let Some(a) = update.assignee_id {
            tx.execute(
                "UPDATE bugs SET assignee_id = ?1 WHERE id = ?2",
                params![a, id],
            )
            .context("Failed to update bug assignee")?;
        }
        if let Some(ref r) = update.resolution {
            tx.execute(
                "UPDATE bugs SET resolution = ?1 WHERE id = ?2",
                params![r, id],
            )
            .context("Failed to update bug resolution")?;
        }
        if let Some(u) = update.resolved_by {
            tx.execute(
                "UPDATE bugs SET resolved_by = ?1 WHERE id = ?2",
                params![u, id],
            )
            .context("Failed to update bug resolved_by")?;
        }
        if let Some(at) = update.resolved_at {
            tx.execute(
                "UPDATE bugs SET resolved_at = ?1 WHERE id = ?2",
                params![at.timestamp_millis(), id],
            )
            .context("Failed to update bug resolved_at")?;
        }

        tx.commit().context("Failed to commit bug update")?;
        Ok(())
    }

    /// Delete a bug. Resolutions for it are intentionally left behind.
    pub fn delete_bug(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM bugs WHERE id = ?1", params![id])
            .context("Failed to delete bug")?;
        Ok(count > 0)
    }

    // ── Resolution audit log ──────────────────────────────────────────

    /// Append one audit entry. Entries are never updated or deleted.
    pub fn append_resolution(
        &self,
        bug_id: i64,
        resolved_by: Option<i64>,
        resolution: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Resolution> {
        self.conn
            .execute(
                "INSERT INTO resolutions (bug_id, resolved_by, resolution, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bug_id, resolved_by, resolution, created_at.timestamp_millis()],
            )
            .context("Failed to insert resolution")?;
        let id = self.conn.last_insert_rowid();
        Ok(Resolution {
            id,
            bug_id,
            resolved_by,
            resolution: resolution.to_string(),
            created_at,
        })
    }

    /// Audit history for one bug, most recent first.
    pub fn list_resolutions(&self, bug_id: i64) -> Result<Vec<Resolution>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, bug_id, resolved_by, resolution, created_at
                 FROM resolutions WHERE bug_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .context("Failed to prepare list_resolutions")?;
        let rows = stmt
            .query_map(params![bug_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("Failed to query resolutions")?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, bug_id, resolved_by, resolution, created_ms) =
                row.context("Failed to read resolution row")?;
            entries.push(Resolution {
                id,
                bug_id,
                resolved_by,
                resolution,
                created_at: millis_to_datetime(created_ms)?,
            });
        }
        Ok(entries)
    }

    // ── Aggregates ────────────────────────────────────────────────────

    pub fn count_resolutions(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM resolutions", [], |row| row.get(0))
            .context("Failed to count resolutions")
    }

    pub fn count_resolutions_by(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM resolutions WHERE resolved_by = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count resolutions by user")
    }

    /// Average of `bug.resolved_at - resolution.created_at` in milliseconds,
    /// over resolutions whose bug has a non-null `resolved_at`. The
    /// difference is taken as supplied and may be negative; zero eligible
    /// rows yield 0.
    pub fn avg_resolution_ms(&self) -> Result<i64> {
        let avg: Option<f64> = self
            .conn
            .query_row(
                "SELECT AVG(b.resolved_at - r.created_at)
                 FROM resolutions r
                 JOIN bugs b ON b.id = r.bug_id
                 WHERE b.resolved_at IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .context("Failed to compute average resolution time")?;
        Ok(avg.map(|v| v.round() as i64).unwrap_or(0))
    }

    /// Leaderboard of resolvers by audit-entry count, descending. A dangling
    /// user reference falls back to the raw identifier; a null reference
    /// displays as "Unknown".
    pub fn top_solvers(&self, limit: i64) -> Result<Vec<TopSolver>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.resolved_by, u.name, COUNT(*) AS cnt
                 FROM resolutions r
                 LEFT JOIN users u ON u.id = r.resolved_by
                 GROUP BY r.resolved_by
                 ORDER BY cnt DESC, r.resolved_by ASC
                 LIMIT ?1",
            )
            .context("Failed to prepare top_solvers")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("Failed to query top solvers")?;
        let mut solvers = Vec::new();
        for row in rows {
            let (resolved_by, name, count) = row.context("Failed to read solver row")?;
            let name = match (name, resolved_by) {
                (Some(name), _) => name,
                (None, Some(id)) => id.to_string(),
                (None, None) => "Unknown".to_string(),
            };
            solvers.push(TopSolver { name, count });
        }
        Ok(solvers)
    }

    /// Histogram over current bugs regardless of status; sums to the total
    /// bug count.
    pub fn priority_counts(&self) -> Result<PriorityCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT priority, COUNT(*) FROM bugs GROUP BY priority")
            .context("Failed to prepare priority_counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query priority counts")?;
        let mut counts = PriorityCounts::default();
        for row in rows {
            let (priority, count) = row.context("Failed to read priority row")?;
            match priority.as_str() {
                "high" => counts.high = count,
                "medium" => counts.medium = count,
                "low" => counts.low = count,
                other => anyhow::bail!("invalid priority in database: '{}'", other),
            }
        }
        Ok(counts)
    }

    pub fn count_bugs(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM bugs", [], |row| row.get(0))
            .context("Failed to count bugs")
    }

    pub fn count_bugs_with_status(&self, status: &BugStatus) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM bugs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count bugs by status")
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(&self, user_id: i64, message: &str) -> Result<Notification> {
        self.conn
            .execute(
                "INSERT INTO notifications (user_id, message) VALUES (?1, ?2)",
                params![user_id, message],
            )
            .context("Failed to insert notification")?;
        let id = self.conn.last_insert_rowid();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, message, read, created_at FROM notifications WHERE id = ?1",
            )
            .context("Failed to prepare notification readback")?;
        let mut rows = stmt
            .query_map(params![id], notification_from_row)
            .context("Failed to query notification")?;
        match rows.next() {
            Some(row) => row.context("Failed to read notification row"),
            None => anyhow::bail!("Notification not found after insert"),
        }
    }

    pub fn list_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, message, read, created_at
                 FROM notifications WHERE user_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_notifications")?;
        let rows = stmt
            .query_map(params![user_id], notification_from_row)
            .context("Failed to query notifications")?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.context("Failed to read notification row")?);
        }
        Ok(notes)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message: row.get(2)?,
        read: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Intermediate row struct for reading bugs from SQLite before converting
/// status / priority strings and the resolved_at millisecond stamp into
/// typed values.
struct BugRow {
    id: i64,
    title: String,
    description: String,
    status: String,
    priority: String,
    project_id: i64,
    reporter_id: i64,
    assignee_id: Option<i64>,
    resolution: String,
    resolved_by: Option<i64>,
    resolved_at: Option<i64>,
    created_at: String,
}

fn bug_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BugRow> {
    Ok(BugRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        project_id: row.get(5)?,
        reporter_id: row.get(6)?,
        assignee_id: row.get(7)?,
        resolution: row.get(8)?,
        resolved_by: row.get(9)?,
        resolved_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl BugRow {
    fn into_bug(self) -> Result<Bug> {
        let status = BugStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse bug status")?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse bug priority")?;
        let resolved_at = match self.resolved_at {
            Some(ms) => Some(millis_to_datetime(ms)?),
            None => None,
        };
        Ok(Bug {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority,
            project_id: self.project_id,
            reporter_id: self.reporter_id,
            assignee_id: self.assignee_id,
            resolution: self.resolution,
            resolved_by: self.resolved_by,
            resolved_at,
            created_at: self.created_at,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Timestamp out of range: {}", ms))
}

// ── Tests ─────────────────────────────────────────────────────────────
