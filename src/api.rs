use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::analytics::{self, PriorityCounts};
use crate::auth::{self, AuthUser, JwtKeys};
use crate::db::{DbHandle, TrackerDb};
use crate::errors::ApiError;
use crate::models::{Bug, BugStatus, BugUpdate, Priority, User};
use crate::workflow;
use crate::ws::{ServerEvent, UserRegistry};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    /// Unscoped fanout of serialized events to every connected socket.
    pub ws_tx: broadcast::Sender<String>,
    /// Targeted delivery groups keyed by user id.
    pub registry: Arc<UserRegistry>,
    pub jwt: JwtKeys,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: TrackerDb, jwt_secret: &[u8]) -> SharedState {
        let (ws_tx, _rx) = broadcast::channel::<String>(256);
        Arc::new(Self {
            db: DbHandle::new(db),
            ws_tx,
            registry: Arc::new(UserRegistry::new()),
            jwt: JwtKeys::new(jwt_secret),
        })
    }

    #[cfg(test)]
    pub fn for_tests(db: TrackerDb) -> SharedState {
        Self::new(db, b"test-secret")
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateBugRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub project_id: i64,
    pub assignee_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct AppendResolutionRequest {
    pub resolution: String,
    pub resolved_by: Option<i64>,
}

// ── Response types ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total: i64,
    pub open: i64,
    pub closed: i64,
    pub by_priority: PriorityCounts,
}

fn success() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true }))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/users", get(list_users))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/bugs", get(list_bugs).post(create_bug))
        .route("/api/bugs/{id}", put(update_bug).delete(delete_bug))
        .route(
            "/api/bugs/{id}/resolutions",
            get(list_bug_resolutions).post(append_resolution),
        )
        .route("/api/analytics/summary", get(analytics_summary))
        .route("/api/reports/summary", get(reports_summary))
        .route("/api/notifications", get(list_notifications))
        .route("/health", get(health_check))
}

// ── Auth handlers ─────────────────────────────────────────────────────

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.clone();
    let exists = state
        .db
        .call(move |db| db.find_user_by_email(&email))
        .await
        .map_err(ApiError::internal)?;
    if exists.is_some() {
        return Err(ApiError::EmailTaken);
    }

    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    let (name, email) = (req.name, req.email);
    let user = state
        .db
        .call(move |db| db.create_user(&name, &email, &hash))
        .await
        .map_err(ApiError::internal)?;

    let token = state.jwt.issue(&user).map_err(ApiError::internal)?;
    Ok(Json(AuthResponse { user, token }))
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email;
    let user = state
        .db
        .call(move |db| db.find_user_by_email(&email))
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::BadCredentials)?;

    let password = req.password;
    let hash = user.password_hash.clone();
    let ok = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(ApiError::internal)?;
    if !ok {
        return Err(ApiError::BadCredentials);
    }

    let token = state.jwt.issue(&user).map_err(ApiError::internal)?;
    Ok(Json(AuthResponse { user, token }))
}

// ── User handlers ─────────────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    _user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .db
        .call(|db| db.list_users())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(users))
}

// ── Project handlers ──────────────────────────────────────────────────

async fn create_project(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name;
    let description = req.description.unwrap_or_default();
    let owner_id = user.id;
    let project = state
        .db
        .call(move |db| db.create_project(&name, &description, owner_id))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(project))
}

async fn list_projects(
    State(state): State<SharedState>,
    _user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(projects))
}

// ── Bug handlers ──────────────────────────────────────────────────────

async fn create_bug(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<CreateBugRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title;
    let description = req.description.unwrap_or_default();
    let priority = req.priority.unwrap_or(Priority::Medium);
    let (project_id, reporter_id, assignee_id) = (req.project_id, user.id, req.assignee_id);

    let bug: Bug = {
        let title = title.clone();
        state
            .db
            .call(move |db| {
                db.create_bug(
                    &title,
                    &description,
                    &priority,
                    project_id,
                    reporter_id,
                    assignee_id,
                )
            })
            .await
            .map_err(ApiError::internal)?
    };

    // Notification fanout: persist a row for the assignee and push an
    // ephemeral event to their identified connections.
    if let Some(assignee_id) = assignee_id {
        let message = format!("You were assigned bug: {}", title);
        state
            .db
            .call(move |db| db.create_notification(assignee_id, &message))
            .await
            .map_err(ApiError::internal)?;

        state.registry.notify_user(
            assignee_id,
            &ServerEvent::Notification {
                message: format!("New bug assigned: {}", title),
            },
        );
    }

    Ok(Json(bug))
}

async fn list_bugs(
    State(state): State<SharedState>,
    _user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let bugs = state
        .db
        .call(|db| db.list_bugs())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(bugs))
}

async fn update_bug(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(update): Json<BugUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let report = workflow::apply_bug_update(&state, id, update, user.id).await?;
    if let workflow::SideOutcome::Failed(ref reason) = report.audit {
        tracing::warn!(bug_id = id, "Audit entry lost for bug update: {}", reason);
    }
    // The caller re-fetches the bug if it needs the new state.
    Ok(success())
}

async fn delete_bug(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    // Vacuous success for missing ids; resolutions for the bug remain.
    state
        .db
        .call(move |db| db.delete_bug(id))
        .await
        .map_err(ApiError::internal)?;
    Ok(success())
}

// ── Resolution audit handlers ─────────────────────────────────────────

async fn append_resolution(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<AppendResolutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved_by = req.resolved_by.or(Some(user.id));
    let text = req.resolution;
    let entry = state
        .db
        .call(move |db| db.append_resolution(id, resolved_by, &text, chrono::Utc::now()))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(entry))
}

async fn list_bug_resolutions(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .db
        .call(move |db| db.list_resolutions(id))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(entries))
}

// ── Analytics & report handlers ───────────────────────────────────────

async fn analytics_summary(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = analytics::summary(&state.db, user.id)
        .await
        .map_err(|_| ApiError::AnalyticsFailed)?;
    Ok(Json(snapshot))
}

async fn reports_summary(
    State(state): State<SharedState>,
    _user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .db
        .call(|db| {
            Ok(ReportSummary {
                total: db.count_bugs()?,
                open: db.count_bugs_with_status(&BugStatus::Open)?,
                closed: db.count_bugs_with_status(&BugStatus::Closed)?,
                by_priority: db.priority_counts()?,
            })
        })
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(summary))
}

// ── Notification handlers ─────────────────────────────────────────────

async fn list_notifications(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id;
    let notes = state
        .db
        .call(move |db| db.list_notifications(user_id))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(notes))
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> (Router, SharedState) {
        let state = AppState::for_tests(TrackerDb::new_in_memory().unwrap());
        let app = api_router().with_state(state.clone());
        (app, state)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, body_json(response.into_body()).await)
    }

    async fn send_get(
        app: &Router,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, body_json(response.into_body()).await)
    }

    /// Register a user and return (token, user_id).
    async fn register_user(app: &Router, name: &str) -> (String, i64) {
        let (status, body) = send_json(
            app,
            "POST",
            "/api/auth/register",
            None,
            serde_json::json!({
                "name": name,
                "email": format!("{}@example.com", name),
                "password": "hunter2",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (
            body["token"].as_str().unwrap().to_string(),
            body["user"]["id"].as_i64().unwrap(),
        )
    }

    // 1. Health check
    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    // 2. Register returns the user and a token, hiding the hash
    #[tokio::test]
    async fn test_register() {
        let (app, _) = test_app();
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/auth/register",
            None,
            serde_json::json!({
                "name": "Ada",
                "email": "ada@example.com",
                "password": "hunter2",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Ada");
        assert!(body["token"].as_str().unwrap().contains('.'));
        assert!(body["user"].get("password_hash").is_none());
    }

    // 3. Duplicate email rejected in-band
    #[tokio::test]
    async fn test_register_duplicate_email() {
        let (app, _) = test_app();
        register_user(&app, "ada").await;
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/auth/register",
            None,
            serde_json::json!({
                "name": "Imposter",
                "email": "ada@example.com",
                "password": "other",
            }),
        )
        .await;
        // In-band contract: failures ride a 200 with an error field.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "Email already exists");
    }

    // 4. Login
    #[tokio::test]
    async fn test_login_success_and_failure() {
        let (app, _) = test_app();
        register_user(&app, "ada").await;

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "ada@example.com", "password": "hunter2"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["token"].is_string());

        let (_, body) = send_json(
            &app,
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "ada@example.com", "password": "wrong"}),
        )
        .await;
        assert_eq!(body["error"], "Invalid email/password");

        let (_, body) = send_json(
            &app,
            "POST",
            "/api/auth/login",
            None,
            serde_json::json!({"email": "nobody@example.com", "password": "hunter2"}),
        )
        .await;
        assert_eq!(body["error"], "Invalid email/password");
    }

    // 5. Identity gate rejections are in-band
    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let (app, _) = test_app();

        let (status, body) = send_get(&app, "/api/bugs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "Missing token");

        let (status, body) = send_get(&app, "/api/bugs", Some("garbage.token.here")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "Invalid token");
    }

    // 6. Projects
    #[tokio::test]
    async fn test_create_and_list_projects() {
        let (app, _) = test_app();
        let (token, user_id) = register_user(&app, "ada").await;

        let (_, project) = send_json(
            &app,
            "POST",
            "/api/projects",
            Some(&token),
            serde_json::json!({"name": "backend", "description": "the API"}),
        )
        .await;
        assert_eq!(project["name"], "backend");
        assert_eq!(project["owner_id"], user_id);

        let (_, projects) = send_get(&app, "/api/projects", Some(&token)).await;
        assert_eq!(projects.as_array().unwrap().len(), 1);
    }

    // 7. Bug creation persists a notification for the assignee
    #[tokio::test]
    async fn test_create_bug_with_assignee_notifies() {
        let (app, _) = test_app();
        let (reporter_token, _) = register_user(&app, "ada").await;
        let (assignee_token, assignee_id) = register_user(&app, "brian").await;

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&reporter_token),
            serde_json::json!({
                "title": "Crash on save",
                "description": "boom",
                "priority": "high",
                "project_id": 1,
                "assignee_id": assignee_id,
            }),
        )
        .await;
        assert_eq!(bug["status"], "open");
        assert_eq!(bug["priority"], "high");
        assert_eq!(bug["assignee_id"], assignee_id);

        let (_, notes) = send_get(&app, "/api/notifications", Some(&assignee_token)).await;
        let notes = notes.as_array().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["message"], "You were assigned bug: Crash on save");
        assert_eq!(notes[0]["read"], false);

        // The reporter has no notifications.
        let (_, notes) = send_get(&app, "/api/notifications", Some(&reporter_token)).await;
        assert!(notes.as_array().unwrap().is_empty());
    }

    // 8. Assignee's identified connections receive the ephemeral event
    #[tokio::test]
    async fn test_create_bug_pushes_to_identified_connection() {
        let (app, state) = test_app();
        let (token, _) = register_user(&app, "ada").await;
        let (_, assignee_id) = register_user(&app, "brian").await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.registry.join(assignee_id, tx);

        send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({
                "title": "Crash on save",
                "project_id": 1,
                "assignee_id": assignee_id,
            }),
        )
        .await;

        let payload: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(payload["event"], "notification");
        assert_eq!(payload["data"]["message"], "New bug assigned: Crash on save");
    }

    // 9. Closing a bug appends an audit entry and broadcasts analytics
    #[tokio::test]
    async fn test_close_bug_workflow() {
        let (app, state) = test_app();
        let (token, user_id) = register_user(&app, "ada").await;
        let mut rx = state.ws_tx.subscribe();

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({"title": "Crash", "project_id": 1}),
        )
        .await;
        let bug_id = bug["id"].as_i64().unwrap();

        let (status, body) = send_json(
            &app,
            "PUT",
            &format!("/api/bugs/{}", bug_id),
            Some(&token),
            serde_json::json!({
                "status": "closed",
                "resolution": "fixed the null deref",
                "resolved_by": user_id,
                "resolved_at": "2024-06-01T12:00:00Z",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        // Exactly one audit entry, attributed to the resolver.
        let (_, history) = send_get(
            &app,
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
        )
        .await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["resolved_by"], user_id);

        // The caller re-fetches to observe the new state.
        let (_, bugs) = send_get(&app, "/api/bugs", Some(&token)).await;
        assert_eq!(bugs[0]["status"], "closed");
        assert_eq!(bugs[0]["resolution"], "fixed the null deref");

        // All connected clients got the push-variant snapshot.
        let payload: serde_json::Value =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["event"], "analysis");
        assert_eq!(payload["data"]["solved"], 1);
        assert_eq!(payload["data"]["totalResolved"], 1);
    }

    // 10. Closing with an empty resolution creates no audit entry
    #[tokio::test]
    async fn test_close_bug_empty_resolution() {
        let (app, state) = test_app();
        let (token, _) = register_user(&app, "ada").await;
        let mut rx = state.ws_tx.subscribe();

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({"title": "Crash", "project_id": 1}),
        )
        .await;
        let bug_id = bug["id"].as_i64().unwrap();

        send_json(
            &app,
            "PUT",
            &format!("/api/bugs/{}", bug_id),
            Some(&token),
            serde_json::json!({"status": "closed", "resolution": ""}),
        )
        .await;

        let (_, history) = send_get(
            &app,
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
        )
        .await;
        assert!(history.as_array().unwrap().is_empty());

        // The analytics refresh still went out.
        assert!(rx.recv().await.unwrap().contains("\"analysis\""));
    }

    // 11. Update against a missing id succeeds vacuously
    #[tokio::test]
    async fn test_update_missing_bug_succeeds() {
        let (app, _) = test_app();
        let (token, _) = register_user(&app, "ada").await;

        let (status, body) = send_json(
            &app,
            "PUT",
            "/api/bugs/9999",
            Some(&token),
            serde_json::json!({"title": "ghost"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    // 12. Direct audit endpoint, newest first
    #[tokio::test]
    async fn test_direct_resolution_endpoint() {
        let (app, _) = test_app();
        let (token, user_id) = register_user(&app, "ada").await;

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({"title": "Crash", "project_id": 1}),
        )
        .await;
        let bug_id = bug["id"].as_i64().unwrap();

        // Two entries; the second names an explicit resolver.
        let (_, first) = send_json(
            &app,
            "POST",
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
            serde_json::json!({"resolution": "first attempt"}),
        )
        .await;
        assert_eq!(first["resolved_by"], user_id);

        send_json(
            &app,
            "POST",
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
            serde_json::json!({"resolution": "second attempt", "resolved_by": 777}),
        )
        .await;

        let (_, history) = send_get(
            &app,
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
        )
        .await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["resolution"], "second attempt");
        assert_eq!(history[0]["resolved_by"], 777);
        assert_eq!(history[1]["resolution"], "first attempt");

        // The bug itself is untouched by the direct audit path.
        let (_, bugs) = send_get(&app, "/api/bugs", Some(&token)).await;
        assert_eq!(bugs[0]["status"], "open");
    }

    // 13. Analytics summary pull variant
    #[tokio::test]
    async fn test_analytics_summary() {
        let (app, _) = test_app();
        let (token, _) = register_user(&app, "ada").await;

        // Empty store: all zero defaults.
        let (_, empty) = send_get(&app, "/api/analytics/summary", Some(&token)).await;
        assert_eq!(empty["totalResolved"], 0);
        assert_eq!(empty["avgResolutionMs"], 0);
        assert_eq!(empty["topSolvers"].as_array().unwrap().len(), 0);

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({"title": "Crash", "priority": "high", "project_id": 1}),
        )
        .await;
        send_json(
            &app,
            "PUT",
            &format!("/api/bugs/{}", bug["id"].as_i64().unwrap()),
            Some(&token),
            serde_json::json!({
                "status": "closed",
                "resolution": "fixed",
                "resolved_at": "2024-06-01T12:00:00Z",
            }),
        )
        .await;

        let (_, summary) = send_get(&app, "/api/analytics/summary", Some(&token)).await;
        assert_eq!(summary["totalResolved"], 1);
        assert_eq!(summary["totalResolvedBy"], 1);
        assert_eq!(summary["topSolvers"][0]["name"], "Ada");
        assert_eq!(summary["topSolvers"][0]["count"], 1);
        // Priority histogram covers current bugs regardless of status.
        assert_eq!(summary["priorityCounts"]["high"], 1);
        // The pull variant carries no event fields.
        assert!(summary.get("solved").is_none());
        assert!(summary.get("timestamp").is_none());
    }

    // 14. Reports summary
    #[tokio::test]
    async fn test_reports_summary() {
        let (app, _) = test_app();
        let (token, _) = register_user(&app, "ada").await;

        for (title, priority) in [("a", "high"), ("b", "high"), ("c", "low")] {
            send_json(
                &app,
                "POST",
                "/api/bugs",
                Some(&token),
                serde_json::json!({"title": title, "priority": priority, "project_id": 1}),
            )
            .await;
        }
        send_json(
            &app,
            "PUT",
            "/api/bugs/1",
            Some(&token),
            serde_json::json!({"status": "closed", "resolution": "done"}),
        )
        .await;

        let (_, report) = send_get(&app, "/api/reports/summary", Some(&token)).await;
        assert_eq!(report["total"], 3);
        assert_eq!(report["open"], 2);
        assert_eq!(report["closed"], 1);
        assert_eq!(report["byPriority"]["high"], 2);
        assert_eq!(report["byPriority"]["low"], 1);
    }

    // 15. Delete is vacuous and leaves the audit trail
    #[tokio::test]
    async fn test_delete_bug() {
        let (app, _) = test_app();
        let (token, _) = register_user(&app, "ada").await;

        let (_, bug) = send_json(
            &app,
            "POST",
            "/api/bugs",
            Some(&token),
            serde_json::json!({"title": "Crash", "project_id": 1}),
        )
        .await;
        let bug_id = bug["id"].as_i64().unwrap();
        send_json(
            &app,
            "PUT",
            &format!("/api/bugs/{}", bug_id),
            Some(&token),
            serde_json::json!({"status": "closed", "resolution": "fixed"}),
        )
        .await;

        let (_, body) = send_json(
            &app,
            "DELETE",
            &format!("/api/bugs/{}", bug_id),
            Some(&token),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(body["success"], true);

        // Orphaned history remains readable.
        let (_, history) = send_get(
            &app,
            &format!("/api/bugs/{}/resolutions", bug_id),
            Some(&token),
        )
        .await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        // Deleting again still reports success.
        let (_, body) = send_json(
            &app,
            "DELETE",
            &format!("/api/bugs/{}", bug_id),
            Some(&token),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(body["success"], true);
    }

    // 16. Users listing requires auth and hides hashes
    #[tokio::test]
    async fn test_list_users() {
        let (app, _) = test_app();
        let (token, _) = register_user(&app, "ada").await;
        register_user(&app, "brian").await;

        let (_, users) = send_get(&app, "/api/users", Some(&token)).await;
        let users = users.as_array().unwrap();
        assert_eq!(users.len(), 2);
        assert!(users[0].get("password_hash").is_none());
    }
}
