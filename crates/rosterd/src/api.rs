use crate::error::ApiError;
use crate::pipeline::Recognition;
use crate::state::AppState;
use crate::ws;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use roster_core::{Embedding, Identity};
use roster_runner::{ScriptRunner, ScriptStatus, MAX_LOG_LINES};
use roster_store::NewIdentity;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEFAULT_LOG_TAIL: usize = 160;
const DEFAULT_RECENT_LIMIT: usize = 8;
const MAX_RECENT_LIMIT: usize = 30;

pub fn router(state: Arc<AppState>) -> Router {
    let ui = Router::new()
        .route("/overview", get(overview))
        .route("/scripts", get(list_scripts))
        .route("/scripts/{id}/start", post(start_script))
        .route("/scripts/{id}/stop", post(stop_script))
        .route("/scripts/{id}/logs", get(script_logs))
        .route("/onboarding", get(onboarding))
        .route("/attendance/recent", get(recent_attendance))
        .route_layer(middleware::from_fn_with_state(state.clone(), local_only));

    Router::new()
        .route("/health", get(health))
        .route("/health/db", get(health_db))
        .route("/health/cache", get(health_cache))
        .route("/persons/register", post(register_person))
        .route("/persons/{id}/embeddings", post(add_embedding))
        .route("/attendance/identify", post(identify))
        .route("/ws/video-input", get(ws::video_input))
        .route("/ws/stream", get(ws::stream))
        .nest("/ui/api", ui)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Whether a caller may reach the dashboard surface.
pub fn is_allowed(local_only: bool, peer: Option<SocketAddr>) -> bool {
    !local_only || peer.is_some_and(|addr| addr.ip().is_loopback())
}

async fn local_only(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, ApiError> {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    if !is_allowed(state.config.local_only, peer) {
        tracing::warn!(?peer, path = %req.uri().path(), "non-local dashboard request rejected");
        return Err(ApiError::forbidden(
            "local-only mode: dashboard access is allowed from this machine only",
        ));
    }
    Ok(next.run(req).await)
}

// --- health ---

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "roster" }))
}

async fn health_db(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "up" })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "down" }))).into_response()
        }
    }
}

async fn health_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "status": "ok", "backend": state.cache.active().as_str() }))
}

// --- persons ---

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub embedding: Vec<f32>,
}

async fn register_person(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Identity>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::invalid_params("name must not be empty"));
    }
    let new = NewIdentity {
        name,
        external_id: req.employee_id.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        role: req.role.unwrap_or_else(|| "staff".to_string()),
    };
    let identity = state.pipeline.enroll(new, &Embedding::new(req.embedding)).await?;
    Ok((StatusCode::CREATED, Json(identity)))
}

async fn add_embedding(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<Identity>, ApiError> {
    let identity = state.pipeline.add_embedding(id, &Embedding::new(req.embedding)).await?;
    Ok(Json(identity))
}

// --- attendance ---

#[derive(Debug, Deserialize)]
pub struct IdentifyRequest {
    pub embedding: Vec<f32>,
    pub camera_id: String,
}

async fn identify(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdentifyRequest>,
) -> Result<Json<Value>, ApiError> {
    let embedding = Embedding::new(req.embedding);
    let body = match state.pipeline.identify(&embedding, &req.camera_id).await? {
        Recognition::Admitted { identity, event } => {
            let notice = json!({
                "type": "checkin",
                "person_name": identity.name,
                "employee_id": identity.external_id,
                "camera_id": event.camera_id,
                "timestamp": event.timestamp,
            });
            state.relay.notify(notice.to_string());
            json!({
                "status": "success",
                "person_name": identity.name,
                "employee_id": identity.external_id,
                "confidence": event.confidence,
            })
        }
        Recognition::CooledDown { identity, .. } => json!({
            "status": "ignored",
            "code": "cooldown_rejected",
            "person_name": identity.name,
            "message": "already marked within the cooldown window",
        }),
        Recognition::Unknown { .. } => json!({
            "status": "unknown",
            "code": "no_match",
            "message": "no matching person found",
        }),
    };
    Ok(Json(body))
}

// --- dashboard ---

struct DbSummary {
    status: &'static str,
    people_count: Option<u64>,
    attendance_today: Option<u64>,
}

async fn db_summary(state: &AppState) -> DbSummary {
    let today = state.pipeline.now().date_naive();
    let counts = async {
        let people = state.store.count_identities().await?;
        let attendance = state.store.count_attendance_on(today).await?;
        Ok::<_, roster_store::StoreError>((people, attendance))
    };
    match counts.await {
        Ok((people, attendance)) => DbSummary {
            status: "up",
            people_count: Some(people),
            attendance_today: Some(attendance),
        },
        Err(e) => {
            tracing::warn!(error = %e, "database summary unavailable");
            DbSummary {
                status: "down",
                people_count: None,
                attendance_today: None,
            }
        }
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
    }
}

async fn overview(State(state): State<Arc<AppState>>) -> Json<Value> {
    let db = db_summary(&state).await;
    Json(json!({
        "project": "roster",
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": hostname(),
        "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        "runtime_version": concat!("rosterd/", env!("CARGO_PKG_VERSION")),
        "local_only": state.config.local_only,
        "running_scripts": state.runner.running_count(),
        "db_status": db.status,
        "people_count": db.people_count,
        "attendance_today": db.attendance_today,
    }))
}

async fn list_scripts(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "scripts": state.runner.list() }))
}

/// Start parameters are optional; an empty body means none.
fn parse_params(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(ApiError::invalid_params("start parameters must be a JSON object")),
        Err(e) => Err(ApiError::invalid_params(format!("malformed JSON body: {e}"))),
    }
}

async fn start_script(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let params = parse_params(&body)?;
    let outcome = state.runner.start(&id, &params).await?;
    let already_running = outcome.already_running();
    Ok(Json(json!({
        "script": outcome.into_record(),
        "already_running": already_running,
    })))
}

async fn stop_script(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let record = state.runner.stop(&id).await?;
    Ok(Json(json!({ "script": record })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    pub tail: Option<usize>,
}

async fn script_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<Value>, ApiError> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_LINES);
    let script = state.runner.get(&id)?;
    let logs = state.runner.logs(&id, tail)?;
    Ok(Json(json!({ "script": script, "logs": logs })))
}

fn step_status(status: ScriptStatus) -> &'static str {
    match status {
        ScriptStatus::Running | ScriptStatus::Stopping => "in_progress",
        ScriptStatus::Completed => "complete",
        ScriptStatus::Failed => "blocked",
        ScriptStatus::Idle | ScriptStatus::Stopped => "action",
    }
}

fn script_step(runner: &ScriptRunner, script_id: &str) -> &'static str {
    step_status(runner.status(script_id).unwrap_or_default())
}

async fn onboarding(State(state): State<Arc<AppState>>) -> Json<Value> {
    let db = db_summary(&state).await;
    let runner = &state.runner;

    let enrolled = db.people_count.is_some_and(|n| n > 0);
    let attended = db.attendance_today.is_some_and(|n| n > 0);

    let step = |id: &str, title: &str, description: &str, status: &str| {
        json!({ "id": id, "title": title, "description": description, "status": status })
    };
    let steps = vec![
        step(
            "gpu",
            "Validate GPU Runtime",
            "Run diagnostics and confirm the inference provider is available.",
            script_step(runner, "test_gpu"),
        ),
        step(
            "seed",
            "Initialize Sample Data",
            "Create starter records for end-to-end verification.",
            script_step(runner, "seed_db"),
        ),
        step(
            "enroll",
            "Enroll Your First Person",
            "Open camera-based registration and capture one face.",
            if enrolled { "complete" } else { script_step(runner, "register_face") },
        ),
        step(
            "camera",
            "Run Edge Camera Client",
            "Start local recognition and live relay streaming.",
            script_step(runner, "camera_client"),
        ),
        step(
            "attendance",
            "Verify Attendance Logs",
            "Confirm attendance events are being written to the database.",
            if attended { "complete" } else { "action" },
        ),
    ];

    Json(json!({ "db_status": db.status, "steps": steps }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

async fn recent_attendance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    let records = state.store.recent_attendance(limit).await?;
    Ok(Json(json!({ "records": records })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::face;
    use crate::state::tests::test_state;
    use roster_core::EMBEDDING_DIM;
    use std::time::Duration;

    fn register(name: &str, employee_id: &str, embedding: Embedding) -> Json<RegisterRequest> {
        Json(RegisterRequest {
            name: name.to_string(),
            employee_id: Some(employee_id.to_string()),
            role: None,
            embedding: embedding.values,
        })
    }

    fn identify_body(embedding: Embedding) -> Json<IdentifyRequest> {
        Json(IdentifyRequest {
            embedding: embedding.values,
            camera_id: "lobby".to_string(),
        })
    }

    async fn wait_for(state: &AppState, id: &str, status: ScriptStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.runner.status(id).unwrap() != status {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_local_only_guard() {
        let loopback: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let loopback6: SocketAddr = "[::1]:5000".parse().unwrap();
        let remote: SocketAddr = "192.168.1.20:5000".parse().unwrap();

        assert!(is_allowed(true, Some(loopback)));
        assert!(is_allowed(true, Some(loopback6)));
        assert!(!is_allowed(true, Some(remote)));
        assert!(!is_allowed(true, None));
        assert!(is_allowed(false, Some(remote)));
        assert!(is_allowed(false, None));
    }

    #[test]
    fn test_step_status_mapping() {
        assert_eq!(step_status(ScriptStatus::Running), "in_progress");
        assert_eq!(step_status(ScriptStatus::Stopping), "in_progress");
        assert_eq!(step_status(ScriptStatus::Completed), "complete");
        assert_eq!(step_status(ScriptStatus::Failed), "blocked");
        assert_eq!(step_status(ScriptStatus::Idle), "action");
        assert_eq!(step_status(ScriptStatus::Stopped), "action");
    }

    #[test]
    fn test_parse_params() {
        assert!(parse_params(b"").unwrap().is_empty());
        assert!(parse_params(b"null").unwrap().is_empty());
        assert_eq!(parse_params(br#"{"name":"Ada"}"#).unwrap()["name"], "Ada");
        assert_eq!(parse_params(b"[1,2]").unwrap_err().code, "invalid_params");
        assert_eq!(parse_params(b"{oops").unwrap_err().code, "invalid_params");
    }

    #[tokio::test]
    async fn test_identify_flow_and_recent_records() {
        let dir = tempfile::tempdir().unwrap();
        let (state, clock) = test_state(dir.path()).await;
        let mut viewer = state.relay.subscribe();

        let (status, Json(alice)) = register_person(State(state.clone()), register("Alice", "E-1", face(0, 0.0)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(alice.external_id.as_deref(), Some("E-1"));
        assert_eq!(alice.role, "staff");

        let Json(body) = identify(State(state.clone()), identify_body(face(0, 0.25))).await.unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["person_name"], "Alice");
        assert_eq!(body["employee_id"], "E-1");

        match viewer.recv().await {
            Some(crate::relay::Broadcast::Notice(text)) => {
                let notice: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(notice["type"], "checkin");
                assert_eq!(notice["camera_id"], "lobby");
            }
            other => panic!("expected check-in notice, got {other:?}"),
        }

        clock.advance(chrono::Duration::minutes(1));
        let Json(body) = identify(State(state.clone()), identify_body(face(0, 0.25))).await.unwrap();
        assert_eq!(body["status"], "ignored");
        assert_eq!(body["code"], "cooldown_rejected");

        let Json(body) = identify(State(state.clone()), identify_body(face(100, 0.0))).await.unwrap();
        assert_eq!(body["status"], "unknown");
        assert_eq!(body["code"], "no_match");

        let Json(body) = recent_attendance(State(state.clone()), Query(LimitQuery::default()))
            .await
            .unwrap();
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["person_name"], "Alice");
        assert_eq!(records[0]["method"], "face_bio");
    }

    #[tokio::test]
    async fn test_identify_rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;
        let err = identify(State(state), identify_body(Embedding::new(vec![0.5; 64])))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code, "invalid_embedding");
        assert!(err.message.contains(&EMBEDDING_DIM.to_string()));
    }

    #[tokio::test]
    async fn test_identify_rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;
        register_person(State(state.clone()), register("Alice", "E-1", face(0, 0.0)))
            .await
            .unwrap();

        // 1e39 overflows f32 during JSON decoding and arrives as infinity.
        let mut values = vec![0.0_f32; EMBEDDING_DIM];
        values[0] = 1e39_f64 as f32;
        let err = identify(State(state.clone()), identify_body(Embedding::new(values)))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code, "invalid_embedding");
        assert!(err.message.contains("finite"));

        let err = identify(State(state), identify_body(Embedding::new(vec![0.0; EMBEDDING_DIM])))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_embedding");
    }

    #[tokio::test]
    async fn test_register_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;
        register_person(State(state.clone()), register("Alice", "E-1", face(0, 0.0)))
            .await
            .unwrap();

        let err = register_person(State(state.clone()), register("Alicia", "E-2", face(0, 0.05)))
            .await
            .unwrap_err();
        assert_eq!((err.status, err.code), (StatusCode::CONFLICT, "duplicate_face"));

        let err = register_person(State(state.clone()), register("Bob", "E-1", face(50, 0.0)))
            .await
            .unwrap_err();
        assert_eq!((err.status, err.code), (StatusCode::CONFLICT, "duplicate_external_id"));

        let err = add_embedding(
            State(state),
            Path(404),
            Json(EmbeddingRequest {
                embedding: face(60, 0.0).values,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!((err.status, err.code), (StatusCode::NOT_FOUND, "identity_not_found"));
    }

    #[tokio::test]
    async fn test_script_lifecycle_over_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;

        let Json(body) = start_script(State(state.clone()), Path("seed_db".to_string()), Bytes::new())
            .await
            .unwrap();
        assert_eq!(body["already_running"], false);
        assert_eq!(body["script"]["id"], "seed_db");

        wait_for(&state, "seed_db", ScriptStatus::Completed).await;

        let Json(body) = script_logs(
            State(state.clone()),
            Path("seed_db".to_string()),
            Query(TailQuery { tail: Some(1) }),
        )
        .await
        .unwrap();
        assert_eq!(body["script"]["status"], "completed");
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0], "Process exited with code 0.");

        let Json(body) = stop_script(State(state.clone()), Path("test_gpu".to_string())).await.unwrap();
        assert_eq!(body["script"]["status"], "idle");

        let err = start_script(State(state), Path("nope".to_string()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!((err.status, err.code), (StatusCode::NOT_FOUND, "script_not_found"));
    }

    #[tokio::test]
    async fn test_overview_and_onboarding() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;

        let Json(body) = overview(State(state.clone())).await;
        assert_eq!(body["db_status"], "up");
        assert_eq!(body["people_count"], 0);
        assert_eq!(body["running_scripts"], 0);
        assert_eq!(body["local_only"], true);
        assert!(!body["hostname"].as_str().unwrap().is_empty());

        let Json(body) = onboarding(State(state.clone())).await;
        let steps = body["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 5);
        assert!(steps.iter().all(|s| s["status"] == "action"));

        start_script(State(state.clone()), Path("test_gpu".to_string()), Bytes::new())
            .await
            .unwrap();
        wait_for(&state, "test_gpu", ScriptStatus::Completed).await;
        register_person(State(state.clone()), register("Alice", "E-1", face(0, 0.0)))
            .await
            .unwrap();
        identify(State(state.clone()), identify_body(face(0, 0.0))).await.unwrap();

        let Json(body) = onboarding(State(state)).await;
        let status = |id: &str| {
            body["steps"]
                .as_array()
                .unwrap()
                .iter()
                .find(|s| s["id"] == id)
                .unwrap()["status"]
                .clone()
        };
        assert_eq!(status("gpu"), "complete");
        assert_eq!(status("seed"), "action");
        assert_eq!(status("enroll"), "complete");
        assert_eq!(status("attendance"), "complete");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path()).await;

        assert_eq!(health().await.0["status"], "ok");
        assert_eq!(health_db(State(state.clone())).await.status(), StatusCode::OK);

        state.cache.refresh().await;
        assert_eq!(health_cache(State(state)).await.0["backend"], "memory");
    }
}
