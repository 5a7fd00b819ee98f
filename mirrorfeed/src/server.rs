//! Thin REST+SSE facade binding the store, gateway pool, pipeline and
//! broker to the HTTP contract consumed by the front-end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use rocket::http::{ContentType, Status};
use rocket::response::stream::{Event, EventStream};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{delete, get, post, routes, Build, Request, Rocket, Shutdown, State};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::gateway::GatewayPool;
use crate::pipeline::{self, FetchAllOutcome};
use crate::storage::{Post, Store, Target};

/// Rocket managed state shared across all routes.
pub struct AppState {
    pub store: Arc<Store>,
    pub gateway: Arc<GatewayPool>,
    pub broker: Option<Arc<Broker>>,
    pub http: Client,
    pub html_fallback_pattern: Regex,
    pub keep_only_last_n_per_target: Option<i64>,
    pub queue_size: Arc<AtomicUsize>,
    pub last_run: Arc<Mutex<Option<DateTime<Utc>>>>,
}

#[derive(Deserialize)]
struct CreateTargetRequest {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    poll_interval_seconds: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    rtt_by_instance: Vec<crate::gateway::InstanceSnapshot>,
    queue_size: usize,
    last_run: Option<DateTime<Utc>>,
}

#[get("/api/targets")]
async fn list_targets(state: &State<AppState>) -> Result<Json<Vec<Target>>, Status> {
    state.store.get_targets().await.map(Json).map_err(|err| {
        tracing::error!(error = %err, "failed to list targets");
        Status::InternalServerError
    })
}

#[post("/api/targets", data = "<body>")]
async fn create_target(
    state: &State<AppState>,
    body: Json<CreateTargetRequest>,
) -> Result<Json<Target>, (Status, Json<ErrorResponse>)> {
    let kind = body.kind.trim();
    let value = body.value.trim();

    if kind != "user" && kind != "hashtag" {
        return Err(bad_request("type must be \"user\" or \"hashtag\""));
    }
    if value.is_empty() {
        return Err(bad_request("value must not be empty"));
    }
    if body.poll_interval_seconds < 60 {
        return Err(bad_request("poll_interval_seconds must be at least 60"));
    }

    let id = state
        .store
        .add_target(kind, value, body.poll_interval_seconds)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to create target");
            (
                Status::InternalServerError,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
        })?;

    let target = state
        .store
        .get_target(id)
        .await
        .map_err(|err| {
            (
                Status::InternalServerError,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
        })?
        .ok_or_else(|| {
            (
                Status::InternalServerError,
                Json(ErrorResponse {
                    error: "target vanished after insert".to_string(),
                }),
            )
        })?;

    if let Some(broker) = &state.broker {
        broker
            .publish(
                "tick",
                serde_json::json!({
                    "target": format!("{kind}:{value}"),
                    "target_id": id,
                    "scheduled_at": Utc::now().to_rfc3339(),
                }),
            )
            .await;
    }

    Ok(Json(target))
}

fn bad_request(message: &str) -> (Status, Json<ErrorResponse>) {
    (
        Status::BadRequest,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

#[delete("/api/targets/<id>")]
async fn delete_target(state: &State<AppState>, id: i64) -> Result<Json<serde_json::Value>, Status> {
    let existing = state.store.get_target(id).await.map_err(|err| {
        tracing::error!(error = %err, "failed to look up target for deletion");
        Status::InternalServerError
    })?;

    if existing.is_none() {
        return Err(Status::NotFound);
    }

    state.store.delete_target(id).await.map_err(|err| {
        tracing::error!(error = %err, "failed to delete target");
        Status::InternalServerError
    })?;

    if let Some(broker) = &state.broker {
        broker
            .publish("cooldown", serde_json::json!({"target": id, "deleted": true}))
            .await;
    }

    Ok(Json(serde_json::json!({"deleted": true})))
}

#[post("/api/fetch/once")]
async fn fetch_once(state: &State<AppState>) -> Result<Json<FetchAllOutcome>, Status> {
    let outcome = pipeline::fetch_all_now(
        &state.store,
        &state.gateway,
        state.broker.as_deref(),
        &state.http,
        &state.html_fallback_pattern,
        state.keep_only_last_n_per_target,
    )
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "on-demand fetch failed");
        Status::InternalServerError
    })?;

    Ok(Json(outcome))
}

#[get("/api/tweets?<target>&<limit>&<q>")]
async fn list_tweets(
    state: &State<AppState>,
    target: Option<String>,
    limit: Option<i64>,
    q: Option<String>,
) -> Result<Json<Vec<Post>>, Status> {
    let posts = state
        .store
        .get_posts(target.as_deref(), limit.unwrap_or(50), q.as_deref())
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to list posts");
            Status::InternalServerError
        })?;
    Ok(Json(posts))
}

/// Wraps the exported body so the response carries both the `jsonl`
/// content type and the `Content-Disposition` header the front-end
/// needs to save the stream as `export.jsonl`.
struct JsonlExport(String);

impl<'r> Responder<'r, 'static> for JsonlExport {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(ContentType::new("application", "jsonl"))
            .raw_header("Content-Disposition", "attachment; filename=export.jsonl")
            .sized_body(self.0.len(), std::io::Cursor::new(self.0))
            .ok()
    }
}

#[get("/api/export.jsonl")]
async fn export_jsonl(state: &State<AppState>) -> Result<JsonlExport, Status> {
    let lines = state.store.export_posts().await.map_err(|err| {
        tracing::error!(error = %err, "failed to export posts");
        Status::InternalServerError
    })?;

    let body = lines.join("\n");
    Ok(JsonlExport(body))
}

#[get("/api/health")]
async fn health(state: &State<AppState>) -> Json<HealthResponse> {
    let rtt_by_instance = state.gateway.snapshot().await;
    let queue_size = state.queue_size.load(Ordering::SeqCst);
    let last_run = *state.last_run.lock().await;

    Json(HealthResponse {
        status: "ok",
        rtt_by_instance,
        queue_size,
        last_run,
    })
}

/// Server-sent events stream: a `hello` event on connect, forwarded
/// broker events as they publish, and a synthesized `heartbeat` every
/// 15 seconds of silence. Returns 503 via the caller if SSE is disabled.
#[get("/api/stream")]
async fn stream(state: &State<AppState>, mut shutdown: Shutdown) -> Result<EventStream![Event + '_], Status> {
    let broker = state.broker.as_ref().ok_or(Status::ServiceUnavailable)?.clone();

    Ok(EventStream! {
        let mut subscription = broker.subscribe().await;
        yield Event::data("{}").event("hello");

        loop {
            tokio::select! {
                maybe_message = subscription.receiver.recv() => {
                    match maybe_message {
                        Some(message) => yield Event::data(message),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    yield Event::data("{}").event("heartbeat");
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        broker.unsubscribe(subscription.id).await;
    })
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    rocket::build().manage(state).mount(
        "/",
        routes![
            list_targets,
            create_target,
            delete_target,
            fetch_once,
            list_tweets,
            export_jsonl,
            health,
            stream,
        ],
    )
}
