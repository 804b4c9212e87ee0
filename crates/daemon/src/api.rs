//! HTTP API over the job service.
//!
//! Exposes listings, manual submission, reprocessing, statistics, worker
//! status, the running configuration and overall daemon status as JSON for
//! dashboards and the CLI.

use crate::service::{
    ConfigReport, JobService, ServiceError, StatusReport, SubmittedJob, WorkersReport,
};
use crate::stats::{RecordView, StatisticsReport};
use crate::store::{JobStatus, StoreError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Error returned from a handler, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::UnknownProfile(_) | ServiceError::SourceMissing(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Store(StoreError::NotReprocessable { .. })
            | ServiceError::Store(StoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            ServiceError::Store(StoreError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::OutputDir { .. }
            | ServiceError::Store(StoreError::Io(_))
            | ServiceError::Store(StoreError::Serialization(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
}

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub source: PathBuf,
    pub profile: String,
    pub destination: Option<PathBuf>,
}

type AppState = Arc<JobService>;

/// GET /jobs?status=...
async fn list_jobs(
    State(service): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<RecordView>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };
    Ok(Json(service.list(status).await))
}

/// GET /jobs/:id
async fn get_job(
    State(service): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<RecordView>, ApiError> {
    service
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ServiceError::from(StoreError::NotFound(id)).into())
}

/// POST /jobs
async fn submit_job(
    State(service): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmittedJob>), ApiError> {
    let submitted = service.submit(body.source, &body.profile, body.destination)?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

/// POST /jobs/:id/reprocess
async fn reprocess_job(
    State(service): State<AppState>,
    Path(id): Path<u64>,
) -> Result<(StatusCode, Json<RecordView>), ApiError> {
    let record = service.reprocess(id).await?;
    Ok((StatusCode::CREATED, Json(RecordView::from(record))))
}

/// GET /stats
async fn get_stats(State(service): State<AppState>) -> Json<StatisticsReport> {
    Json(service.statistics().await)
}

/// GET /workers
async fn get_workers(State(service): State<AppState>) -> Json<WorkersReport> {
    Json(service.workers().await)
}

/// GET /config
async fn get_config(State(service): State<AppState>) -> Json<ConfigReport> {
    Json(service.config())
}

/// GET /status
async fn get_status(State(service): State<AppState>) -> Json<StatusReport> {
    Json(service.status().await)
}

/// Creates the axum Router with every endpoint
pub fn create_router(service: Arc<JobService>) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/reprocess", post(reprocess_job))
        .route("/stats", get(get_stats))
        .route("/workers", get(get_workers))
        .route("/config", get(get_config))
        .route("/status", get(get_status))
        .with_state(service)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn run_server<F>(
    service: Arc<JobService>,
    addr: &str,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    info!(addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use crate::store::{JobStateStore, NewRecord, RecordUpdate};
    use crate::worker::WorkerBoard;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use recodex_config::default_profiles;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn service(dir: &TempDir) -> Arc<JobService> {
        let store = Arc::new(JobStateStore::open(dir.path().join("state")).await.unwrap());
        Arc::new(JobService::new(
            store,
            JobQueue::new(),
            Arc::new(default_profiles()),
            WorkerBoard::new(2),
        ))
    }

    async fn add(service: &JobService, source: &str, finish: Option<RecordUpdate>) -> u64 {
        let store = service.store();
        let record = store
            .add_record(NewRecord {
                source: PathBuf::from(source),
                destination: PathBuf::from(format!("{}.out.mp4", source)),
                profile_key: "balanced".to_string(),
                profile_name: "Balanced".to_string(),
                video_codec: Some("h264".to_string()),
            })
            .await
            .unwrap();
        if let Some(update) = finish {
            store
                .update_record(record.id, RecordUpdate::running())
                .await
                .unwrap();
            store.update_record(record.id, update).await.unwrap();
        }
        record.id
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_jobs_by_status() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        add(&service, "/in/a.mp4", None).await;
        add(
            &service,
            "/in/b.mp4",
            Some(RecordUpdate::completed(200, Some(100), 2.0, false)),
        )
        .await;

        let (status, body) = send(create_router(service.clone()), get_req("/jobs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) =
            send(create_router(service.clone()), get_req("/jobs?status=completed")).await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], 2);
        assert_eq!(jobs[0]["compression_ratio"], 2.0);
        assert_eq!(jobs[0]["space_saved"], 100);

        let (status, body) = send(create_router(service), get_req("/jobs?status=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn test_get_job() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let id = add(&service, "/in/a.mp4", None).await;

        let (status, body) =
            send(create_router(service.clone()), get_req(&format!("/jobs/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["source"], "/in/a.mp4");

        let (status, _) = send(create_router(service), get_req("/jobs/42")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_job() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let source = dir.path().join("clip.mkv");
        std::fs::write(&source, b"data").unwrap();

        let (status, body) = send(
            create_router(service.clone()),
            post_req("/jobs", json!({ "source": source, "profile": "balanced" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["profile_name"], "Balanced");
        assert_eq!(service.queue().len(), 1);

        let (status, _) = send(
            create_router(service.clone()),
            post_req("/jobs", json!({ "source": source, "profile": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            create_router(service.clone()),
            post_req(
                "/jobs",
                json!({ "source": dir.path().join("missing.mkv"), "profile": "balanced" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(service.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_reprocess_job() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let pending = add(&service, "/in/a.mp4", None).await;
        let failed = add(
            &service,
            "/in/b.mp4",
            Some(RecordUpdate::failed("boom", Some(1.0))),
        )
        .await;

        let (status, body) = send(
            create_router(service.clone()),
            post_req(&format!("/jobs/{}/reprocess", failed), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["source"], "/in/b.mp4");
        assert_ne!(body["id"], failed);

        let (status, _) = send(
            create_router(service.clone()),
            post_req(&format!("/jobs/{}/reprocess", pending), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            create_router(service),
            post_req("/jobs/77/reprocess", Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_and_workers() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        add(
            &service,
            "/in/a.mp4",
            Some(RecordUpdate::completed(400, Some(100), 3.0, true)),
        )
        .await;

        let (status, body) = send(create_router(service.clone()), get_req("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_completed"], 1);
        assert_eq!(body["total_space_saved"], 300);
        assert_eq!(body["average_compression_ratio"], 4.0);
        assert_eq!(body["by_profile"]["Balanced"]["completed"], 1);
        assert_eq!(body["queue_depth"], 0);

        let (status, body) = send(create_router(service), get_req("/workers")).await;
        assert_eq!(status, StatusCode::OK);
        let workers = body["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0]["state"], "idle");
    }

    #[tokio::test]
    async fn test_config_and_status() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStateStore::open(dir.path().join("state")).await.unwrap());
        let service = Arc::new(
            JobService::new(
                store,
                JobQueue::new(),
                Arc::new(default_profiles()),
                WorkerBoard::new(2),
            )
            .with_watch_targets(vec![recodex_config::WatchTarget::new("/media/in", "balanced")]),
        );
        add(&service, "/in/a.mp4", None).await;
        service.set_watching(vec![PathBuf::from("/media/in")]).await;

        let (status, body) = send(create_router(service.clone()), get_req("/config")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["profiles"]["balanced"]["name"], "Balanced");
        assert_eq!(body["profiles"].as_object().unwrap().len(), 3);
        assert_eq!(body["watch"][0]["path"], "/media/in");
        assert_eq!(body["watch"][0]["profile"], "balanced");

        let (status, body) = send(create_router(service), get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dry_run"], false);
        assert_eq!(body["watching"][0], "/media/in");
        assert_eq!(body["watch_targets"], 1);
        assert_eq!(body["workers"].as_array().unwrap().len(), 2);
        assert_eq!(body["jobs"]["pending"], 1);
        assert_eq!(body["queue_depth"], 0);
    }
}
