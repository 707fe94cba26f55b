use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State as AxumState},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::Dispatcher;
use crate::{
    error::{Error, ErrorKind},
    files::{ExtractReport, FileInfo, FileManager},
    tasks::types::{Job, JobPayload, JobType},
};

/// HTTP front for the dispatcher and the file manager.
pub struct ApiServer {
    dispatcher: Dispatcher,
    files: Arc<FileManager>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: JobPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

impl PathQuery {
    fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub archive: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct CompressRequest {
    pub sources: Vec<String>,
    pub destination: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidTransition => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        ErrorKind::PathTraversal => StatusCode::BAD_REQUEST,
        ErrorKind::ProtectedFile | ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::SecurityThreat => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PayloadTooLarge | ErrorKind::ArchiveTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::StreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::ResourceExhausted | ErrorKind::RuntimeUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!(?kind, error = %self, "Request failed");
        }
        (status, Json(json!({ "kind": kind, "message": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, Error>;

impl ApiServer {
    pub fn new(dispatcher: Dispatcher, files: Arc<FileManager>) -> Self {
        Self { dispatcher, files }
    }

    async fn enqueue_job(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Json(request): Json<EnqueueRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let job_id = server
            .dispatcher
            .enqueue_job(server_id, request.job_type, request.payload)
            .await?;
        Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
    }

    async fn get_job(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(job_id): Path<Uuid>,
    ) -> ApiResult<Json<Job>> {
        Ok(Json(server.dispatcher.get_job_status(job_id).await?))
    }

    async fn list_files(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<PathQuery>,
    ) -> ApiResult<Json<Vec<FileInfo>>> {
        Ok(Json(server.files.list_files(server_id, query.path()).await?))
    }

    async fn delete_file(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<PathQuery>,
    ) -> ApiResult<StatusCode> {
        server.files.delete_file(server_id, query.path()).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn read_file(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<PathQuery>,
    ) -> ApiResult<impl IntoResponse> {
        let content = server.files.read_file(server_id, query.path()).await?;
        Ok(([(header::CONTENT_TYPE, "application/octet-stream")], content))
    }

    async fn write_file(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<PathQuery>,
        body: Bytes,
    ) -> ApiResult<StatusCode> {
        server
            .files
            .write_file(server_id, query.path(), &body)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn create_directory(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Json(request): Json<DirectoryRequest>,
    ) -> ApiResult<StatusCode> {
        server
            .files
            .create_directory(server_id, &request.path)
            .await?;
        Ok(StatusCode::CREATED)
    }

    async fn download_file(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<PathQuery>,
    ) -> ApiResult<impl IntoResponse> {
        let download = server.files.download_file(server_id, query.path()).await?;
        let content_type = if download.archive {
            "application/x-tar"
        } else {
            "application/octet-stream"
        };
        let disposition = format!(
            "attachment; filename=\"{}\"",
            download.name.replace('"', "")
        );
        Ok((
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            download.content,
        ))
    }

    async fn upload_file(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Query(query): Query<UploadQuery>,
        body: Bytes,
    ) -> ApiResult<impl IntoResponse> {
        let path = server
            .files
            .upload_file(server_id, &query.dir, &query.name, &body)
            .await?;
        Ok((StatusCode::CREATED, Json(json!({ "path": path }))))
    }

    async fn extract_archive(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Json(request): Json<ExtractRequest>,
    ) -> ApiResult<Json<ExtractReport>> {
        let report = server
            .files
            .extract_archive(server_id, &request.archive, &request.destination)
            .await?;
        Ok(Json(report))
    }

    async fn compress_archive(
        AxumState(server): AxumState<Arc<ApiServer>>,
        Path(server_id): Path<Uuid>,
        Json(request): Json<CompressRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let size = server
            .files
            .compress_archive(server_id, &request.sources, &request.destination)
            .await?;
        Ok((StatusCode::CREATED, Json(json!({ "size": size }))))
    }

    pub fn router(self) -> Router {
        let body_limit = usize::try_from(self.files.policy().max_write_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        Router::new()
            .route("/servers/{id}/jobs", post(ApiServer::enqueue_job))
            .route("/jobs/{id}", get(ApiServer::get_job))
            .route(
                "/servers/{id}/files",
                get(ApiServer::list_files).delete(ApiServer::delete_file),
            )
            .route(
                "/servers/{id}/files/content",
                get(ApiServer::read_file).put(ApiServer::write_file),
            )
            .route(
                "/servers/{id}/files/directory",
                post(ApiServer::create_directory),
            )
            .route("/servers/{id}/files/download", get(ApiServer::download_file))
            .route("/servers/{id}/files/upload", post(ApiServer::upload_file))
            .route("/servers/{id}/files/extract", post(ApiServer::extract_archive))
            .route("/servers/{id}/files/compress", post(ApiServer::compress_archive))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(Arc::new(self))
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn serve(
        self,
        address: &str,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "HTTP API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}
