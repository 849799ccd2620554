//! HTTP/JSON adapter on KServe v2 paths.
use crate::{
    json::{
        ErrorBody, IndexEntry, InferRequestBody, InferResponseBody, JsonTensor,
        ModelMetadataBody, ServerMetadataBody,
    },
    model_metadata, offload, parse_version, SERVER_EXTENSIONS, SERVER_NAME, SERVER_VERSION,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dispatcher::{Error, Frontend, InferenceRequest};
use std::io;
use tokio::net::TcpListener;

/// Routes of the HTTP protocol over `frontend`.
pub fn router(frontend: Frontend) -> Router {
    Router::new()
        .route("/v2", get(server_metadata))
        .route("/v2/health/live", get(live))
        .route("/v2/health/ready", get(ready))
        .route("/v2/models/:name", get(metadata))
        .route("/v2/models/:name/ready", get(model_ready))
        .route("/v2/models/:name/infer", post(infer))
        .route("/v2/models/:name/versions/:version", get(version_metadata))
        .route("/v2/models/:name/versions/:version/ready", get(version_ready))
        .route("/v2/models/:name/versions/:version/infer", post(version_infer))
        .route("/v2/repository/index", get(index).post(index))
        .with_state(frontend)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, frontend: Frontend) -> io::Result<()> {
    log::info!("HTTP service listening on {}", listener.local_addr()?);
    axum::serve(listener, router(frontend)).await
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) | Error::VersionNotFound { .. } => StatusCode::NOT_FOUND,
        Error::NotReady { .. } | Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        // client closed request
        Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Error::AlreadyExists { .. } => StatusCode::CONFLICT,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status_code(&self.0), Json(body)).into_response()
    }
}

fn flag(value: bool) -> StatusCode {
    if value {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn server_metadata() -> Json<ServerMetadataBody> {
    Json(ServerMetadataBody {
        name: SERVER_NAME.to_string(),
        version: SERVER_VERSION.to_string(),
        extensions: SERVER_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
    })
}

async fn live(State(frontend): State<Frontend>) -> StatusCode {
    flag(frontend.health.live())
}

async fn ready(State(frontend): State<Frontend>) -> StatusCode {
    flag(frontend.health.ready())
}

async fn model_ready(State(frontend): State<Frontend>, Path(name): Path<String>) -> StatusCode {
    flag(frontend.health.model_ready(&name))
}

async fn version_ready(
    State(frontend): State<Frontend>,
    Path((name, version)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let ready = match parse_version(&version)? {
        Some(version) => frontend.health.model_version_ready(&name, version),
        None => frontend.health.model_ready(&name),
    };
    Ok(flag(ready))
}

async fn metadata(
    State(frontend): State<Frontend>,
    Path(name): Path<String>,
) -> Result<Json<ModelMetadataBody>, ApiError> {
    Ok(Json(model_metadata(&frontend.registry, &name, None)?))
}

async fn version_metadata(
    State(frontend): State<Frontend>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<ModelMetadataBody>, ApiError> {
    let version = parse_version(&version)?;
    Ok(Json(model_metadata(&frontend.registry, &name, version)?))
}

async fn index(State(frontend): State<Frontend>) -> Json<Vec<IndexEntry>> {
    let entries = frontend
        .registry
        .index()
        .into_iter()
        .map(|(name, version, state)| IndexEntry {
            name,
            version: version.to_string(),
            state: state.as_str().to_string(),
        })
        .collect();
    Json(entries)
}

async fn infer(
    State(frontend): State<Frontend>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<InferResponseBody>, ApiError> {
    run_infer(frontend, name, None, &body).await
}

async fn version_infer(
    State(frontend): State<Frontend>,
    Path((name, version)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<InferResponseBody>, ApiError> {
    let version = parse_version(&version)?;
    run_infer(frontend, name, version, &body).await
}

async fn run_infer(
    frontend: Frontend,
    name: String,
    version: Option<u64>,
    body: &[u8],
) -> Result<Json<InferResponseBody>, ApiError> {
    let body: InferRequestBody = serde_json::from_slice(body)
        .map_err(|err| Error::InvalidArgument(format!("malformed request body: {}", err)))?;
    let tensors = body
        .inputs
        .iter()
        .map(JsonTensor::to_tensor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| Error::InvalidArgument(err.to_string()))?;
    let mut request = InferenceRequest::new(name).with_inputs(tensors)?;
    if let Some(version) = version {
        request = request.version(version);
    }
    if let Some(id) = &body.id {
        request = request.id(id.clone());
    }
    for output in body.outputs {
        request = request.request_output(output.name);
    }

    let response = offload::dispatch(frontend.dispatcher.clone(), request).await?;
    let mut outputs = response
        .outputs
        .values()
        .map(JsonTensor::from_tensor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| Error::Internal(err.to_string()))?;
    outputs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(InferResponseBody {
        model_name: response.model_name,
        model_version: response.model_version.to_string(),
        id: body.id,
        outputs,
    }))
}
