//! In-memory stand-in for the classification service.
//!
//! It memorizes trained images by exact pixel match; anything it has not seen
//! is labelled by the parity of its first pixel (`"0"` when even, `"1"` when
//! odd). That is enough to drive the client end-to-end with predictable
//! answers.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use common::http::{ClassifyResponse, ServiceConfig, TrainQuery};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const DEFAULT_HASHTABLES: u32 = 35;
const DEFAULT_ADDRESSES: u32 = 21;
const DEFAULT_TARGET_SIZE: (u32, u32) = (28, 28);

/// Fills in the optional hyperparameters and checks they fit together.
fn resolve(config: ServiceConfig) -> Result<ServiceConfig, AppError> {
    let sampled = config.hashtables as u64 * config.addresses as u64;
    let target_size = config.target_size.unwrap_or(DEFAULT_TARGET_SIZE);
    let area = target_size.0 as u64 * target_size.1 as u64;

    if sampled > area {
        return Err(AppError::BadRequest(
            "hashtables * addresses exceeds the target image area".to_string(),
        ));
    }
    let mapping = match config.mapping {
        Some(mapping) => mapping,
        None => {
            let sampled = u32::try_from(sampled).map_err(|_| {
                AppError::BadRequest("hashtables * addresses does not fit in a mapping".to_string())
            })?;
            (0..sampled).collect()
        }
    };
    if (mapping.len() as u64) < sampled {
        return Err(AppError::BadRequest(
            "mapping is shorter than hashtables * addresses".to_string(),
        ));
    }
    if mapping.len() as u64 > area {
        return Err(AppError::BadRequest(
            "mapping is longer than the target image area".to_string(),
        ));
    }

    Ok(ServiceConfig {
        target_size: Some(target_size),
        mapping: Some(mapping),
        ..config
    })
}

#[derive(Debug, Clone)]
struct StubModel {
    config: ServiceConfig,
    memory: HashMap<Vec<u8>, String>,
}

/// Serialized form of [`StubModel`] inside the `/model` blob.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    config: ServiceConfig,
    examples: Vec<(Vec<u8>, String)>,
}

impl From<&StubModel> for Snapshot {
    fn from(model: &StubModel) -> Self {
        Self {
            config: model.config.clone(),
            examples: model
                .memory
                .iter()
                .map(|(pixels, label)| (pixels.clone(), label.clone()))
                .collect(),
        }
    }
}

impl From<Snapshot> for StubModel {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            config: snapshot.config,
            memory: snapshot.examples.into_iter().collect(),
        }
    }
}

impl Default for StubModel {
    fn default() -> Self {
        let config = ServiceConfig {
            hashtables: DEFAULT_HASHTABLES,
            addresses: DEFAULT_ADDRESSES,
            bleach: 0,
            target_size: Some(DEFAULT_TARGET_SIZE),
            mapping: Some((0..DEFAULT_HASHTABLES * DEFAULT_ADDRESSES).collect()),
        };
        Self {
            config,
            memory: HashMap::new(),
        }
    }
}

impl StubModel {
    fn classify(&self, pixels: &[u8]) -> String {
        match self.memory.get(pixels) {
            Some(label) => label.clone(),
            None if pixels[0] % 2 == 0 => "0".to_string(),
            None => "1".to_string(),
        }
    }
}

#[derive(Default)]
pub struct AppState {
    model: Mutex<StubModel>,
    total_requests: AtomicU64,
}

impl AppState {
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/new", post(new_model))
        .route("/train", post(train))
        .route("/classify", post(classify))
        .route("/info", get(info_handler))
        .route("/model", get(save_model).post(load_model).delete(erase_model))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `addr` and serves in a background task. Returns the bound address,
/// which matters when `addr` asks for an ephemeral port.
pub async fn spawn(addr: &str) -> anyhow::Result<(SocketAddr, Arc<AppState>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let state = Arc::new(AppState::default());
    let app = router(state.clone());

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "stub server stopped");
        }
    });

    Ok((local_addr, state))
}

async fn new_model(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ServiceConfig>,
) -> Result<StatusCode, AppError> {
    state.count();
    let config = resolve(config)?;
    info!(
        hashtables = config.hashtables,
        addresses = config.addresses,
        bleach = config.bleach,
        "model reset with new hyperparameters"
    );

    *state.model.lock().await = StubModel {
        config,
        memory: HashMap::new(),
    };
    Ok(StatusCode::OK)
}

async fn train(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrainQuery>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.count();
    if body.is_empty() {
        return Err(AppError::BadRequest("empty image".to_string()));
    }

    debug!(label = %query.label, bytes = body.len(), "train");
    state.model.lock().await.memory.insert(body.to_vec(), query.label);
    Ok(StatusCode::OK)
}

async fn classify(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ClassifyResponse>, AppError> {
    state.count();
    if body.is_empty() {
        return Err(AppError::BadRequest("empty image".to_string()));
    }

    let label = state.model.lock().await.classify(&body);
    Ok(Json(ClassifyResponse { label }))
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Json<ServiceConfig> {
    state.count();
    Json(state.model.lock().await.config.clone())
}

async fn save_model(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    state.count();
    let snapshot = Snapshot::from(&*state.model.lock().await);
    let snapshot = serde_json::to_vec(&snapshot)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&snapshot)?;
    let blob = encoder.finish()?;

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], blob).into_response())
}

async fn load_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.count();
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Err(AppError::BadRequest("expected content-encoding: gzip".to_string()));
    }

    let mut snapshot = Vec::new();
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut snapshot)
        .map_err(|e| AppError::BadRequest(format!("invalid gzip body: {e}")))?;
    let model: StubModel = serde_json::from_slice::<Snapshot>(&snapshot)
        .map_err(|e| AppError::BadRequest(format!("invalid model: {e}")))?
        .into();

    info!(examples = model.memory.len(), "model restored");
    *state.model.lock().await = model;
    Ok(StatusCode::OK)
}

async fn erase_model(State(state): State<Arc<AppState>>) -> StatusCode {
    state.count();
    *state.model.lock().await = StubModel::default();
    StatusCode::OK
}
