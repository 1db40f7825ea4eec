use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use story_core::{GameCode, GameState, PlayerCountInput, TurnView};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub mod config;
pub mod error;
pub mod feed;
pub mod locks;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod uploads;

use config::{Settings, StoreBackend};
use error::ApiError;
pub use feed::ServerMessage;
use service::{ImageUpload, StoryService, Submission};
use store::{CodeGenerator, GameStore, MemoryStore, SqliteStore};
use uploads::ImageStore;

/// Room for multipart framing around the image itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    service: StoryService,
}

impl Default for AppState {
    fn default() -> Self {
        let settings = Settings::default();
        Self::new(StoryService::new(
            Arc::new(MemoryStore::default()),
            ImageStore::new(settings.upload_dir, settings.max_upload_bytes),
        ))
    }
}

impl AppState {
    pub fn new(service: StoryService) -> Self {
        Self { service }
    }

    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let codes = Arc::new(CodeGenerator::new(settings.code_seed));
        let store: Arc<dyn GameStore> = match settings.store {
            StoreBackend::Memory => match &settings.persist_path {
                Some(path) => Arc::new(
                    MemoryStore::with_persistence(path.clone(), codes)
                        .await
                        .with_context(|| format!("failed to load snapshot {}", path.display()))?,
                ),
                None => Arc::new(MemoryStore::new(codes)),
            },
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::connect(&settings.database_url, codes)
                    .await
                    .with_context(|| {
                        format!("failed to open database {}", settings.database_url)
                    })?,
            ),
        };
        let images = ImageStore::new(settings.upload_dir.clone(), settings.max_upload_bytes);
        Ok(Self::new(StoryService::new(store, images)))
    }

    pub fn service(&self) -> &StoryService {
        &self.service
    }
}

pub fn app(state: AppState) -> Router {
    let upload_limit = state.service.images().max_bytes() + MULTIPART_OVERHEAD_BYTES;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/games", post(start_game))
        .route("/games/:code", get(get_view))
        .route("/games/:code/contributions", post(submit_contribution))
        .route("/games/:code/result", get(get_result))
        .route(
            "/games/:code/image",
            post(upload_image)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(get_image),
        )
        .route("/ws/:code", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct StartRequest {
    player_count: PlayerCountInput,
}

#[derive(Serialize)]
struct StartResponse {
    code: GameCode,
    state: GameState,
}

async fn start_game(
    State(state): State<AppState>,
    Json(payload): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let max_players = payload.player_count.parse()?;
    let game = state.service.start_game(max_players).await?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            code: game.code().clone(),
            state: game,
        }),
    ))
}

#[derive(Deserialize)]
struct SubmitRequest {
    text: String,
}

async fn submit_contribution(
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<Submission>, ApiError> {
    Ok(Json(state.service.submit(&code, payload.text).await?))
}

#[derive(Deserialize)]
struct ViewParams {
    show_all: Option<String>,
}

impl ViewParams {
    /// Presence is what counts; `?show_all` with any value, or none, is set.
    fn show_all(&self) -> bool {
        self.show_all.is_some()
    }
}

async fn get_view(
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
    Query(params): Query<ViewParams>,
) -> Result<Json<TurnView>, ApiError> {
    Ok(Json(state.service.view(&code, params.show_all()).await?))
}

async fn get_result(
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.result(&code).await?))
}

#[derive(Serialize)]
struct UploadResponse {
    image_reference: String,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::Validation(err.body_text())
    }
}

async fn upload_image(
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some(ImageUpload {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
        break;
    }
    let upload = upload.ok_or_else(|| {
        ApiError::Validation("multipart field `image` is required".into())
    })?;

    let reference = state.service.upload_image(&code, upload).await?;
    Ok(Json(UploadResponse {
        image_reference: reference,
    }))
}

async fn get_image(
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
) -> Result<impl IntoResponse, ApiError> {
    let (bytes, content_type) = state.service.image(&code).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(code): Path<GameCode>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, code))
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|err| {
        warn!(%err, "failed to encode live update");
    })?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

/// Streams view snapshots for one game, starting with the current one, until
/// the client goes away.
async fn handle_socket(socket: WebSocket, state: AppState, code: GameCode) {
    let (mut sender, mut receiver) = socket.split();

    let (snapshot, mut rx) = match state.service.watch(&code).await {
        Ok(watch) => watch,
        Err(err) => {
            debug!(%code, %err, "live feed refused");
            let _ = send_json(&mut sender, &ServerMessage::Error(err.body())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    if send_json(&mut sender, &ServerMessage::State(snapshot))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Ok(message) => {
                    if send_json(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%code, skipped, "live feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
