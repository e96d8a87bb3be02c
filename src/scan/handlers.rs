use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::acquire::{acquire_from_file, AcquireError};
use super::controller::ScanController;
use super::dto::{CreatedSession, ScanBarcodeRequest, ScanBarcodeResponse, SessionView};
use crate::error::{internal, ApiError, ApiResult};
use crate::state::AppState;

pub fn scan_routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/scan-barcode", post(scan_barcode))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/upload", post(upload_to_session))
        .route("/sessions/:id/capture", post(capture_in_session))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/sessions/:id/reset", post(reset_session))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Strips an optional `data:<mime>;base64,` prefix and decodes the rest.
pub(crate) fn decode_image_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    lazy_static! {
        static ref DATA_URL_RE: Regex = Regex::new(r"^data:[\w.+/-]*;base64,").unwrap();
    }
    let trimmed = payload.trim();
    let body = match DATA_URL_RE.find(trimmed) {
        Some(m) => &trimmed[m.end()..],
        None => trimmed,
    };
    STANDARD.decode(body)
}

/// POST /scan-barcode { image } → { barcode, format }
#[instrument(skip(state, body))]
pub async fn scan_barcode(
    State(state): State<AppState>,
    Json(body): Json<ScanBarcodeRequest>,
) -> ApiResult<Json<ScanBarcodeResponse>> {
    let Some(image) = body.image.filter(|s| !s.trim().is_empty()) else {
        return Err(ApiError::bad_request("No image provided"));
    };
    let bytes = decode_image_payload(&image).map_err(|e| {
        warn!(error = %e, "invalid base64 image");
        ApiError::bad_request("Image is not valid base64")
    })?;

    let decoder = state.decoder;
    let result = tokio::task::spawn_blocking(move || {
        let img = acquire_from_file(&bytes)?;
        Ok::<_, AcquireError>(decoder.decode(img.pixels(), img.width() as usize, img.height() as usize))
    })
    .await
    .map_err(internal("Failed to process image"))?;

    match result {
        Ok(Some(code)) => {
            info!(barcode = code.value(), format = %code.format(), "barcode extracted");
            Ok(Json(ScanBarcodeResponse {
                barcode: code.value().to_string(),
                format: code.format(),
            }))
        }
        Ok(None) => Err(ApiError::not_found("No barcode found in the image")),
        // an unreadable picture is answered like a picture without a code
        Err(e) => {
            warn!(error = %e, "unreadable image");
            Err(ApiError::not_found("No barcode found in the image"))
        }
    }
}

fn session(state: &AppState, id: &Uuid) -> ApiResult<std::sync::Arc<ScanController>> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

#[instrument(skip(state))]
pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreatedSession>) {
    let (id, ctrl) = state.sessions.insert(state.new_controller());
    info!(session_id = %id, active = state.sessions.len(), "scan session created");
    (
        StatusCode::CREATED,
        Json(CreatedSession {
            id,
            session: ctrl.snapshot().into(),
        }),
    )
}

#[instrument(skip(state))]
pub async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<SessionView>> {
    Ok(Json(session(&state, &id)?.snapshot().into()))
}

#[instrument(skip(state))]
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    if state.sessions.remove(&id) {
        info!(session_id = %id, "scan session closed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Session not found"))
    }
}

/// POST /sessions/:id/upload (multipart, field `file`). Answers 202 with the
/// started run; poll the session for the outcome.
#[instrument(skip(state, mp))]
pub async fn upload_to_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut mp: Multipart,
) -> ApiResult<(StatusCode, Json<SessionView>)> {
    let ctrl = session(&state, &id)?;

    let mut file: Option<Bytes> = None;
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if matches!(field.name(), Some("file") | Some("image")) {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            file = Some(data);
            break;
        }
    }
    let Some(file) = file.filter(|b| !b.is_empty()) else {
        return Err(ApiError::bad_request("file is required"));
    };

    let started = ctrl.spawn_upload(file);
    Ok((StatusCode::ACCEPTED, Json(started.into())))
}

#[instrument(skip(state))]
pub async fn capture_in_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<SessionView>)> {
    let started = session(&state, &id)?.spawn_camera();
    Ok((StatusCode::ACCEPTED, Json(started.into())))
}

#[instrument(skip(state))]
pub async fn cancel_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<SessionView>> {
    Ok(Json(session(&state, &id)?.cancel().into()))
}

#[instrument(skip(state))]
pub async fn reset_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<SessionView>> {
    Ok(Json(session(&state, &id)?.reset().into()))
}
