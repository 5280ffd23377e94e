use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;

use crate::app_state::AppState;
use crate::error::ApiError;

/// GET /api/assets/{token}: Resolve a signed URL to the asset bytes.
pub async fn serve_asset(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (mime, bytes) = state.assets.open(&token).await?;
    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "private, no-store".to_string()),
        ],
        bytes,
    ))
}
