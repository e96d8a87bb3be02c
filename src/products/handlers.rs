use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use super::dto::{ProductInfoRequest, ProductInfoResponse, SearchQuery};
use super::edamam::FoodHit;
use super::resolver::ResolveError;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn product_routes() -> Router<AppState> {
    Router::new().route("/product-info", post(product_info))
}

pub fn search_routes() -> Router<AppState> {
    Router::new().route("/search", get(search))
}

/// POST /product-info { barcode } → { productInfo }
#[instrument(skip(state, body))]
pub async fn product_info(
    State(state): State<AppState>,
    Json(body): Json<ProductInfoRequest>,
) -> ApiResult<Json<ProductInfoResponse>> {
    let Some(barcode) = body.barcode.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()) else {
        return Err(ApiError::bad_request("No barcode provided"));
    };

    match state.resolver.resolve_str(&barcode).await {
        Ok(product_info) => {
            info!(%barcode, name = %product_info.name, "product resolved");
            Ok(Json(ProductInfoResponse { product_info }))
        }
        Err(ResolveError::NotFound(_)) => {
            warn!(%barcode, "product not found");
            Err(ApiError::not_found("Product not found"))
        }
        Err(ResolveError::Upstream(e)) => {
            error!(error = %e, %barcode, "product lookup failed");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch product information",
            ))
        }
    }
}

/// GET /search?q=... proxies a free-text food query to the remote source.
#[instrument(skip(state))]
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> ApiResult<Json<Vec<FoodHit>>> {
    let Some(query) = params.q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()) else {
        return Err(ApiError::bad_request("Search query is required"));
    };
    let Some(client) = state.search.as_ref() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Food search is not configured",
        ));
    };

    client.search(&query).await.map(Json).map_err(|e| {
        error!(error = %e, %query, "food search failed");
        ApiError::new(StatusCode::BAD_GATEWAY, "Food search is unavailable")
    })
}
