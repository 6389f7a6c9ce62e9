use axum::{extract::State, Json};
use axum_extra::extract::WithRejection;

use crate::{
    api::types::{
        GenerateRequest, GenerateResponse, HealthResponse, HistoryResponse, WelcomeResponse,
    },
    error::AppError,
    state::AppState,
};

pub async fn welcome(State(state): State<AppState>) -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Text generation API is running".to_string(),
        model: state.service.model_name().to_string(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.service.model_name().to_string(),
    })
}

pub async fn generate(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<GenerateRequest>, AppError>,
) -> Result<Json<GenerateResponse>, AppError> {
    let record = state.service.generate(req).await?;
    Ok(Json(GenerateResponse {
        generated_text: record.generated_text,
    }))
}

pub async fn history(State(state): State<AppState>) -> Result<Json<HistoryResponse>, AppError> {
    let history = state.service.history().await?;
    Ok(Json(HistoryResponse { history }))
}
