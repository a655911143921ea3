use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, rejection::QueryRejection, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::PoisonError;

use super::error::ApiError;
use super::{AppState, ResponseStyle};
use crate::types::PredictionResult;

/// アップロードファイルのフィールド名
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    /// 全クラスの確率も返す（detailed のみ）
    #[serde(default)]
    pub probabilities: bool,
}

#[derive(Debug, Serialize)]
pub struct DetailedResponse {
    pub class: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<BTreeMap<String, f32>>,
}

#[derive(Debug, Serialize)]
pub struct LabelOnlyResponse {
    pub prediction: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub architecture: String,
    pub classes: Vec<String>,
}

#[tracing::instrument(name = "GET /health", skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        architecture: state.architecture.clone(),
        classes: state.labels.as_slice().to_vec(),
    })
}

#[tracing::instrument(name = "POST /predict", skip(state, query, multipart))]
pub async fn predict(
    State(state): State<AppState>,
    query: Result<Query<PredictQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            tracing::debug!("multipart ではないリクエスト: {}", rejection.body_text());
            return Err(ApiError::bad_request("No file uploaded"));
        }
    };

    let bytes = read_file_field(&mut multipart)
        .await?
        .ok_or_else(|| ApiError::bad_request("No file uploaded"))?;

    let result = run_prediction(&state, bytes).await?;
    tracing::info!("予測: {} ({:.3})", result.label, result.confidence);

    let response = match state.style {
        ResponseStyle::Detailed => Json(DetailedResponse {
            class: result.label,
            confidence: result.confidence,
            probabilities: query.probabilities.then_some(result.probabilities),
        })
        .into_response(),
        ResponseStyle::LabelOnly => Json(LabelOnlyResponse {
            prediction: result.label,
        })
        .into_response(),
    };

    Ok(response)
}

/// `file` フィールドの中身を読む（他のフィールドは読み飛ばす）
async fn read_file_field(multipart: &mut Multipart) -> Result<Option<Bytes>, ApiError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err(multipart_error(e.status(), e.body_text())),
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        return field
            .bytes()
            .await
            .map(Some)
            .map_err(|e| multipart_error(e.status(), e.body_text()));
    }
}

fn multipart_error(status: StatusCode, message: String) -> ApiError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large(message)
    } else {
        ApiError::bad_request(message)
    }
}

/// 推論はブロッキング処理なので専用スレッドで実行
async fn run_prediction(state: &AppState, bytes: Bytes) -> Result<PredictionResult, ApiError> {
    let predictor = state.predictor.clone();

    let result = tokio::task::spawn_blocking(move || {
        // 重みは読み取り専用なので、前の推論のパニックによる汚染は無視する
        let predictor = predictor.lock().unwrap_or_else(PoisonError::into_inner);
        predictor.classify(&bytes)
    })
    .await
    .map_err(|e| ApiError::internal(format!("推論タスクが失敗しました: {}", e)))??;

    Ok(result)
}
