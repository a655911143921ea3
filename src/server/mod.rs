//! 推論HTTPサービス
//!
//! - `POST /predict`: multipart の `file` フィールドの画像を分類
//! - `GET /health`: 読み込んだモデルの構成とクラス

pub mod error;
pub mod routes;

pub use error::ApiError;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::model::{ClassLabelSet, ServerSettings};
use crate::predictor::Predictor;

/// レスポンス形式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseStyle {
    /// `{"class": .., "confidence": ..}`
    #[default]
    Detailed,
    /// `{"prediction": ..}`
    LabelOnly,
}

impl std::fmt::Display for ResponseStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStyle::Detailed => write!(f, "detailed"),
            ResponseStyle::LabelOnly => write!(f, "label-only"),
        }
    }
}

impl std::str::FromStr for ResponseStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detailed" => Ok(ResponseStyle::Detailed),
            "label-only" | "label_only" => Ok(ResponseStyle::LabelOnly),
            _ => Err(format!("不明なレスポンス形式: {} (detailed | label-only)", s)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<Mutex<Box<dyn Predictor>>>,
    pub style: ResponseStyle,
    pub labels: ClassLabelSet,
    pub architecture: String,
}

impl AppState {
    pub fn new(predictor: Box<dyn Predictor>, style: ResponseStyle) -> Self {
        let labels = predictor.labels().clone();
        let architecture = predictor.describe();
        Self {
            predictor: Arc::new(Mutex::new(predictor)),
            style,
            labels,
            architecture,
        }
    }
}

pub fn build_router(predictor: Box<dyn Predictor>, settings: &ServerSettings) -> Router {
    let state = AppState::new(predictor, settings.response_style);

    Router::new()
        .route("/predict", post(routes::predict))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// サーバーを起動（終了まで戻らない）
pub async fn serve(predictor: Box<dyn Predictor>, settings: &ServerSettings) -> Result<()> {
    let router = build_router(predictor, settings);
    let addr = format!("{}:{}", settings.host, settings.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("バインドに失敗しました: {}", addr))?;
    tracing::info!("推論サーバーを起動しました: http://{} ({})", addr, settings.response_style);

    axum::serve(listener, router).await.context("サーバーエラー")?;
    Ok(())
}
