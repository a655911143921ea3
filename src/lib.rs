//! 皮膚病変画像分類
//!
//! - `prepare`: メタデータCSVからクラス別フォルダ構成の学習データを作成
//! - `ml`: 学習パイプラインと推論エンジン（Burn）
//! - `server`: 推論HTTPサービス（axum）
//! - `model`: 設定・ラベルマニフェスト・モデルアーカイブ

pub mod types;
pub mod csv_loader;
pub mod logging;
pub mod prepare;
pub mod model;
pub mod predictor;
pub mod server;
#[cfg(feature = "ml")]
pub mod ml;

pub use predictor::{InferenceError, Predictor};
pub use types::{LabeledSample, PredictionResult, Split};
