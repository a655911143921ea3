//! 推論の抽象化
//!
//! HTTPサーバーはこのトレイト越しにモデルを呼び出します。

use std::collections::BTreeMap;

use crate::model::ClassLabelSet;
use crate::types::PredictionResult;

/// 推論時のエラー
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("画像として読み込めません: {0}")]
    InvalidImage(String),
    #[error("アップロードされたファイルが空です")]
    EmptyUpload,
    #[error("モデルエラー: {0}")]
    Model(String),
    #[error("テンソル変換エラー: {0}")]
    Tensor(String),
}

impl InferenceError {
    /// 入力側の問題かどうか（HTTPでは400）
    pub fn is_client_error(&self) -> bool {
        matches!(self, InferenceError::InvalidImage(_) | InferenceError::EmptyUpload)
    }
}

/// 画像バイト列を分類するもの
pub trait Predictor: Send {
    fn classify(&self, bytes: &[u8]) -> Result<PredictionResult, InferenceError>;

    /// 出力クラスの順序
    fn labels(&self) -> &ClassLabelSet;

    /// モデル構成の短い説明（例: "resnet18"）
    fn describe(&self) -> String;
}

/// 数値的に安定な softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// ロジットから予測結果を組み立てる
pub fn classify_logits(labels: &ClassLabelSet, logits: &[f32]) -> Result<PredictionResult, InferenceError> {
    if logits.len() != labels.len() {
        return Err(InferenceError::Model(format!(
            "出力次元 {} がクラス数 {} と一致しません",
            logits.len(),
            labels.len()
        )));
    }
    if logits.iter().any(|x| !x.is_finite()) {
        return Err(InferenceError::Tensor("ロジットに有限でない値が含まれています".to_string()));
    }

    let probabilities = softmax(logits);
    let (index, confidence) = probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

    let label = labels
        .label(index)
        .ok_or_else(|| InferenceError::Model(format!("クラスインデックス {} は範囲外です", index)))?
        .to_string();

    let probabilities: BTreeMap<String, f32> = labels.iter().map(str::to_string).zip(probabilities).collect();

    Ok(PredictionResult {
        label,
        confidence,
        probabilities,
    })
}
