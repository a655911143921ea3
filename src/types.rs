use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ラベル付けされたサンプル（メタデータ1行分）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledSample {
    pub image_id: String,
    pub diagnosis_code: String,
    pub label: String,
}

impl LabeledSample {
    /// 拡張子付きのファイル名
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.image_id, extension)
    }
}

// 学習用 / 検証用の区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// 1リクエスト分の推論結果（永続化しない）
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub label: String,
    /// 予測クラスのsoftmax確率 [0, 1]
    pub confidence: f32,
    /// 全クラスの確率（ラベル順）
    pub probabilities: BTreeMap<String, f32>,
}
