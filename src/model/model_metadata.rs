//! ラベルマニフェスト（モデルメタデータ）の定義
//!
//! モデルアーカイブ（tar.gz）内に `metadata.json` として重みと一緒に保存されます。
//! 推論時のクラスラベル順序は必ずこのマニフェストから取得し、
//! 学習時の順序とずれないようにします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::model::label_set::ClassLabelSet;

/// ネットワーク構成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    /// ResNet18（最終全結合層をクラス数に差し替え）
    #[serde(rename = "resnet18")]
    ResNet18,
    /// 3層の小型CNN
    CompactCnn,
}

impl Architecture {
    /// この構成の標準前処理
    pub fn default_preprocessing(&self) -> Preprocessing {
        match self {
            Architecture::ResNet18 => Preprocessing::ImageNet { size: 224 },
            Architecture::CompactCnn => Preprocessing::UnitScale { size: 150 },
        }
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::ResNet18
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::ResNet18 => write!(f, "resnet18"),
            Architecture::CompactCnn => write!(f, "compact-cnn"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resnet18" => Ok(Architecture::ResNet18),
            "compact-cnn" | "compact" | "cnn" => Ok(Architecture::CompactCnn),
            other => Err(format!("unknown architecture: {other} (resnet18 | compact-cnn)")),
        }
    }
}

/// 入力画像の前処理プロファイル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preprocessing {
    /// size x size にリサイズしてImageNetの平均・標準偏差で正規化
    #[serde(rename = "imagenet")]
    ImageNet { size: u32 },
    /// size x size にリサイズして [0, 1] にスケーリング
    UnitScale { size: u32 },
}

impl Preprocessing {
    pub fn size(&self) -> u32 {
        match self {
            Preprocessing::ImageNet { size } | Preprocessing::UnitScale { size } => *size,
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 全クラスラベル（出力層のインデックス順）
    /// 例: ["Benign", "Carcinoma", "Melanoma"]
    pub class_labels: ClassLabelSet,

    pub architecture: Architecture,

    pub preprocessing: Preprocessing,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 最終エポックの検証精度
    #[serde(default)]
    pub final_val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: ClassLabelSet,
        architecture: Architecture,
        preprocessing: Preprocessing,
        num_epochs: u32,
        final_val_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            architecture,
            preprocessing,
            num_epochs,
            final_val_accuracy,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let labels = ClassLabelSet::new(vec!["Benign".into(), "Carcinoma".into(), "Melanoma".into()]).unwrap();
        let metadata = ModelMetadata::new(
            labels,
            Architecture::ResNet18,
            Preprocessing::ImageNet { size: 224 },
            10,
            Some(0.81),
        );

        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"architecture\": \"resnet18\""));
        assert!(json.contains("\"kind\": \"imagenet\""));

        let back = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(back.class_labels, metadata.class_labels);
        assert_eq!(back.preprocessing.size(), 224);
    }

    #[test]
    fn test_rejects_duplicate_labels_in_manifest() {
        let json = r#"{
            "class_labels": ["Benign", "Benign"],
            "architecture": "compact-cnn",
            "preprocessing": {"kind": "unit_scale", "size": 150},
            "num_epochs": 1,
            "trained_at": "2024-01-01T00:00:00+00:00"
        }"#;
        assert!(ModelMetadata::from_json_string(json).is_err());
    }

    #[test]
    fn test_architecture_from_str() {
        assert_eq!("ResNet18".parse::<Architecture>().unwrap(), Architecture::ResNet18);
        assert_eq!("compact-cnn".parse::<Architecture>().unwrap(), Architecture::CompactCnn);
        assert!("vgg".parse::<Architecture>().is_err());
    }
}
