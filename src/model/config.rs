//! アプリケーション設定管理モジュール
//!
//! データ準備・学習・推論サーバーの設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::model::model_metadata::Architecture;
use crate::prepare::DiagnosisMap;
use crate::server::ResponseStyle;

/// 設定ファイルパスを指定する環境変数
pub const CONFIG_ENV_VAR: &str = "SKIN_CLASSIFIER_CONFIG";

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("unknown device: {other} (cpu | wgpu)")),
        }
    }
}

/// データ準備設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreparationSettings {
    /// メタデータCSV（image_id, dx 列を含む）
    pub metadata_path: PathBuf,
    /// 元画像のルートディレクトリ
    pub image_dir: PathBuf,
    /// 元画像が分割されているサブディレクトリ（検索順）
    pub image_parts: Vec<String>,
    /// 画像ファイルの拡張子
    pub image_extension: String,
    /// 出力先（<output>/<split>/<label>/<image>）
    pub output_dir: PathBuf,
    /// 検証データの割合
    pub val_ratio: f64,
    /// 分割用ランダムシード
    pub seed: u64,
    /// 診断コード -> クラスラベル
    pub diagnosis_map: DiagnosisMap,
    /// 既存ファイルをスキップする（再実行を冪等にする）
    pub skip_existing: bool,
}

impl Default for PreparationSettings {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("archive/HAM10000_metadata.csv"),
            image_dir: PathBuf::from("archive"),
            image_parts: vec![
                "HAM10000_images_part_1".to_string(),
                "HAM10000_images_part_2".to_string(),
            ],
            image_extension: "jpg".to_string(),
            output_dir: PathBuf::from("data"),
            val_ratio: 0.2,
            seed: 42,
            diagnosis_map: DiagnosisMap::default(),
            skip_existing: false,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 学習データのルート（train/ と val/ を含む）
    pub data_dir: PathBuf,
    /// モデルアーカイブの出力先
    pub output_model_path: PathBuf,
    pub architecture: Architecture,
    /// 入力サイズの上書き（未指定ならアーキテクチャ既定値）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u32>,
    /// 事前学習済みバックボーンの重み（ResNet18のみ、任意）
    pub backbone_weights: Option<PathBuf>,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// バッチ単位の進捗を表示する
    pub show_progress: bool,
    /// 学習時のデータ拡張（左右反転・回転）
    pub augment: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_model_path: PathBuf::from("skin_disease_classifier.tar.gz"),
            architecture: Architecture::default(),
            image_size: None,
            backbone_weights: None,
            num_epochs: 10,
            batch_size: 32,
            num_workers: 4,
            learning_rate: 1e-4,
            seed: 42,
            show_progress: false,
            augment: true,
        }
    }
}

/// 推論サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// 読み込むモデルアーカイブ
    pub model_path: PathBuf,
    pub response_style: ResponseStyle,
    /// アップロードサイズ上限（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            model_path: PathBuf::from("skin_disease_classifier.tar.gz"),
            response_style: ResponseStyle::default(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub preparation: PreparationSettings,
    pub training: TrainingSettings,
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    ///
    /// 環境変数 `SKIN_CLASSIFIER_CONFIG` があればそちらを優先します。
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません ({})。デフォルト設定を使用します", path.display());
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::debug!("データ準備: {:?}", self.preparation);
        tracing::debug!("トレーニング: {:?}", self.training);
        tracing::debug!("サーバー: {:?}", self.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.learning_rate, 1e-4);
        assert_eq!(config.preparation.val_ratio, 0.2);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.training.architecture, deserialized.training.architecture);
        assert_eq!(
            config.preparation.diagnosis_map.label_for("mel"),
            deserialized.preparation.diagnosis_map.label_for("mel")
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"device_type": "Cpu", "server": {"port": 9000}}"#).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.training.num_epochs, 10);
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_default(Some(&path));
        assert_eq!(config.training.num_epochs, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 3;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 3);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
        assert_eq!("cpu".parse::<DeviceType>().unwrap(), DeviceType::Cpu);
    }
}
