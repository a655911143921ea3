//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//! ラベルマニフェストと重みは常に同じアーカイブから一緒に読み込まれます。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - ラベルマニフェスト（クラス順序、構成、前処理）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パスを正規化（`.tar.gz` で終わらなければ付与）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 一時ファイルに書き込んでからリネームするため、
/// 読み込み側が書きかけのアーカイブを見ることはありません。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tmp_path = tar_gz_path.with_extension("gz.partial");
    let tar_gz_file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tmp_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    std::fs::rename(&tmp_path, &tar_gz_path)
        .with_context(|| format!("Failed to move archive into place: {:?}", tar_gz_path))?;

    tracing::info!(
        path = %tar_gz_path.display(),
        classes = %metadata.class_labels,
        bytes = model_binary.len(),
        "モデルを保存しました"
    );

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// Tar.gzからモデルメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("クラスラベル: {}", metadata.class_labels);
    tracing::info!("構成: {}", metadata.architecture);
    tracing::info!("前処理: {:?}", metadata.preprocessing);
    tracing::info!("学習エポック数: {}", metadata.num_epochs);
    if let Some(acc) = metadata.final_val_accuracy {
        tracing::info!("最終検証精度: {:.4}", acc);
    }
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, ClassLabelSet, Preprocessing};

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata::new(
            ClassLabelSet::new(vec!["Benign".into(), "Carcinoma".into(), "Melanoma".into()]).unwrap(),
            Architecture::CompactCnn,
            Preprocessing::UnitScale { size: 150 },
            3,
            None,
        )
    }

    #[test]
    fn test_archive_contains_manifest_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_model_with_metadata(&dir.path().join("models/skin"), &sample_metadata(), &[1, 2, 3, 4])
            .unwrap();

        assert_eq!(saved, dir.path().join("models/skin.tar.gz"));
        assert!(!dir.path().join("models/skin.tar.gz.partial").exists());

        let (metadata, binary) = load_model_with_metadata(&saved).unwrap();
        assert_eq!(metadata.class_labels.label(2), Some("Melanoma"));
        assert_eq!(binary, vec![1, 2, 3, 4]);

        let only_metadata = load_metadata(&saved).unwrap();
        assert_eq!(only_metadata.architecture, Architecture::CompactCnn);
    }

    #[test]
    fn test_archive_without_weights_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");

        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let json = sample_metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(err.to_string().contains("model.bin"));
    }

    #[test]
    fn test_archive_path_extension() {
        assert_eq!(archive_path(Path::new("a/model")), PathBuf::from("a/model.tar.gz"));
        assert_eq!(archive_path(Path::new("a/model.tar.gz")), PathBuf::from("a/model.tar.gz"));
    }
}
