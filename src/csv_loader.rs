use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::Path;

/// メタデータCSVの1行
///
/// `image_id` と `dx`（診断コード）のみ使用し、その他の列は無視します。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetadataRecord {
    pub image_id: String,
    pub dx: String,
}

pub fn load_metadata_csv(path: &Path) -> Result<Vec<MetadataRecord>> {
    let reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("メタデータCSVを開けません: {}", path.display()))?;

    parse_records(reader)
}

/// 任意のリーダーからメタデータを読み込む
pub fn load_metadata_from_reader<R: std::io::Read>(rdr: R) -> Result<Vec<MetadataRecord>> {
    let reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(rdr);

    parse_records(reader)
}

fn parse_records<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Vec<MetadataRecord>> {
    let headers = reader.headers()?.clone();
    for required in ["image_id", "dx"] {
        if !headers.iter().any(|h| h == required) {
            anyhow::bail!("メタデータCSVに必須列 '{}' がありません", required);
        }
    }

    let mut records = Vec::new();
    for (line, result) in reader.deserialize().enumerate() {
        let record: MetadataRecord =
            result.with_context(|| format!("メタデータCSVの {} 行目が不正です", line + 2))?;
        records.push(record);
    }

    Ok(records)
}
