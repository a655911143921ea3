//! 学習データの準備
//!
//! メタデータCSVの診断コードをクラスラベルに変換し、層化分割した上で
//! 画像を `<output>/<split>/<label>/<image>` にコピーします。

pub mod label_map;
pub mod split;

pub use label_map::{map_records, DiagnosisMap};
pub use split::stratified_split;

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::csv_loader::load_metadata_csv;
use crate::model::PreparationSettings;
use crate::types::{LabeledSample, Split};

/// データ準備の結果
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreparationReport {
    /// 分割ごと・ラベルごとの件数
    pub assigned: BTreeMap<String, BTreeMap<String, usize>>,
    /// 対応表になかった診断コード
    pub unmapped_codes: BTreeSet<String>,
    pub dropped_rows: usize,
    /// 元画像が見つからなかったファイル名
    pub missing_images: Vec<String>,
    /// 実際にコピーしたファイル数
    pub copied: usize,
    /// skip_existing で飛ばしたファイル数
    pub skipped_existing: usize,
}

impl PreparationReport {
    pub fn assigned_count(&self, split: Split) -> usize {
        self.assigned
            .get(split.dir_name())
            .map(|labels| labels.values().sum())
            .unwrap_or(0)
    }
}

/// 元画像を探す
///
/// 分割サブディレクトリを順に探し、最後にルート直下を探します。
pub fn locate_image(image_dir: &Path, parts: &[String], file_name: &str) -> Option<PathBuf> {
    parts
        .iter()
        .map(|part| image_dir.join(part).join(file_name))
        .chain(std::iter::once(image_dir.join(file_name)))
        .find(|candidate| candidate.is_file())
}

/// 既存ファイルと衝突しないコピー先を決める（"name (1).jpg" 形式）
fn unique_destination(dest_dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dest_dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
    let ext = path.extension().and_then(|s| s.to_str());

    (1..)
        .map(|n| match ext {
            Some(ext) => dest_dir.join(format!("{stem} ({n}).{ext}")),
            None => dest_dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// 1つの分割の画像をコピー
pub fn copy_split(
    samples: &[LabeledSample],
    split: Split,
    settings: &PreparationSettings,
    report: &mut PreparationReport,
) -> Result<()> {
    for sample in samples {
        let file_name = sample.file_name(&settings.image_extension);
        let dest_dir = settings.output_dir.join(split.dir_name()).join(&sample.label);
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| format!("ディレクトリを作成できません: {}", dest_dir.display()))?;

        let Some(src_path) = locate_image(&settings.image_dir, &settings.image_parts, &file_name) else {
            tracing::warn!("画像が見つかりません: {}", file_name);
            report.missing_images.push(file_name);
            continue;
        };

        let dst_path = if settings.skip_existing {
            let dst = dest_dir.join(&file_name);
            if dst.exists() {
                report.skipped_existing += 1;
                continue;
            }
            dst
        } else {
            unique_destination(&dest_dir, &file_name)
        };

        std::fs::copy(&src_path, &dst_path).with_context(|| {
            format!("コピーに失敗しました: {} -> {}", src_path.display(), dst_path.display())
        })?;
        report.copied += 1;
    }

    Ok(())
}

/// データ準備を実行
pub fn prepare_dataset(settings: &PreparationSettings) -> Result<PreparationReport> {
    if settings.diagnosis_map.is_empty() {
        anyhow::bail!("診断コードの対応表が空です");
    }

    let records = load_metadata_csv(&settings.metadata_path)?;
    if records.is_empty() {
        anyhow::bail!("メタデータが空です: {}", settings.metadata_path.display());
    }
    tracing::info!("メタデータ: {} 行", records.len());

    let (samples, unmapped_codes) = map_records(&records, &settings.diagnosis_map);
    if samples.is_empty() {
        anyhow::bail!("対応表に一致する行がありません");
    }

    let mut report = PreparationReport {
        unmapped_codes,
        dropped_rows: records.len() - samples.len(),
        ..Default::default()
    };

    let (train, val) = stratified_split(samples, settings.val_ratio, settings.seed)?;

    for (split, subset) in [(Split::Train, &train), (Split::Val, &val)] {
        let counts = report.assigned.entry(split.dir_name().to_string()).or_default();
        for sample in subset.iter() {
            *counts.entry(sample.label.clone()).or_default() += 1;
        }
        tracing::info!("{}: {} 件 {:?}", split, subset.len(), counts);
    }

    copy_split(&train, Split::Train, settings, &mut report)?;
    copy_split(&val, Split::Val, settings, &mut report)?;

    if !report.missing_images.is_empty() {
        tracing::warn!("見つからなかった画像: {} 件", report.missing_images.len());
    }
    tracing::info!(
        "データセットを準備しました: {} ({} 件コピー)",
        settings.output_dir.display(),
        report.copied
    );
    tracing::info!("- 学習データ: {}", settings.output_dir.join(Split::Train.dir_name()).display());
    tracing::info!("- 検証データ: {}", settings.output_dir.join(Split::Val.dir_name()).display());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// HAM10000 と同じ構成の小さな入力を作る
    fn fixture(rows: &[(&str, &str)], part_of: impl Fn(usize) -> Option<usize>) -> (TempDir, PreparationSettings) {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("archive");
        let parts = vec!["part_1".to_string(), "part_2".to_string()];
        for part in &parts {
            fs::create_dir_all(image_dir.join(part)).unwrap();
        }

        let mut csv = String::from("lesion_id,image_id,dx,dx_type\n");
        for (i, (image_id, dx)) in rows.iter().enumerate() {
            csv.push_str(&format!("HAM_{i},{image_id},{dx},histo\n"));
            if let Some(part) = part_of(i) {
                fs::write(image_dir.join(&parts[part]).join(format!("{image_id}.jpg")), image_id).unwrap();
            }
        }
        let metadata_path = dir.path().join("metadata.csv");
        fs::write(&metadata_path, csv).unwrap();

        let settings = PreparationSettings {
            metadata_path,
            image_dir,
            image_parts: parts,
            output_dir: dir.path().join("data"),
            ..Default::default()
        };
        (dir, settings)
    }

    fn count_files(dir: &Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .map(|p| if p.is_dir() { count_files(&p) } else { 1 })
            .sum()
    }

    fn ham_rows() -> Vec<(String, &'static str)> {
        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push((format!("ISIC_mel_{i}"), "mel"));
        }
        for i in 0..20 {
            rows.push((format!("ISIC_nv_{i}"), if i % 2 == 0 { "nv" } else { "bkl" }));
        }
        for i in 0..5 {
            rows.push((format!("ISIC_bcc_{i}"), "bcc"));
        }
        for i in 0..3 {
            rows.push((format!("ISIC_unk_{i}"), "unknown"));
        }
        rows
    }

    #[test]
    fn test_only_mapped_rows_are_placed() {
        let rows = ham_rows();
        let borrowed: Vec<(&str, &str)> = rows.iter().map(|(id, dx)| (id.as_str(), *dx)).collect();
        let (_dir, settings) = fixture(&borrowed, |i| Some(i % 2));

        let report = prepare_dataset(&settings).unwrap();

        assert_eq!(report.dropped_rows, 3);
        assert!(report.unmapped_codes.contains("unknown"));
        assert_eq!(report.copied, 35);
        assert_eq!(report.assigned_count(Split::Train) + report.assigned_count(Split::Val), 35);

        // 層化: Melanoma 10件 -> 検証2件、Benign 20件 -> 検証4件、Carcinoma 5件 -> 検証1件
        let val = settings.output_dir.join("val");
        assert_eq!(count_files(&val.join("Melanoma")), 2);
        assert_eq!(count_files(&val.join("Benign")), 4);
        assert_eq!(count_files(&val.join("Carcinoma")), 1);
        assert_eq!(count_files(&settings.output_dir.join("train").join("Benign")), 16);
        assert!(!settings.output_dir.join("train").join("unknown").exists());
    }

    #[test]
    fn test_missing_images_are_skipped() {
        let rows = [("ISIC_a", "mel"), ("ISIC_b", "mel"), ("ISIC_c", "nv"), ("ISIC_d", "nv")];
        let (_dir, settings) = fixture(&rows, |i| if i == 1 { None } else { Some(0) });

        let report = prepare_dataset(&settings).unwrap();

        assert_eq!(report.missing_images, vec!["ISIC_b.jpg".to_string()]);
        assert_eq!(report.copied, 3);
        assert_eq!(count_files(&settings.output_dir), 3);
    }

    #[test]
    fn test_rerun_duplicates_files() {
        let rows = [("ISIC_a", "mel"), ("ISIC_b", "mel"), ("ISIC_c", "nv"), ("ISIC_d", "nv")];
        let (_dir, settings) = fixture(&rows, |_| Some(1));

        prepare_dataset(&settings).unwrap();
        let first = count_files(&settings.output_dir);
        prepare_dataset(&settings).unwrap();
        let second = count_files(&settings.output_dir);

        // 再実行は冪等ではなく、重複ファイルが増える
        assert_eq!(first, 4);
        assert_eq!(second, 8);
    }

    #[test]
    fn test_rerun_with_skip_existing_is_noop() {
        let rows = [("ISIC_a", "mel"), ("ISIC_b", "mel"), ("ISIC_c", "nv"), ("ISIC_d", "nv")];
        let (_dir, mut settings) = fixture(&rows, |_| Some(0));
        settings.skip_existing = true;

        prepare_dataset(&settings).unwrap();
        let report = prepare_dataset(&settings).unwrap();

        assert_eq!(count_files(&settings.output_dir), 4);
        assert_eq!(report.copied, 0);
        assert_eq!(report.skipped_existing, 4);
    }

    #[test]
    fn test_all_rows_unmapped_is_error() {
        let rows = [("ISIC_a", "zzz")];
        let (_dir, settings) = fixture(&rows, |_| Some(0));
        assert!(prepare_dataset(&settings).is_err());
    }

    #[test]
    fn test_locate_image_search_order() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec!["p1".to_string(), "p2".to_string()];
        fs::create_dir_all(dir.path().join("p2")).unwrap();
        fs::write(dir.path().join("p2/x.jpg"), b"2").unwrap();
        fs::write(dir.path().join("x.jpg"), b"root").unwrap();

        assert_eq!(locate_image(dir.path(), &parts, "x.jpg"), Some(dir.path().join("p2/x.jpg")));
        assert_eq!(locate_image(dir.path(), &parts, "y.jpg"), None);
    }
}
