use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::csv_loader::MetadataRecord;
use crate::types::LabeledSample;

/// 診断コード -> クラスラベルの対応表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosisMap(BTreeMap<String, String>);

impl Default for DiagnosisMap {
    /// HAM10000 の7コードを 3クラス（Melanoma / Benign / Carcinoma）に集約
    fn default() -> Self {
        let pairs = [
            ("mel", "Melanoma"),
            ("nv", "Benign"),
            ("bkl", "Benign"),
            ("df", "Benign"),
            ("vasc", "Benign"),
            ("bcc", "Carcinoma"),
            ("akiec", "Carcinoma"),
        ];
        Self(
            pairs
                .iter()
                .map(|(code, label)| (code.to_string(), label.to_string()))
                .collect(),
        )
    }
}

impl DiagnosisMap {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn label_for(&self, code: &str) -> Option<&str> {
        self.0.get(code).map(String::as_str)
    }

    /// 出力されうるラベル（重複なし、名前順）
    pub fn labels(&self) -> BTreeSet<&str> {
        self.0.values().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// メタデータ行にラベルを付ける
///
/// 対応表にないコードの行は除外し、除外したコードの一覧を返します。
pub fn map_records(
    records: &[MetadataRecord],
    map: &DiagnosisMap,
) -> (Vec<LabeledSample>, BTreeSet<String>) {
    let mut samples = Vec::with_capacity(records.len());
    let mut unmapped = BTreeSet::new();

    for record in records {
        match map.label_for(&record.dx) {
            Some(label) => samples.push(LabeledSample {
                image_id: record.image_id.clone(),
                diagnosis_code: record.dx.clone(),
                label: label.to_string(),
            }),
            None => {
                unmapped.insert(record.dx.clone());
            }
        }
    }

    if !unmapped.is_empty() {
        let codes: Vec<&str> = unmapped.iter().map(String::as_str).collect();
        tracing::warn!(
            "対応表にない診断コードの行を除外しました: {} ({} 行)",
            codes.join(", "),
            records.len() - samples.len()
        );
    }

    (samples, unmapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(image_id: &str, dx: &str) -> MetadataRecord {
        MetadataRecord {
            image_id: image_id.to_string(),
            dx: dx.to_string(),
        }
    }

    #[test]
    fn test_default_map() {
        let map = DiagnosisMap::default();
        assert_eq!(map.label_for("mel"), Some("Melanoma"));
        assert_eq!(map.label_for("vasc"), Some("Benign"));
        assert_eq!(map.label_for("akiec"), Some("Carcinoma"));
        assert_eq!(map.label_for("xyz"), None);
        assert_eq!(
            map.labels().into_iter().collect::<Vec<_>>(),
            vec!["Benign", "Carcinoma", "Melanoma"]
        );
    }

    #[test]
    fn test_unmapped_rows_dropped() {
        let records = vec![
            record("a", "mel"),
            record("b", "unknown"),
            record("c", "nv"),
            record("d", "unknown"),
            record("e", "other"),
        ];
        let (samples, unmapped) = map_records(&records, &DiagnosisMap::default());

        let ids: Vec<&str> = samples.iter().map(|s| s.image_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(samples[1].label, "Benign");
        assert_eq!(unmapped.into_iter().collect::<Vec<_>>(), vec!["other", "unknown"]);
    }

    #[test]
    fn test_custom_map_from_json() {
        let map: DiagnosisMap = serde_json::from_str(r#"{"mel": "Melanoma", "nv": "Nevus"}"#).unwrap();
        assert_eq!(map.label_for("nv"), Some("Nevus"));
        assert_eq!(map.label_for("bkl"), None);
    }
}
