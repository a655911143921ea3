//! クラスラベル集合
//!
//! インデックス位置がモデル出力層のインデックスに対応します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 順序付きクラスラベル集合（空・重複なし）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ClassLabelSet {
    labels: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelSetError {
    #[error("class label set is empty")]
    Empty,
    #[error("duplicate class label: {0}")]
    Duplicate(String),
    #[error("blank class label at index {0}")]
    Blank(usize),
}

impl ClassLabelSet {
    pub fn new(labels: Vec<String>) -> Result<Self, LabelSetError> {
        if labels.is_empty() {
            return Err(LabelSetError::Empty);
        }
        for (i, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(LabelSetError::Blank(i));
            }
            if labels[..i].contains(label) {
                return Err(LabelSetError::Duplicate(label.clone()));
            }
        }
        Ok(Self { labels })
    }

    /// データセットディレクトリのサブディレクトリ名からラベル集合を作る
    ///
    /// フォルダ型データセットの慣例どおり名前順にソートします。
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(data_dir)
            .with_context(|| format!("ディレクトリを読めません: {}", data_dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        labels.push(name.to_string());
                    }
                }
            }
        }
        labels.sort();

        Self::new(labels)
            .with_context(|| format!("クラスディレクトリが見つかりません: {}", data_dir.display()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// クラスインデックスからラベルを取得
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// ラベルからクラスインデックスを取得
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

impl TryFrom<Vec<String>> for ClassLabelSet {
    type Error = LabelSetError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(labels)
    }
}

impl From<ClassLabelSet> for Vec<String> {
    fn from(set: ClassLabelSet) -> Self {
        set.labels
    }
}

impl std::fmt::Display for ClassLabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.labels.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_index_mapping() {
        let set = ClassLabelSet::new(labels(&["Melanoma", "Benign", "Carcinoma"])).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.label(1), Some("Benign"));
        assert_eq!(set.index_of("Carcinoma"), Some(2));
        assert_eq!(set.label(3), None);
    }

    #[test]
    fn test_invalid_sets() {
        assert_eq!(ClassLabelSet::new(vec![]), Err(LabelSetError::Empty));
        assert_eq!(
            ClassLabelSet::new(labels(&["a", "b", "a"])),
            Err(LabelSetError::Duplicate("a".into()))
        );
        assert_eq!(ClassLabelSet::new(labels(&["a", " "])), Err(LabelSetError::Blank(1)));
    }

    #[test]
    fn test_from_directory_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Melanoma", "Benign", "Carcinoma"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let set = ClassLabelSet::from_directory(dir.path()).unwrap();
        assert_eq!(set.as_slice(), &labels(&["Benign", "Carcinoma", "Melanoma"])[..]);
    }
}
