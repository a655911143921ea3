//! モデル推論機能

use anyhow::Result;
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};

use crate::ml::ml_model::{CompactCnn, CompactCnnConfig, ImageClassifier};
use crate::ml::preprocess::preprocess;
use crate::ml::resnet::{ResNet18, ResNet18Config};
use crate::model::{load_model_with_metadata, log_metadata_info, Architecture, ClassLabelSet, ModelMetadata};
use crate::predictor::{classify_logits, InferenceError, Predictor};
use crate::types::PredictionResult;

/// アーカイブから復元したネットワーク
#[derive(Debug)]
pub enum ClassifierNet<B: Backend> {
    ResNet18(ResNet18<B>),
    Compact(CompactCnn<B>),
}

impl<B: Backend> ClassifierNet<B> {
    /// メタデータの構成で初期化し、重みを読み込む
    pub fn from_binary(metadata: &ModelMetadata, model_binary: Vec<u8>, device: &B::Device) -> Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let num_classes = metadata.num_classes();

        let net = match metadata.architecture {
            Architecture::ResNet18 => {
                let model = ResNet18Config::new(num_classes).init::<B>(device);
                let record = recorder
                    .load(model_binary, device)
                    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
                ClassifierNet::ResNet18(model.load_record(record))
            }
            Architecture::CompactCnn => {
                let config = CompactCnnConfig::new(num_classes).with_image_size(metadata.preprocessing.size() as usize);
                let model = config.init::<B>(device)?;
                let record = recorder
                    .load(model_binary, device)
                    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
                let model = model.load_record(record);

                // fc1 の入力次元は入力サイズから決まる
                let expected = config.feature_dim().unwrap_or_default();
                if model.feature_input_dim() != expected {
                    anyhow::bail!(
                        "重みの特徴次元 {} が入力サイズ {} の特徴次元 {} と一致しません",
                        model.feature_input_dim(),
                        metadata.preprocessing.size(),
                        expected
                    );
                }
                ClassifierNet::Compact(model)
            }
        };

        if net.num_classes() != num_classes {
            anyhow::bail!(
                "モデルの出力次元 {} がラベル数 {} と一致しません",
                net.num_classes(),
                num_classes
            );
        }

        Ok(net)
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            ClassifierNet::ResNet18(model) => model.forward(images),
            ClassifierNet::Compact(model) => model.forward(images),
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ClassifierNet::ResNet18(model) => model.num_classes(),
            ClassifierNet::Compact(model) => model.num_classes(),
        }
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    net: ClassifierNet<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルアーカイブを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        log_metadata_info(&metadata);
        Self::from_parts(metadata, model_binary, device)
    }

    /// メタデータと重みバイナリから初期化
    pub fn from_parts(metadata: ModelMetadata, model_binary: Vec<u8>, device: B::Device) -> Result<Self> {
        let net = ClassifierNet::from_binary(&metadata, model_binary, &device)?;
        Ok(Self { net, metadata, device })
    }

    /// 画像バイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<PredictionResult, InferenceError> {
        if bytes.is_empty() {
            return Err(InferenceError::EmptyUpload);
        }
        let image = image::load_from_memory(bytes).map_err(|e| InferenceError::InvalidImage(e.to_string()))?;
        self.classify_dynamic(&image)
    }

    /// 画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<PredictionResult, InferenceError> {
        let image = image::open(image_path.as_ref()).map_err(|e| InferenceError::InvalidImage(e.to_string()))?;
        self.classify_dynamic(&image)
    }

    fn classify_dynamic(&self, image: &image::DynamicImage) -> Result<PredictionResult, InferenceError> {
        let preprocessing = self.metadata.preprocessing;
        let size = preprocessing.size() as usize;
        let image_data = preprocess(image, preprocessing);

        // [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device).reshape([1, 3, size, size]);

        let logits = self
            .net
            .forward(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Tensor(format!("{:?}", e)))?;

        classify_logits(&self.metadata.class_labels, &logits)
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 読み込んだ重みの出力次元
    pub fn num_classes(&self) -> usize {
        self.net.num_classes()
    }
}

impl<B: Backend> Predictor for InferenceEngine<B> {
    fn classify(&self, bytes: &[u8]) -> Result<PredictionResult, InferenceError> {
        self.classify_bytes(bytes)
    }

    fn labels(&self) -> &ClassLabelSet {
        &self.metadata.class_labels
    }

    fn describe(&self) -> String {
        self.metadata.architecture.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{save_model_with_metadata, Preprocessing};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    type TestBackend = NdArray;

    fn labels() -> ClassLabelSet {
        ClassLabelSet::new(vec!["Benign".into(), "Carcinoma".into(), "Melanoma".into()]).unwrap()
    }

    fn compact_engine(class_labels: ClassLabelSet) -> InferenceEngine<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let model = CompactCnnConfig::new(class_labels.len())
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();
        let binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.into_record(), ())
            .unwrap();
        let metadata = ModelMetadata::new(
            class_labels,
            Architecture::CompactCnn,
            Preprocessing::UnitScale { size: 32 },
            1,
            None,
        );
        InferenceEngine::from_parts(metadata, binary, device).unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(width, height, Rgb([180, 90, 60]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_classify_valid_image() {
        let engine = compact_engine(labels());

        // 入力サイズと異なる画像もリサイズされる
        let result = engine.classify_bytes(&png_bytes(50, 70)).unwrap();

        assert!(labels().index_of(&result.label).is_some());
        assert!((0.0..=1.0).contains(&result.confidence));
        let sum: f32 = result.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_image_is_client_error() {
        let engine = compact_engine(labels());

        let err = engine.classify_bytes(b"definitely not an image").unwrap_err();
        assert!(err.is_client_error());
        assert!(!err.to_string().is_empty());

        assert!(matches!(engine.classify_bytes(&[]), Err(InferenceError::EmptyUpload)));
    }

    fn compact_binary(num_classes: usize, image_size: usize) -> Vec<u8> {
        let model = CompactCnnConfig::new(num_classes)
            .with_image_size(image_size)
            .init::<TestBackend>(&NdArrayDevice::Cpu)
            .unwrap();
        BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.into_record(), ())
            .unwrap()
    }

    #[test]
    fn test_head_mismatch_is_rejected() {
        let metadata = ModelMetadata::new(labels(), Architecture::CompactCnn, Preprocessing::UnitScale { size: 32 }, 1, None);

        let result = InferenceEngine::<TestBackend>::from_parts(metadata, compact_binary(2, 32), NdArrayDevice::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_input_size_mismatch_is_rejected() {
        let metadata = ModelMetadata::new(labels(), Architecture::CompactCnn, Preprocessing::UnitScale { size: 48 }, 1, None);

        let result = InferenceEngine::<TestBackend>::from_parts(metadata, compact_binary(3, 32), NdArrayDevice::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ResNet18Config::new(3).init::<TestBackend>(&device);
        let binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.into_record(), ())
            .unwrap();
        let metadata = ModelMetadata::new(labels(), Architecture::ResNet18, Preprocessing::ImageNet { size: 64 }, 1, Some(0.5));
        let path = save_model_with_metadata(&dir.path().join("skin"), &metadata, &binary).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&path, device).unwrap();

        assert_eq!(engine.describe(), "resnet18");
        assert_eq!(engine.labels(), &labels());
        let result = engine.classify_bytes(&png_bytes(80, 80)).unwrap();
        assert!(labels().index_of(&result.label).is_some());
    }
}
