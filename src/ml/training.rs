//! モデル学習
//!
//! `<data_dir>/train/<label>/*` と `<data_dir>/val/<label>/*` のフォルダ構成から
//! 分類器を固定エポック数だけ学習し、最終エポックの重みをラベルマニフェストと
//! 一緒に保存します。

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use burn_dataset::Dataset;

use burn::{
    data::dataloader::{batcher::Batcher, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};

use crate::ml::ml_model::{CompactCnnConfig, ImageClassifier};
use crate::ml::preprocess::{resize_rgb, to_chw, Augmentation};
use crate::ml::resnet::ResNet18Config;
use crate::model::{
    save_model_with_metadata, Architecture, ClassLabelSet, ModelMetadata, Preprocessing, TrainingSettings,
};
use crate::types::Split;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// フォルダ型データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<ImageItem>,
    class_labels: ClassLabelSet,
}

impl ImageFolderDataset {
    /// サブディレクトリ名（名前順）をクラスとして読み込む
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        let labels = ClassLabelSet::from_directory(data_dir)?;
        Self::from_directory_with_labels(data_dir, &labels)
    }

    /// 指定された順序でクラスIDを割り当てて読み込む
    pub fn from_directory_with_labels(data_dir: &Path, class_labels: &ClassLabelSet) -> Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in class_labels.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                tracing::warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)
                .with_context(|| format!("ディレクトリを読めません: {}", class_dir.display()))?
            {
                let path = entry?.path();
                if path.is_file() && has_image_extension(&path) {
                    paths.push(path);
                }
            }
            // read_dir の順序は環境依存なので揃える
            paths.sort();

            tracing::info!("  クラス {}: {} ({} 枚)", class_id, class_name, paths.len());
            samples.extend(paths.into_iter().map(|path| ImageItem { path, label: class_id }));
        }

        Ok(Self {
            samples,
            class_labels: class_labels.clone(),
        })
    }

    pub fn class_labels(&self) -> &ClassLabelSet {
        &self.class_labels
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチ作成中に読み込めなかった画像
///
/// Batcher は Result を返せないため、ここに記録して学習ループ側で中断します。
#[derive(Debug, Clone, Default)]
pub struct LoadErrors(Arc<Mutex<Vec<String>>>);

impl LoadErrors {
    fn push(&self, message: String) {
        if let Ok(mut errors) = self.0.lock() {
            errors.push(message);
        }
    }

    /// 記録されたエラーがあれば Err を返す
    pub fn check(&self) -> Result<()> {
        let errors = self
            .0
            .lock()
            .map_err(|_| anyhow::anyhow!("画像読み込みエラーの記録にアクセスできません"))?;
        match errors.first() {
            Some(first) => Err(anyhow::anyhow!(
                "画像の読み込みに失敗しました ({} 件): {}",
                errors.len(),
                first
            )),
            None => Ok(()),
        }
    }
}

/// 画像ごとに乱数を決めるデータ拡張
///
/// 乱数はシード・エポック・画像パスだけから決まり、ワーカー数や取り出し順に依存しません。
#[derive(Clone)]
struct SeededAugmentation {
    augmentation: Augmentation,
    seed: u64,
    epoch: Arc<AtomicU64>,
}

impl SeededAugmentation {
    fn rng_for(&self, path: &Path) -> StdRng {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        self.epoch.load(Ordering::Relaxed).hash(&mut hasher);
        path.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    preprocessing: Preprocessing,
    augmentation: Option<SeededAugmentation>,
    errors: LoadErrors,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, preprocessing: Preprocessing, errors: LoadErrors) -> Self {
        Self {
            device,
            preprocessing,
            augmentation: None,
            errors,
        }
    }

    /// 学習用: ランダム反転・回転を有効にする
    ///
    /// `epoch` は学習ループがエポックの開始時に更新します。
    pub fn with_augmentation(mut self, augmentation: Augmentation, seed: u64, epoch: Arc<AtomicU64>) -> Self {
        self.augmentation = Some(SeededAugmentation {
            augmentation,
            seed,
            epoch,
        });
        self
    }

    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let image = image::open(path).with_context(|| format!("{}", path.display()))?;
        let mut rgb = resize_rgb(&image, self.preprocessing);

        if let Some(seeded) = &self.augmentation {
            let mut rng = seeded.rng_for(path);
            rgb = seeded.augmentation.apply(rgb, &mut rng);
        }

        Ok(to_chw(&rgb, self.preprocessing))
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.preprocessing.size() as usize;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.load(&item.path) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // 形を保つためにゼロで埋め、学習ループ側で中断させる
                    self.errors.push(format!("{:#}", e));
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// 1エポック分の結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochReport {
    /// 1始まり
    pub epoch: usize,
    /// サンプルあたりの平均学習損失
    pub train_loss: f64,
    /// 検証精度 [0, 1]
    pub val_accuracy: f64,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model_path: PathBuf,
    pub metadata: ModelMetadata,
    pub epochs: Vec<EpochReport>,
}

/// 学習/検証ディレクトリを読み込み、ラベル集合の一致を確認
pub fn load_datasets(data_dir: &Path) -> Result<(ImageFolderDataset, ImageFolderDataset)> {
    let train_dir = data_dir.join(Split::Train.dir_name());
    let val_dir = data_dir.join(Split::Val.dir_name());

    let class_labels = ClassLabelSet::from_directory(&train_dir)?;
    let val_labels = ClassLabelSet::from_directory(&val_dir)?;
    if class_labels != val_labels {
        anyhow::bail!(
            "学習データと検証データのクラスが一致しません: {} / {}",
            class_labels,
            val_labels
        );
    }
    tracing::info!("クラス順序 ({}個): {}", class_labels.len(), class_labels);

    let train = ImageFolderDataset::from_directory_with_labels(&train_dir, &class_labels)?;
    let val = ImageFolderDataset::from_directory_with_labels(&val_dir, &class_labels)?;

    if train.is_empty() {
        anyhow::bail!("学習データが見つかりません: {}", train_dir.display());
    }
    if val.is_empty() {
        anyhow::bail!("検証データが見つかりません: {}", val_dir.display());
    }

    Ok((train, val))
}

/// 設定に従ってモデルを学習し、アーカイブを保存
///
/// `on_epoch` はエポックごとに呼ばれます。
pub fn train_model<B, F>(settings: &TrainingSettings, device: B::Device, on_epoch: F) -> Result<TrainingOutcome>
where
    B: AutodiffBackend,
    F: FnMut(&EpochReport),
{
    let (dataset_train, dataset_val) = load_datasets(&settings.data_dir)?;
    let class_labels = dataset_train.class_labels().clone();
    let num_classes = class_labels.len();

    let mut preprocessing = settings.architecture.default_preprocessing();
    if let Some(size) = settings.image_size {
        preprocessing = match preprocessing {
            Preprocessing::ImageNet { .. } => Preprocessing::ImageNet { size },
            Preprocessing::UnitScale { .. } => Preprocessing::UnitScale { size },
        };
    }

    tracing::info!(
        "モデル設定: {} / {} クラス / 入力 {}x{}",
        settings.architecture,
        num_classes,
        preprocessing.size(),
        preprocessing.size()
    );
    tracing::info!("学習データ: {} 枚 / 検証データ: {} 枚", dataset_train.len(), dataset_val.len());

    let (model_binary, epochs) = match settings.architecture {
        Architecture::ResNet18 => {
            let config = ResNet18Config::new(num_classes);
            let model = match &settings.backbone_weights {
                Some(weights) => config.init_pretrained::<B>(weights, &device)?,
                None => {
                    tracing::warn!("事前学習済みの重みが指定されていません。ランダム初期化で学習します");
                    config.init::<B>(&device)
                }
            };
            fit(model, settings, preprocessing, dataset_train, dataset_val, device, on_epoch)?
        }
        Architecture::CompactCnn => {
            let model = CompactCnnConfig::new(num_classes)
                .with_image_size(preprocessing.size() as usize)
                .init::<B>(&device)?;
            fit(model, settings, preprocessing, dataset_train, dataset_val, device, on_epoch)?
        }
    };

    let metadata = ModelMetadata::new(
        class_labels,
        settings.architecture,
        preprocessing,
        settings.num_epochs as u32,
        epochs.last().map(|report| report.val_accuracy),
    );
    let model_path = save_model_with_metadata(&settings.output_model_path, &metadata, &model_binary)?;

    Ok(TrainingOutcome {
        model_path,
        metadata,
        epochs,
    })
}

/// 学習ループ本体
///
/// 最終エポックの重み（バイナリ）と各エポックの結果を返します。
fn fit<B, M, F>(
    mut model: M,
    settings: &TrainingSettings,
    preprocessing: Preprocessing,
    dataset_train: ImageFolderDataset,
    dataset_val: ImageFolderDataset,
    device: B::Device,
    mut on_epoch: F,
) -> Result<(Vec<u8>, Vec<EpochReport>)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B> + 'static,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    F: FnMut(&EpochReport),
{
    if settings.num_epochs == 0 || settings.batch_size == 0 {
        anyhow::bail!("エポック数とバッチサイズは1以上である必要があります");
    }

    let errors = LoadErrors::default();
    let current_epoch = Arc::new(AtomicU64::new(0));

    let mut batcher_train = ImageBatcher::<B>::new(device.clone(), preprocessing, errors.clone());
    if settings.augment {
        batcher_train =
            batcher_train.with_augmentation(Augmentation::default(), settings.seed, current_epoch.clone());
    }
    let batcher_val = ImageBatcher::<B::InnerBackend>::new(device.clone(), preprocessing, errors.clone());

    let total_train = dataset_train.len();
    let total_batches = total_train.div_ceil(settings.batch_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(dataset_val);

    let mut optimizer = AdamConfig::new().init();
    let mut reports = Vec::with_capacity(settings.num_epochs);

    tracing::info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    for epoch in 1..=settings.num_epochs {
        current_epoch.store(epoch as u64, Ordering::Relaxed);
        let mut running_loss = 0.0;
        let mut seen = 0usize;

        for (iteration, batch) in dataloader_train.iter().enumerate() {
            errors.check()?;

            let batch_size = batch.targets.dims()[0];
            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = output.loss.clone().into_scalar().elem();

            if !loss_value.is_finite() {
                anyhow::bail!("損失が発散しました (epoch {}, batch {})", epoch, iteration + 1);
            }

            running_loss += loss_value * batch_size as f64;
            seen += batch_size;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(settings.learning_rate, model, grads);

            if settings.show_progress {
                tracing::info!(
                    "Epoch {}/{} [{}/{}] loss: {:.4}",
                    epoch,
                    settings.num_epochs,
                    iteration + 1,
                    total_batches,
                    loss_value
                );
            }
        }
        errors.check()?;

        let train_loss = if seen > 0 { running_loss / seen as f64 } else { 0.0 };

        // 検証（勾配なし）
        let model_valid = model.valid();
        let mut correct = 0usize;
        let mut total = 0usize;
        for batch in dataloader_val.iter() {
            errors.check()?;

            let output = model_valid.forward(batch.images);
            let [n, _] = output.dims();
            let predictions = output.argmax(1).reshape([n]);
            let batch_correct: i64 = predictions
                .equal(batch.targets)
                .int()
                .sum()
                .into_scalar()
                .elem();

            correct += batch_correct as usize;
            total += n;
        }
        errors.check()?;

        let val_accuracy = if total > 0 { correct as f64 / total as f64 } else { 0.0 };
        let report = EpochReport {
            epoch,
            train_loss,
            val_accuracy,
        };

        tracing::info!(
            "Epoch [{}/{}], Loss: {:.4}, Val Acc: {:.4}",
            epoch,
            settings.num_epochs,
            train_loss,
            val_accuracy
        );
        on_epoch(&report);
        reports.push(report);
    }

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;

    Ok((model_binary, reports))
}
