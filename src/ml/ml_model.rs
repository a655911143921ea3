//! 機械学習モデルの共通定義
//!
//! 分類モデル共通のトレイトと、小型CNN（CompactCnn）を提供します。
//! ResNet18 は `resnet` モジュールにあります。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

/// 画像分類モデル
///
/// 入力 [batch_size, 3, size, size] -> ロジット [batch_size, num_classes]
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// 出力層の次元（クラス数）
    fn num_classes(&self) -> usize;

    /// 順伝播と損失計算（学習用）
    fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 全結合層の出力次元
pub(crate) fn linear_output_dim<B: Backend>(linear: &Linear<B>) -> usize {
    linear.weight.val().dims()[1]
}

/// CompactCnn の設定
#[derive(Config, Debug)]
pub struct CompactCnnConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 150)]
    pub image_size: usize,
    /// 全結合層の隠れユニット数
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl CompactCnnConfig {
    /// Flatten 後の特徴次元
    ///
    /// 3x3 Conv (no padding) で 2 減少、2x2 Pool で半分（切り捨て）を3回繰り返す。
    pub fn feature_dim(&self) -> Option<usize> {
        let mut size = self.image_size;
        for _ in 0..3 {
            size = size.checked_sub(2)? / 2;
        }
        (size > 0).then_some(128 * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> anyhow::Result<CompactCnn<B>> {
        let d = self.feature_dim().ok_or_else(|| {
            anyhow::anyhow!("入力サイズが小さすぎます: {} (最小22x22が必要)", self.image_size)
        })?;

        tracing::debug!(
            "[CompactCnn] 入力 {}x{}, 特徴次元 {}, FC {} -> {} -> {}",
            self.image_size,
            self.image_size,
            d,
            d,
            self.hidden_size,
            self.num_classes
        );

        Ok(CompactCnn {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 小型CNN
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 3層 (32, 64, 128 ch)
/// - Flatten
/// - FC: d -> 128 + ReLU + Dropout
/// - FC: 128 -> num_classes
#[derive(Module, Debug)]
pub struct CompactCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> CompactCnn<B> {
    /// fc1 の入力次元（Flatten 後の特徴次元）
    pub fn feature_input_dim(&self) -> usize {
        self.fc1.weight.val().dims()[0]
    }
}

impl<B: Backend> ImageClassifier<B> for CompactCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    fn num_classes(&self) -> usize {
        linear_output_dim(&self.fc2)
    }
}
