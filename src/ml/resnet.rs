//! ResNet18
//!
//! 標準的なResNet18構成（7x7 stem, BasicBlock x 2 を4段, Global Average Pool）。
//! 転移学習では1000クラスの事前学習済み重みを読み込んだ後、
//! 最終全結合層だけをクラス数に合わせて差し替えます。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use std::path::Path;

use crate::ml::ml_model::{linear_output_dim, ImageClassifier};

/// 最終段の出力チャネル数
const FEATURE_CHANNELS: usize = 512;

/// ImageNet 事前学習時のクラス数
pub const IMAGENET_CLASSES: usize = 1000;

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

/// 3x3 Conv x 2 の残差ブロック
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: conv3x3(in_channels, out_channels, stride, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, 1, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            activation: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.bn.forward(down.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = self.activation.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));

        self.activation.forward(x + identity)
    }
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn stage<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Vec<BasicBlock<B>> {
    vec![
        BasicBlock::new(in_channels, out_channels, stride, device),
        BasicBlock::new(out_channels, out_channels, 1, device),
    ]
}

#[derive(Config, Debug)]
pub struct ResNet18Config {
    pub num_classes: usize,
}

impl ResNet18Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet18<B> {
        ResNet18 {
            conv1: Conv2dConfig::new([3, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(64).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: stage(64, 64, 1, device),
            layer2: stage(64, 128, 2, device),
            layer3: stage(128, 256, 2, device),
            layer4: stage(256, FEATURE_CHANNELS, 2, device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(FEATURE_CHANNELS, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }

    /// 事前学習済みバックボーンを読み込み、分類層を差し替えたモデルを作る
    ///
    /// `weights` は1000クラスのResNet18を NamedMpk 形式で保存したレコード。
    pub fn init_pretrained<B: Backend>(&self, weights: &Path, device: &B::Device) -> anyhow::Result<ResNet18<B>> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let backbone = ResNet18Config::new(IMAGENET_CLASSES)
            .init::<B>(device)
            .load_file(weights.to_path_buf(), &recorder, device)
            .map_err(|e| anyhow::anyhow!("バックボーン重みの読み込みエラー ({}): {:?}", weights.display(), e))?;

        tracing::info!("事前学習済みバックボーンを読み込みました: {}", weights.display());
        Ok(backbone.with_head(self.num_classes, device))
    }
}

#[derive(Module, Debug)]
pub struct ResNet18<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    maxpool: MaxPool2d,
    layer1: Vec<BasicBlock<B>>,
    layer2: Vec<BasicBlock<B>>,
    layer3: Vec<BasicBlock<B>>,
    layer4: Vec<BasicBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ResNet18<B> {
    /// 最終全結合層を新しいクラス数で作り直す
    pub fn with_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.fc = LinearConfig::new(FEATURE_CHANNELS, num_classes).init(device);
        self
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet18<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.activation.forward(self.bn1.forward(x));
        let mut x = self.maxpool.forward(x);

        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }

        let x = self.avgpool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        self.fc.forward(x.reshape([batch_size, channels]))
    }

    fn num_classes(&self) -> usize {
        linear_output_dim(&self.fc)
    }
}
