#![recursion_limit = "256"]

//! 皮膚病変分類モデルの学習

use std::path::PathBuf;

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::Parser;

use skin_lesion_lib::logging::init_tracing;
use skin_lesion_lib::ml::{train_model, EpochReport, TrainingOutcome};
use skin_lesion_lib::model::{AppConfig, Architecture, DeviceType, TrainingSettings};

#[derive(Parser)]
#[command(about = "Train the skin lesion classifier on <data>/train and <data>/val")]
struct Args {
    /// 設定ファイル (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// train/ と val/ を含むディレクトリ
    #[arg(long)]
    data: Option<PathBuf>,

    /// モデルアーカイブの出力先
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// resnet18 | compact-cnn
    #[arg(long)]
    architecture: Option<Architecture>,

    /// ResNet18 の事前学習済み重み (NamedMpk)
    #[arg(long)]
    backbone: Option<PathBuf>,

    /// cpu | wgpu
    #[arg(long)]
    device: Option<DeviceType>,

    /// バッチごとの損失を表示
    #[arg(long)]
    progress: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(None),
    };
    if let Some(device) = args.device {
        config.device_type = device;
    }
    config.log_summary();

    let mut settings = config.training;
    if let Some(data) = args.data {
        settings.data_dir = data;
    }
    if let Some(output) = args.output {
        settings.output_model_path = output;
    }
    if let Some(epochs) = args.epochs {
        settings.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        settings.learning_rate = learning_rate;
    }
    if let Some(architecture) = args.architecture {
        settings.architecture = architecture;
    }
    if let Some(backbone) = args.backbone {
        settings.backbone_weights = Some(backbone);
    }
    settings.show_progress |= args.progress;

    let outcome = match config.device_type {
        DeviceType::Wgpu => run::<Autodiff<Wgpu>>(&settings, WgpuDevice::default())?,
        DeviceType::Cpu => run::<Autodiff<NdArray>>(&settings, NdArrayDevice::Cpu)?,
    };

    println!("Model saved to {}", outcome.model_path.display());
    println!("Classes: {}", outcome.metadata.class_labels);
    Ok(())
}

fn run<B: burn::tensor::backend::AutodiffBackend>(
    settings: &TrainingSettings,
    device: B::Device,
) -> anyhow::Result<TrainingOutcome> {
    tracing::info!("使用デバイス: {:?}", device);
    train_model::<B, _>(settings, device, |report: &EpochReport| {
        println!(
            "Epoch [{}/{}], Loss: {:.4}, Val Acc: {:.4}",
            report.epoch, settings.num_epochs, report.train_loss, report.val_accuracy
        );
    })
}
