//! 推論HTTPサーバー

use std::path::PathBuf;

use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::Parser;

use skin_lesion_lib::logging::init_tracing;
use skin_lesion_lib::ml::InferenceEngine;
use skin_lesion_lib::model::{AppConfig, DeviceType};
use skin_lesion_lib::server::{serve, ResponseStyle};
use skin_lesion_lib::Predictor;

#[derive(Parser)]
#[command(about = "Serve POST /predict for a trained skin lesion model archive")]
struct Args {
    /// 設定ファイル (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// モデルアーカイブ (.tar.gz)
    #[arg(long)]
    model: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// cpu | wgpu
    #[arg(long)]
    device: Option<DeviceType>,

    /// detailed | label-only
    #[arg(long)]
    style: Option<ResponseStyle>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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

    let mut settings = config.server;
    if let Some(model) = args.model {
        settings.model_path = model;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(style) = args.style {
        settings.response_style = style;
    }

    // モデルは起動時に1回だけ読み込む
    let predictor: Box<dyn Predictor> = match config.device_type {
        DeviceType::Wgpu => Box::new(InferenceEngine::<Wgpu>::load(&settings.model_path, WgpuDevice::default())?),
        DeviceType::Cpu => Box::new(InferenceEngine::<NdArray>::load(&settings.model_path, NdArrayDevice::Cpu)?),
    };

    serve(predictor, &settings).await
}
