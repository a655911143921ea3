//! メタデータCSVから学習用フォルダ構成を作成する

use std::path::PathBuf;

use clap::Parser;

use skin_lesion_lib::logging::init_tracing;
use skin_lesion_lib::model::AppConfig;
use skin_lesion_lib::prepare::prepare_dataset;
use skin_lesion_lib::Split;

#[derive(Parser)]
#[command(about = "Split HAM10000-style metadata into train/val class folders")]
struct Args {
    /// 設定ファイル (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// メタデータCSV
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// 元画像のルートディレクトリ
    #[arg(long)]
    images: Option<PathBuf>,

    /// 出力先
    #[arg(long)]
    output: Option<PathBuf>,

    /// 検証データの割合 [0, 1)
    #[arg(long)]
    val_ratio: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// 既にあるファイルはコピーしない
    #[arg(long)]
    skip_existing: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(None),
    };

    let mut settings = config.preparation;
    if let Some(metadata) = args.metadata {
        settings.metadata_path = metadata;
    }
    if let Some(images) = args.images {
        settings.image_dir = images;
    }
    if let Some(output) = args.output {
        settings.output_dir = output;
    }
    if let Some(val_ratio) = args.val_ratio {
        settings.val_ratio = val_ratio;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    settings.skip_existing |= args.skip_existing;

    let report = prepare_dataset(&settings)?;

    println!(
        "train: {} / val: {} / copied: {} / missing: {} / dropped rows: {}",
        report.assigned_count(Split::Train),
        report.assigned_count(Split::Val),
        report.copied,
        report.missing_images.len(),
        report.dropped_rows
    );
    Ok(())
}
