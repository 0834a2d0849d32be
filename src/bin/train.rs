/// Train the 3D segmentation transformer on a volume dataset
use std::path::PathBuf;

use clap::Parser;
use segmentation_voxel::config::{DeviceKind, ViewerKind};
use segmentation_voxel::{Config, SegmentationTrainer};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a transformer voxel segmentation model")]
struct Args {
    /// JSON configuration file; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Compute device: auto, cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    device: Option<DeviceKind>,
    /// Number of training epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Dataset root holding the train/ and val/ splits.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Per-epoch output viewer: terminal, npy or none.
    #[arg(long)]
    viewer: Option<ViewerKind>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(root) = args.data_root {
        config.data.root = root;
    }
    if let Some(viewer) = args.viewer {
        config.visualization.viewer = viewer;
    }

    log::info!("=== Voxel segmentation training ===");
    log::info!("Configuration: {:#?}", config);

    let mut trainer = SegmentationTrainer::new(config)?;
    trainer.train()?;

    Ok(())
}
