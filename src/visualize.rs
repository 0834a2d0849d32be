/// Volume display for the per-epoch output snapshot
///
/// A viewer opens, renders and closes its view within a single `show` call.
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use ndarray::{Array2, Array3, Axis};
use ndarray_npy::WriteNpyExt;

use crate::config::{ViewerKind, VisualizationConfig};

/// Displays a single [depth, height, width] volume
pub trait VolumeViewer {
    fn show(&mut self, volume: &Array3<f32>) -> crate::Result<()>;
}

/// Shading ramp from low to high intensity
const RAMP: &[u8] = b" .:-=+*#%@";

/// Maximum-intensity projection along depth
pub fn max_intensity_projection(volume: &Array3<f32>) -> Array2<f32> {
    volume.fold_axis(Axis(0), f32::NEG_INFINITY, |&acc, &x| acc.max(x))
}

/// Render a volume's projection as text, one character per column
///
/// Columns are subsampled so the image is at most `max_width` characters
/// wide; rows follow the same stride.
pub fn render_projection(volume: &Array3<f32>, max_width: usize) -> String {
    let projection = max_intensity_projection(volume);
    let (height, width) = projection.dim();

    let (lo, hi) = projection
        .iter()
        .filter(|x| x.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let range = hi - lo;

    let stride = ((width + max_width.max(1) - 1) / max_width.max(1)).max(1);
    let mut out = String::with_capacity((height / stride + 1) * (width / stride + 1));

    for row in (0..height).step_by(stride) {
        for col in (0..width).step_by(stride) {
            let x = projection[[row, col]];
            let level = if !x.is_finite() || !(range > 0.0) {
                0
            } else {
                (((x - lo) / range) * (RAMP.len() - 1) as f32).round() as usize
            };
            out.push(RAMP[level.min(RAMP.len() - 1)] as char);
        }
        out.push('\n');
    }

    out
}

/// Prints a shaded maximum-intensity projection to stdout
pub struct TerminalViewer {
    max_width: usize,
}

impl TerminalViewer {
    pub fn new(max_width: usize) -> Self {
        Self { max_width }
    }
}

impl Default for TerminalViewer {
    fn default() -> Self {
        Self::new(64)
    }
}

impl VolumeViewer for TerminalViewer {
    fn show(&mut self, volume: &Array3<f32>) -> crate::Result<()> {
        let (depth, height, width) = volume.dim();
        let image = render_projection(volume, self.max_width);

        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(
            handle,
            "Volume {}x{}x{} (max-intensity projection over depth)",
            depth, height, width
        )?;
        handle.write_all(image.as_bytes())?;
        handle.flush()?;

        Ok(())
    }
}

/// Writes every shown volume to `<dir>/volume_<n>.npy`
pub struct NpySnapshotViewer {
    output_dir: PathBuf,
    count: usize,
}

impl NpySnapshotViewer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            count: 0,
        }
    }

    /// Number of snapshots written
    pub fn count(&self) -> usize {
        self.count
    }
}

impl VolumeViewer for NpySnapshotViewer {
    fn show(&mut self, volume: &Array3<f32>) -> crate::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self
            .output_dir
            .join(format!("volume_{:04}.npy", self.count));
        volume.write_npy(File::create(&path)?)?;
        self.count += 1;

        log::info!("Saved output volume {:?} to {:?}", volume.dim(), path);
        Ok(())
    }
}

/// Discards every volume
#[derive(Debug, Default)]
pub struct NoopViewer;

impl VolumeViewer for NoopViewer {
    fn show(&mut self, _volume: &Array3<f32>) -> crate::Result<()> {
        Ok(())
    }
}

pub fn build_viewer(config: &VisualizationConfig) -> Box<dyn VolumeViewer> {
    match config.viewer {
        ViewerKind::Terminal => Box::new(TerminalViewer::default()),
        ViewerKind::Npy => Box::new(NpySnapshotViewer::new(config.output_dir.clone())),
        ViewerKind::None => Box::new(NoopViewer),
    }
}
