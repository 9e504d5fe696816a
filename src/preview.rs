use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_circle_mut};
use tracing::info;

use crate::error::{RegistrationError, Result};
use crate::nrrd::Volume;

const MARKER_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const MARKER_RADIUS: i32 = 6;

/// How the fused slice is rendered
#[derive(Debug, Clone, Default)]
pub struct PreviewOptions {
    /// Axial slice index; the middle slice when unset
    pub slice: Option<usize>,
    /// Green/magenta overlay instead of a grayscale blend
    pub colored: bool,
    /// In-plane voxel (i, j) to mark
    pub marker: Option<(u32, u32)>,
}

/// Robust intensity window: 1st and 99th percentile
///
/// Large volumes are subsampled to roughly 100k voxels before sorting.
pub fn intensity_window(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 1.0);
    }
    let stride = (data.len() / 100_000).max(1);
    let mut samples: Vec<f64> = data
        .iter()
        .step_by(stride)
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if samples.is_empty() {
        return (0.0, 1.0);
    }
    samples.sort_by(f64::total_cmp);

    let at = |q: f64| samples[((samples.len() - 1) as f64 * q).round() as usize];
    let (lo, hi) = (at(0.01), at(0.99));
    if hi > lo {
        (lo, hi)
    } else {
        (lo, lo + 1.0)
    }
}

fn normalize(value: f64, window: (f64, f64)) -> u8 {
    let (lo, hi) = window;
    ((value - lo) / (hi - lo) * 255.0).clamp(0.0, 255.0) as u8
}

/// Fuse one axial slice of two volumes on the same grid
///
/// Colored: fixed in green, registered in magenta, so aligned structures
/// turn gray. Uncolored: plain average.
pub fn fuse_slice(
    fixed: &Volume,
    registered: &Volume,
    slice: usize,
    colored: bool,
) -> Result<RgbImage> {
    if fixed.size() != registered.size() {
        return Err(RegistrationError::DimensionMismatch {
            expected: fixed.size(),
            actual: registered.size(),
        });
    }
    let [nx, ny, nz] = fixed.size();
    if fixed.data.is_empty() {
        return Err(RegistrationError::invalid_configuration(
            "cannot preview an empty volume",
        ));
    }
    let k = slice.min(nz - 1);

    let fixed_window = intensity_window(&fixed.data);
    let moving_window = intensity_window(&registered.data);

    let mut img = RgbImage::new(nx as u32, ny as u32);
    for j in 0..ny {
        for i in 0..nx {
            let f = normalize(fixed.get(i, j, k), fixed_window);
            let m = normalize(registered.get(i, j, k), moving_window);
            let pixel = if colored {
                Rgb([m, f, m])
            } else {
                let avg = ((f as u16 + m as u16) / 2) as u8;
                Rgb([avg, avg, avg])
            };
            img.put_pixel(i as u32, j as u32, pixel);
        }
    }

    Ok(img)
}

/// Render the fused preview, mark the landmark and save it as PNG
pub fn write_preview(
    fixed: &Volume,
    registered: &Volume,
    path: &Path,
    options: &PreviewOptions,
) -> Result<()> {
    let slice = options.slice.unwrap_or(fixed.size()[2] / 2);
    let mut img = fuse_slice(fixed, registered, slice, options.colored)?;

    if let Some((x, y)) = options.marker {
        let (x, y) = (x as i32, y as i32);
        draw_cross_mut(&mut img, MARKER_COLOR, x, y);
        draw_hollow_circle_mut(&mut img, (x, y), MARKER_RADIUS, MARKER_COLOR);
    }

    img.save(path)?;
    info!("Saved preview (slice {}): {:?}", slice, path);
    Ok(())
}
