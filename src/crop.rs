use std::path::Path;

use nalgebra::Point3;
use tracing::{debug, info};

use crate::error::{RegistrationError, Result};
use crate::geometry::VolumeGeometry;
use crate::nrrd::{write_nrrd, Encoding, Volume};

/// Box of voxels, inclusive start, `size` voxels along each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub start: [usize; 3],
    pub size: [usize; 3],
}

impl CropRegion {
    /// Region of `length_mm` centred on `center`, clamped to the image
    ///
    /// The half-width on each axis is `round(length / 2 / spacing)` voxels.
    /// A clamped region always keeps at least the centre voxel.
    pub fn around(geometry: &VolumeGeometry, center: [i64; 3], length_mm: [f64; 3]) -> Self {
        let mut start = [0; 3];
        let mut size = [1; 3];

        for axis in 0..3 {
            let n = geometry.size[axis] as i64;
            let half = (length_mm[axis] / 2.0 / geometry.spacing[axis])
                .round()
                .max(0.0) as i64;
            let c = center[axis].clamp(0, n - 1);
            let lo = c.saturating_sub(half).max(0);
            let hi = c.saturating_add(half).min(n - 1);
            start[axis] = lo as usize;
            size[axis] = (hi - lo + 1) as usize;
        }

        Self { start, size }
    }

    /// Exclusive end index
    pub fn end(&self) -> [usize; 3] {
        [
            self.start[0] + self.size[0],
            self.start[1] + self.size[1],
            self.start[2] + self.size[2],
        ]
    }
}

/// How the landmark crops are produced
#[derive(Debug, Clone, PartialEq)]
pub struct CropOptions {
    /// Physical edge length of the crop box in millimetres
    pub length_mm: [f64; 3],
    /// Isotropic spacing to resample the crop to, if any
    pub resample_spacing: Option<f64>,
}

impl CropOptions {
    pub fn validate(&self) -> Result<()> {
        if self.length_mm.iter().any(|&l| !l.is_finite() || l <= 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "crop length must be finite and positive, got {:?}",
                self.length_mm
            )));
        }
        if let Some(spacing) = self.resample_spacing {
            check_spacing(spacing)?;
        }
        Ok(())
    }
}

fn check_spacing(spacing: f64) -> Result<()> {
    if !spacing.is_finite() || spacing <= 0.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "resample spacing must be finite and positive, got {}",
            spacing
        )));
    }
    Ok(())
}

/// Copy the voxels of `region` into a new volume
///
/// The crop keeps spacing and direction. Its origin is the physical position
/// of the region's first voxel.
pub fn crop(volume: &Volume, region: &CropRegion) -> Volume {
    let g = &volume.geometry;
    let start = region.start.map(|v| v as f64);
    let origin = Point3::from(g.point_ijk_to_lps(start));
    let geometry = VolumeGeometry::new(region.size, g.spacing, origin, g.direction);

    let mut out = Volume::zeros(geometry, volume.scalar);
    let [sx, sy, sz] = region.start;
    for k in 0..region.size[2] {
        for j in 0..region.size[1] {
            for i in 0..region.size[0] {
                out.set(i, j, k, volume.get(sx + i, sy + j, sz + k));
            }
        }
    }
    out
}

/// Trilinear interpolation at a continuous index, clamped at the borders
fn trilinear_interpolate(volume: &Volume, x: f64, y: f64, z: f64) -> f64 {
    let [nx, ny, nz] = volume.size();
    let clamp = |v: i64, n: usize| v.clamp(0, n as i64 - 1) as usize;

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let z0 = z.floor() as i64;
    let fx = x - x.floor();
    let fy = y - y.floor();
    let fz = z - z.floor();

    let sample = |dx: i64, dy: i64, dz: i64| {
        volume.get(clamp(x0 + dx, nx), clamp(y0 + dy, ny), clamp(z0 + dz, nz))
    };

    let c00 = sample(0, 0, 0) * (1.0 - fx) + sample(1, 0, 0) * fx;
    let c10 = sample(0, 1, 0) * (1.0 - fx) + sample(1, 1, 0) * fx;
    let c01 = sample(0, 0, 1) * (1.0 - fx) + sample(1, 0, 1) * fx;
    let c11 = sample(0, 1, 1) * (1.0 - fx) + sample(1, 1, 1) * fx;

    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;

    c0 * (1.0 - fz) + c1 * fz
}

/// Resample to an isotropic spacing, keeping the physical extent
///
/// The new grid covers the same voxel-edge box as the input, so its first
/// voxel centre sits half a new voxel inside the old box corner.
pub fn resample_isotropic(volume: &Volume, spacing: f64) -> Result<Volume> {
    check_spacing(spacing)?;
    let g = &volume.geometry;
    let extent = g.extent();
    let size = extent.map(|e| ((e / spacing).round() as usize).max(1));

    // First new voxel centre and step, in old continuous index units
    let mut offset = [0.0; 3];
    let mut step = [0.0; 3];
    for axis in 0..3 {
        step[axis] = spacing / g.spacing[axis];
        offset[axis] = 0.5 * step[axis] - 0.5;
    }

    let origin = Point3::from(g.point_ijk_to_lps(offset));
    let geometry = VolumeGeometry::new(
        size,
        nalgebra::Vector3::new(spacing, spacing, spacing),
        origin,
        g.direction,
    );

    debug!(
        "Resample: {:?} @ {:?} -> {:?} @ {}",
        g.size,
        g.spacing.as_slice(),
        size,
        spacing
    );

    let mut out = Volume::zeros(geometry, volume.scalar);
    for k in 0..size[2] {
        let z = offset[2] + k as f64 * step[2];
        for j in 0..size[1] {
            let y = offset[1] + j as f64 * step[1];
            for i in 0..size[0] {
                let x = offset[0] + i as f64 * step[0];
                out.set(i, j, k, trilinear_interpolate(volume, x, y, z));
            }
        }
    }
    Ok(out)
}

/// Crop around `center`, optionally resample, and write the result to `path`
pub fn run_cropping(
    volume: &Volume,
    center: [i64; 3],
    options: &CropOptions,
    path: &Path,
) -> Result<Volume> {
    options.validate()?;
    let region = CropRegion::around(&volume.geometry, center, options.length_mm);
    info!(
        "Cropping {:?} around {:?}: start {:?}, size {:?}",
        volume.size(),
        center,
        region.start,
        region.size
    );

    let mut cropped = crop(volume, &region);
    if let Some(spacing) = options.resample_spacing {
        cropped = resample_isotropic(&cropped, spacing)?;
    }

    write_nrrd(&cropped, path, Encoding::Gzip)?;
    info!("Saved crop: {:?}", path);
    Ok(cropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nrrd::ScalarType;

    fn ramp(size: [usize; 3], spacing: [f64; 3]) -> Volume {
        let geometry = VolumeGeometry::axis_aligned(size, spacing, [1.0, 2.0, 3.0]);
        let mut volume = Volume::zeros(geometry, ScalarType::Float);
        for k in 0..size[2] {
            for j in 0..size[1] {
                for i in 0..size[0] {
                    volume.set(i, j, k, (i + 10 * j + 100 * k) as f64);
                }
            }
        }
        volume
    }

    #[test]
    fn test_region_centred() {
        let geom = VolumeGeometry::axis_aligned([100, 100, 40], [0.5, 0.5, 1.0], [0.0; 3]);
        let region = CropRegion::around(&geom, [50, 50, 20], [10.0, 10.0, 10.0]);
        assert_eq!(region.start, [40, 40, 15]);
        assert_eq!(region.size, [21, 21, 11]);
    }

    #[test]
    fn test_region_clamped_at_border() {
        let geom = VolumeGeometry::axis_aligned([30, 30, 30], [1.0, 1.0, 1.0], [0.0; 3]);
        let region = CropRegion::around(&geom, [2, 28, 15], [10.0, 10.0, 10.0]);
        assert_eq!(region.start, [0, 23, 10]);
        assert_eq!(region.end(), [8, 30, 21]);
    }

    #[test]
    fn test_region_never_empty() {
        let geom = VolumeGeometry::axis_aligned([5, 5, 5], [1.0, 1.0, 1.0], [0.0; 3]);
        let region = CropRegion::around(&geom, [3, 3, 3], [0.0, 0.0, 0.0]);
        assert_eq!(region.size, [1, 1, 1]);
        assert_eq!(region.start, [3, 3, 3]);
    }

    #[test]
    fn test_crop_moves_origin_and_copies_voxels() {
        let volume = ramp([10, 10, 10], [0.5, 0.5, 2.0]);
        let region = CropRegion {
            start: [2, 3, 4],
            size: [3, 3, 3],
        };
        let cropped = crop(&volume, &region);

        assert_eq!(cropped.size(), [3, 3, 3]);
        assert_eq!(cropped.geometry.origin_lps(), [2.0, 3.5, 11.0]);
        assert_eq!(cropped.get(0, 0, 0), volume.get(2, 3, 4));
        assert_eq!(cropped.get(2, 1, 0), volume.get(4, 4, 4));
        // Physical positions agree
        let a = cropped.geometry.point_ijk_to_lps([1.0, 1.0, 1.0]);
        let b = volume.geometry.point_ijk_to_lps([3.0, 4.0, 5.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_resample_keeps_extent() {
        let volume = ramp([4, 4, 2], [0.5, 0.5, 1.0]);
        let fine = resample_isotropic(&volume, 0.25).unwrap();

        assert_eq!(fine.size(), [8, 8, 8]);
        let old = volume.geometry.extent();
        let new = fine.geometry.extent();
        for axis in 0..3 {
            assert!((old[axis] - new[axis]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_resample_shifts_origin_half_voxel() {
        let volume = ramp([4, 4, 2], [0.5, 0.5, 1.0]);
        let fine = resample_isotropic(&volume, 0.25).unwrap();

        // First new centre sits at old index (-0.25, -0.25, -0.375)
        let origin = fine.geometry.origin_lps();
        let expected = [0.875, 1.875, 2.625];
        for axis in 0..3 {
            assert!((origin[axis] - expected[axis]).abs() < 1e-12);
        }

        // Voxel (3, 3, 4) samples old index (1.25, 1.25, 0.625) of the ramp
        let v = fine.get(3, 3, 4);
        assert!((v - (1.25 + 12.5 + 62.5)).abs() < 1e-9);

        // Same physical point in both grids
        let a = fine.geometry.point_ijk_to_lps([3.0, 3.0, 4.0]);
        let b = volume.geometry.point_ijk_to_lps([1.25, 1.25, 0.625]);
        for axis in 0..3 {
            assert!((a[axis] - b[axis]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_resample_rejects_bad_spacing() {
        let volume = ramp([4, 4, 4], [1.0, 1.0, 1.0]);
        assert!(resample_isotropic(&volume, 0.0).is_err());
        assert!(resample_isotropic(&volume, -0.5).is_err());
        assert!(resample_isotropic(&volume, f64::NAN).is_err());
    }

    #[test]
    fn test_huge_length_is_clamped_or_rejected() {
        let geom = VolumeGeometry::axis_aligned([6, 6, 6], [1.0, 1.0, 1.0], [0.0; 3]);
        let region = CropRegion::around(&geom, [2, 2, 2], [f64::INFINITY; 3]);
        assert_eq!(region.start, [0, 0, 0]);
        assert_eq!(region.size, [6, 6, 6]);

        let options = CropOptions {
            length_mm: [f64::INFINITY, 10.0, 10.0],
            resample_spacing: None,
        };
        assert!(options.validate().is_err());
        let options = CropOptions {
            length_mm: [10.0; 3],
            resample_spacing: Some(0.0),
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_trilinear_on_linear_ramp() {
        let volume = ramp([5, 5, 5], [1.0, 1.0, 1.0]);
        let v = trilinear_interpolate(&volume, 1.5, 2.25, 3.0);
        assert!((v - (1.5 + 22.5 + 300.0)).abs() < 1e-9);
    }

    #[test]
    fn test_run_cropping_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol_crop.nrrd");
        let volume = ramp([20, 20, 20], [1.0, 1.0, 1.0]);
        let options = CropOptions {
            length_mm: [4.0, 4.0, 4.0],
            resample_spacing: None,
        };

        let cropped = run_cropping(&volume, [10, 10, 10], &options, &path).unwrap();
        assert_eq!(cropped.size(), [5, 5, 5]);

        let back = crate::nrrd::read_nrrd(&path).unwrap();
        assert_eq!(back.size(), [5, 5, 5]);
        assert_eq!(back.get(0, 0, 0), volume.get(8, 8, 8));
    }
}
