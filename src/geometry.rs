use nalgebra::{Matrix3, Matrix4, Point3, Vector3, Vector4};

use crate::error::{RegistrationError, Result};

/// Spatial layout of a 3D volume
///
/// Origin and direction are kept in LPS, the convention elastix and ITK write
/// into NRRD headers and transform parameter files. RAS is derived on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    /// Voxel count along i, j, k
    pub size: [usize; 3],
    /// Voxel spacing in millimetres
    pub spacing: Vector3<f64>,
    /// Physical position of voxel (0, 0, 0) in LPS
    pub origin: Point3<f64>,
    /// Direction cosines, one column per index axis
    pub direction: Matrix3<f64>,
}

impl VolumeGeometry {
    pub fn new(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
        direction: Matrix3<f64>,
    ) -> Self {
        Self {
            size,
            spacing,
            origin,
            direction,
        }
    }

    /// Geometry with identity direction cosines
    pub fn axis_aligned(size: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Self::new(
            size,
            Vector3::from(spacing),
            Point3::from(origin),
            Matrix3::identity(),
        )
    }

    pub fn voxel_count(&self) -> usize {
        self.size.iter().product()
    }

    /// Homogeneous matrix mapping a continuous index to LPS
    ///
    /// M = [D × diag(spacing) | origin]
    pub fn ijk_to_lps(&self) -> Matrix4<f64> {
        let l = self.direction * Matrix3::from_diagonal(&self.spacing);
        let o = &self.origin;

        Matrix4::new(
            l[(0, 0)], l[(0, 1)], l[(0, 2)], o.x,
            l[(1, 0)], l[(1, 1)], l[(1, 2)], o.y,
            l[(2, 0)], l[(2, 1)], l[(2, 2)], o.z,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    pub fn lps_to_ijk(&self) -> Result<Matrix4<f64>> {
        self.ijk_to_lps().try_inverse().ok_or_else(|| {
            RegistrationError::SingularGeometry(format!(
                "spacing {:?} with direction {:?} is not invertible",
                self.spacing.as_slice(),
                self.direction.as_slice()
            ))
        })
    }

    pub fn ijk_to_ras(&self) -> Matrix4<f64> {
        lps_ras_flip() * self.ijk_to_lps()
    }

    pub fn ras_to_ijk(&self) -> Result<Matrix4<f64>> {
        Ok(self.lps_to_ijk()? * lps_ras_flip())
    }

    /// Continuous voxel index of a RAS point
    pub fn point_ras_to_ijk(&self, ras: [f64; 3]) -> Result<[f64; 3]> {
        Ok(transform_point(&self.ras_to_ijk()?, ras))
    }

    /// Nearest voxel index of a RAS point
    pub fn point_ras_to_ijk_rounded(&self, ras: [f64; 3]) -> Result<[i64; 3]> {
        let ijk = self.point_ras_to_ijk(ras)?;
        Ok([
            ijk[0].round() as i64,
            ijk[1].round() as i64,
            ijk[2].round() as i64,
        ])
    }

    pub fn point_ijk_to_ras(&self, ijk: [f64; 3]) -> [f64; 3] {
        transform_point(&self.ijk_to_ras(), ijk)
    }

    pub fn point_ijk_to_lps(&self, ijk: [f64; 3]) -> [f64; 3] {
        transform_point(&self.ijk_to_lps(), ijk)
    }

    /// Origin as written into elastix `(Origin ...)` entries
    pub fn origin_lps(&self) -> [f64; 3] {
        [self.origin.x, self.origin.y, self.origin.z]
    }

    pub fn contains_index(&self, ijk: &[i64; 3]) -> bool {
        ijk.iter()
            .zip(self.size.iter())
            .all(|(&i, &n)| i >= 0 && (i as usize) < n)
    }

    /// Physical length covered along each index axis
    pub fn extent(&self) -> [f64; 3] {
        [
            self.size[0] as f64 * self.spacing.x,
            self.size[1] as f64 * self.spacing.y,
            self.size[2] as f64 * self.spacing.z,
        ]
    }
}

/// RAS = diag(-1, -1, 1) × LPS, and the matrix is its own inverse
pub fn lps_ras_flip() -> Matrix4<f64> {
    Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0))
}

/// Transform a point using a homogeneous matrix
pub fn transform_point(matrix: &Matrix4<f64>, p: [f64; 3]) -> [f64; 3] {
    let result = matrix * Vector4::new(p[0], p[1], p[2], 1.0);
    [result.x / result.w, result.y / result.w, result.z / result.w]
}
