use std::path::PathBuf;

use tracing::debug;

use crate::error::{RegistrationError, Result};
use crate::fiducial::read_fcsv;
use crate::geometry::VolumeGeometry;

/// Where the cochlea sits in one of the volumes
#[derive(Debug, Clone, PartialEq)]
pub enum Landmark {
    /// Voxel index
    Ijk([i64; 3]),
    /// Physical RAS position
    Ras([f64; 3]),
    /// First point of an FCSV file
    Fcsv(PathBuf),
}

impl Landmark {
    /// Resolve to a voxel index inside `geometry`
    ///
    /// `role` names the volume ("fixed" or "moving") in error messages. The
    /// zero index is how an unpicked point shows up, so it is rejected.
    pub fn resolve(&self, geometry: &VolumeGeometry, role: &'static str) -> Result<[i64; 3]> {
        self.resolve_with_position(geometry, role).map(|(ijk, _)| ijk)
    }

    /// Like `resolve`, also returning the RAS position as given
    ///
    /// Points given as RAS or FCSV keep their exact position; voxel
    /// landmarks report the centre of the voxel.
    pub fn resolve_with_position(
        &self,
        geometry: &VolumeGeometry,
        role: &'static str,
    ) -> Result<([i64; 3], [f64; 3])> {
        let (ijk, ras) = match self {
            Self::Ijk(ijk) => (*ijk, geometry.point_ijk_to_ras(ijk.map(|v| v as f64))),
            Self::Ras(ras) => (geometry.point_ras_to_ijk_rounded(*ras)?, *ras),
            Self::Fcsv(path) => {
                let fiducials = read_fcsv(path)?;
                let first = fiducials.first().ok_or_else(|| {
                    RegistrationError::fiducial(format!("{:?} contains no points", path))
                })?;
                (
                    geometry.point_ras_to_ijk_rounded(first.position_ras)?,
                    first.position_ras,
                )
            }
        };
        debug!("{} landmark {:?} -> ijk {:?}", role, self, ijk);

        if ijk == [0, 0, 0] {
            return Err(RegistrationError::MissingLandmark(role));
        }
        if !geometry.contains_index(&ijk) {
            return Err(RegistrationError::LandmarkOutOfBounds {
                index: ijk,
                size: geometry.size,
            });
        }
        Ok((ijk, ras))
    }
}

/// Parse "a,b,c" into three numbers
pub fn parse_triplet<T: std::str::FromStr>(s: &str) -> std::result::Result<[T; 3], String> {
    let parts: Vec<&str> = s
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .collect();
    if parts.len() != 3 {
        return Err(format!("Invalid point '{}', expected x,y,z", s));
    }

    let mut values = Vec::with_capacity(3);
    for part in parts {
        values.push(
            part.trim()
                .parse::<T>()
                .map_err(|_| format!("Invalid coordinate value: {}", part))?,
        );
    }
    <[T; 3]>::try_from(values).map_err(|_| format!("Invalid point '{}'", s))
}
