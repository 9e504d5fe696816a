use std::path::PathBuf;

use thiserror::Error;

/// Main error type for cochlea registration operations.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Filesystem failure, with the path that caused it.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unsupported NRRD file.
    #[error("NRRD error: {0}")]
    Nrrd(String),

    /// Malformed FCSV fiducial file.
    #[error("Fiducial error: {0}")]
    Fiducial(String),

    /// Malformed elastix parameter file.
    #[error("Parameter file error: {0}")]
    Parameters(String),

    /// A landmark was not picked (resolves to the zero voxel).
    #[error("Missing landmark: select cochlea point in the {0} image")]
    MissingLandmark(&'static str),

    /// A landmark lies outside its volume.
    #[error("Landmark {index:?} lies outside volume of size {size:?}")]
    LandmarkOutOfBounds { index: [i64; 3], size: [usize; 3] },

    /// The image geometry cannot be inverted.
    #[error("Singular geometry: {0}")]
    SingularGeometry(String),

    /// An external tool could not be started.
    #[error("Failed to launch {tool}: {source}")]
    ToolLaunch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// An expected tool output is missing.
    #[error("Expected output {0:?} was not produced")]
    MissingOutput(PathBuf),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Dimension mismatch.
    #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// Writing the preview image failed.
    #[error("Preview error: {0}")]
    Preview(#[from] image::ImageError),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a NRRD format error.
    pub fn nrrd(msg: impl Into<String>) -> Self {
        Self::Nrrd(msg.into())
    }

    /// Create a fiducial format error.
    pub fn fiducial(msg: impl Into<String>) -> Self {
        Self::Fiducial(msg.into())
    }

    /// Create a parameter file error.
    pub fn parameters(msg: impl Into<String>) -> Self {
        Self::Parameters(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
