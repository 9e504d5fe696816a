pub mod cli;
pub mod config;
pub mod crop;
pub mod elastix;
pub mod error;
pub mod fiducial;
pub mod geometry;
pub mod landmark;
pub mod nrrd;
pub mod params;
pub mod pipeline;
pub mod preview;

pub use cli::Cli;
pub use config::Settings;
pub use crop::{crop, resample_isotropic, run_cropping, CropOptions, CropRegion};
pub use elastix::{Elastix, ToolRun};
pub use error::{RegistrationError, Result};
pub use fiducial::{read_fcsv, write_fcsv, Fiducial};
pub use geometry::VolumeGeometry;
pub use landmark::Landmark;
pub use nrrd::{read_nrrd, write_nrrd, Encoding, ScalarType, Volume};
pub use params::ParameterFile;
pub use pipeline::{Pipeline, RegistrationJob, RegistrationOutcome};
pub use preview::{write_preview, PreviewOptions};
