use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crop::CropOptions;
use crate::error::{RegistrationError, Result};

pub const ENV_ELASTIX: &str = "COCHLEA_REG_ELASTIX";
pub const ENV_TRANSFORMIX: &str = "COCHLEA_REG_TRANSFORMIX";
pub const ENV_OUTPUT: &str = "COCHLEA_REG_OUTPUT";
pub const ENV_PARAMS: &str = "COCHLEA_REG_PARAMS";

/// Formats transformix can be asked to write results in
pub const RESULT_EXTENSIONS: [&str; 4] = [".nrrd", ".nii", ".nii.gz", ".mha"];

/// Run settings
///
/// Resolved in order: built-in defaults, optional YAML file, environment,
/// then command-line flags (applied by the binary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// elastix executable, looked up on PATH when not absolute
    pub elastix_bin: PathBuf,
    /// transformix executable
    pub transformix_bin: PathBuf,
    /// Shared output folder, cleared at the start of every run
    pub output_dir: PathBuf,
    /// Registration parameter file; a built-in one is used when unset
    pub parameter_file: Option<PathBuf>,
    /// Parameter file for transform inversion; a built-in one is used when unset
    pub inversion_parameter_file: Option<PathBuf>,
    /// Crop box edge lengths in millimetres
    pub crop_length_mm: [f64; 3],
    /// Isotropic spacing for high-resolution crops
    pub resample_spacing: f64,
    /// Resample crops to `resample_spacing`
    pub high_resolution: bool,
    /// Capture tool output instead of streaming it
    pub quiet_tools: bool,
    /// Keep crops and scratch files after the run
    pub keep_intermediates: bool,
    /// Grayscale instead of green/magenta previews
    pub disable_colors: bool,
    /// Extension of images written to the output folder
    pub image_extension: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            elastix_bin: PathBuf::from("elastix"),
            transformix_bin: PathBuf::from("transformix"),
            output_dir: PathBuf::from("CochleaRegOutput"),
            parameter_file: None,
            inversion_parameter_file: None,
            crop_length_mm: [10.0, 10.0, 10.0],
            resample_spacing: 0.125,
            high_resolution: false,
            quiet_tools: true,
            keep_intermediates: false,
            disable_colors: false,
            image_extension: ".nrrd".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| RegistrationError::io(path, e))?;
                debug!("Loaded settings from {:?}", path);
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| RegistrationError::invalid_configuration(format!("settings: {}", e)))
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_ELASTIX) {
            self.elastix_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_TRANSFORMIX) {
            self.transformix_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_OUTPUT) {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_PARAMS) {
            self.parameter_file = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.crop_length_mm.iter().any(|&l| l <= 0.0 || !l.is_finite()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "crop_length_mm must be positive, got {:?}",
                self.crop_length_mm
            )));
        }
        if self.resample_spacing <= 0.0 || !self.resample_spacing.is_finite() {
            return Err(RegistrationError::invalid_configuration(format!(
                "resample_spacing must be positive, got {}",
                self.resample_spacing
            )));
        }
        if !RESULT_EXTENSIONS.contains(&self.image_extension.as_str()) {
            return Err(RegistrationError::invalid_configuration(format!(
                "image_extension must be one of {:?}, got '{}'",
                RESULT_EXTENSIONS, self.image_extension
            )));
        }
        Ok(())
    }

    pub fn crop_options(&self) -> CropOptions {
        CropOptions {
            length_mm: self.crop_length_mm,
            resample_spacing: self.high_resolution.then_some(self.resample_spacing),
        }
    }

    /// Value for the `ResultImageFormat` entry
    pub fn result_format(&self) -> &str {
        self.image_extension.trim_start_matches('.')
    }

    /// `<output_dir>/<name><image_extension>`
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", name, self.image_extension))
    }
}
