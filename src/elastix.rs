use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{RegistrationError, Result};
use crate::params::ParameterFile;

/// Name elastix gives the transform of the last (only) parameter file
pub const TRANSFORM_PARAMETERS: &str = "TransformParameters.0.txt";

/// Registration parameters used when none are configured
pub const DEFAULT_REGISTRATION_PARAMETERS: &str = r#"// Cochlea registration: affine followed by B-spline refinement
(FixedInternalImagePixelType "float")
(MovingInternalImagePixelType "float")
(FixedImageDimension 3)
(MovingImageDimension 3)
(UseDirectionCosines "true")
(Registration "MultiResolutionRegistration")
(Interpolator "BSplineInterpolator")
(ResampleInterpolator "FinalBSplineInterpolator")
(Resampler "DefaultResampler")
(FixedImagePyramid "FixedSmoothingImagePyramid")
(MovingImagePyramid "MovingSmoothingImagePyramid")
(Optimizer "AdaptiveStochasticGradientDescent")
(Transform "BSplineTransform")
(Metric "AdvancedMattesMutualInformation")
(FinalGridSpacingInPhysicalUnits 2.0)
(HowToCombineTransforms "Compose")
(NumberOfHistogramBins 32)
(ErodeMask "false")
(NumberOfResolutions 3)
(MaximumNumberOfIterations 500)
(NumberOfSpatialSamples 4096)
(NewSamplesEveryIteration "true")
(ImageSampler "RandomCoordinate")
(BSplineInterpolationOrder 1)
(FinalBSplineInterpolationOrder 3)
(DefaultPixelValue 0)
(WriteResultImage "true")
(ResultImagePixelType "short")
(ResultImageFormat "nrrd")
"#;

/// Inversion parameters: DisplacementMagnitudePenalty against the forward transform
pub const DEFAULT_INVERSION_PARAMETERS: &str = r#"// Transform inversion by DisplacementMagnitudePenalty
(FixedInternalImagePixelType "float")
(MovingInternalImagePixelType "float")
(FixedImageDimension 3)
(MovingImageDimension 3)
(UseDirectionCosines "true")
(Registration "MultiResolutionRegistration")
(Interpolator "BSplineInterpolator")
(ResampleInterpolator "FinalBSplineInterpolator")
(Resampler "DefaultResampler")
(FixedImagePyramid "FixedSmoothingImagePyramid")
(MovingImagePyramid "MovingSmoothingImagePyramid")
(Optimizer "AdaptiveStochasticGradientDescent")
(Transform "BSplineTransform")
(Metric "DisplacementMagnitudePenalty")
(FinalGridSpacingInPhysicalUnits 2.0)
(HowToCombineTransforms "Compose")
(NumberOfResolutions 1)
(MaximumNumberOfIterations 500)
(NumberOfSpatialSamples 4096)
(NewSamplesEveryIteration "true")
(ImageSampler "RandomCoordinate")
(WriteResultImage "false")
"#;

/// Outcome of one external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    pub tool: String,
    /// Exit code, `None` when killed by a signal
    pub status_code: Option<i32>,
}

impl ToolRun {
    pub fn succeeded(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runner for the elastix toolbox binaries
///
/// Input images and parameter files go in on the command line, results land
/// in an output directory. A non-zero exit status is logged and reported back
/// rather than raised.
#[derive(Debug, Clone)]
pub struct Elastix {
    elastix_bin: PathBuf,
    transformix_bin: PathBuf,
    /// Capture tool output and only replay it at debug level
    quiet: bool,
}

impl Default for Elastix {
    fn default() -> Self {
        Self::new("elastix", "transformix")
    }
}

impl Elastix {
    pub fn new(elastix_bin: impl Into<PathBuf>, transformix_bin: impl Into<PathBuf>) -> Self {
        Self {
            elastix_bin: elastix_bin.into(),
            transformix_bin: transformix_bin.into(),
            quiet: true,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.elastix_bin, &settings.transformix_bin).with_quiet(settings.quiet_tools)
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Check if the elastix binary can be started
    pub fn is_available(&self) -> bool {
        Command::new(&self.elastix_bin)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Register `moving` onto `fixed`, writing results into `out_dir`
    pub fn register(
        &self,
        fixed: &Path,
        moving: &Path,
        params: &Path,
        out_dir: &Path,
    ) -> Result<ToolRun> {
        let mut cmd = Command::new(&self.elastix_bin);
        cmd.arg("-f")
            .arg(fixed)
            .arg("-m")
            .arg(moving)
            .arg("-out")
            .arg(out_dir)
            .arg("-p")
            .arg(params);

        info!("Registering {:?} to {:?}", moving, fixed);
        self.execute("elastix", cmd)
    }

    /// Apply `transform_params` to `input`
    ///
    /// transformix writes `result.<fmt>` and, with `deformation_field`, also
    /// `deformationField.<fmt>`.
    pub fn transform(
        &self,
        input: &Path,
        transform_params: &Path,
        out_dir: &Path,
        deformation_field: bool,
    ) -> Result<ToolRun> {
        let mut cmd = Command::new(&self.transformix_bin);
        cmd.arg("-in")
            .arg(input)
            .arg("-out")
            .arg(out_dir)
            .arg("-tp")
            .arg(transform_params);
        if deformation_field {
            cmd.arg("-def").arg("all");
        }

        info!("Transforming {:?} with {:?}", input, transform_params);
        self.execute("transformix", cmd)
    }

    /// Invert `transform_params` and write the inverse to `inverse_out`
    ///
    /// elastix registers `fixed` to itself with the forward transform as
    /// initial transform, using `invert_params` (a DisplacementMagnitudePenalty
    /// setup). The result is then detached from its initial transform so it
    /// can be used on its own. `scratch_dir` receives the raw elastix output.
    pub fn invert(
        &self,
        transform_params: &Path,
        fixed: &Path,
        invert_params: &Path,
        scratch_dir: &Path,
        inverse_out: &Path,
    ) -> Result<ToolRun> {
        fs::create_dir_all(scratch_dir).map_err(|e| RegistrationError::io(scratch_dir, e))?;

        let mut cmd = Command::new(&self.elastix_bin);
        cmd.arg("-f")
            .arg(fixed)
            .arg("-m")
            .arg(fixed)
            .arg("-t0")
            .arg(transform_params)
            .arg("-p")
            .arg(invert_params)
            .arg("-out")
            .arg(scratch_dir);

        info!("Inverting {:?}", transform_params);
        let run = self.spawn("elastix", cmd)?;
        if !run.succeeded() {
            warn!("Inversion failed with status {:?}", run.status_code);
            return Ok(run);
        }

        let produced = scratch_dir.join(TRANSFORM_PARAMETERS);
        if !produced.exists() {
            return Err(RegistrationError::MissingOutput(produced));
        }
        let mut inverse = ParameterFile::load(&produced)?;
        inverse.clear_initial_transform();
        inverse.save(inverse_out)?;
        debug!("Inverse transform written to {:?}", inverse_out);

        Ok(run)
    }

    fn execute(&self, tool: &str, cmd: Command) -> Result<ToolRun> {
        let run = self.spawn(tool, cmd)?;
        if run.succeeded() {
            debug!("{} finished", tool);
        } else {
            error!("{} failed with status {:?}", tool, run.status_code);
        }
        Ok(run)
    }

    fn spawn(&self, tool: &str, mut cmd: Command) -> Result<ToolRun> {
        debug!("Command: {:?}", cmd);

        let launch_err = |source| RegistrationError::ToolLaunch {
            tool: tool.to_string(),
            source,
        };

        let status = if self.quiet {
            let output = cmd.output().map_err(launch_err)?;
            debug!("{} stdout:\n{}", tool, String::from_utf8_lossy(&output.stdout));
            if !output.stderr.is_empty() {
                debug!("{} stderr:\n{}", tool, String::from_utf8_lossy(&output.stderr));
            }
            output.status
        } else {
            cmd.status().map_err(launch_err)?
        };

        Ok(ToolRun {
            tool: tool.to_string(),
            status_code: status.code(),
        })
    }
}
