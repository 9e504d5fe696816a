use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::crop::run_cropping;
use crate::elastix::{
    Elastix, ToolRun, DEFAULT_INVERSION_PARAMETERS, DEFAULT_REGISTRATION_PARAMETERS,
    TRANSFORM_PARAMETERS,
};
use crate::error::{RegistrationError, Result};
use crate::fiducial::{write_fcsv, Fiducial};
use crate::landmark::Landmark;
use crate::nrrd::{read_nrrd, Volume};
use crate::params::ParameterFile;

pub const RELOCATED_TRANSFORM: &str = "TransformParametersMod.txt";
pub const INVERSE_TRANSFORM: &str = "TransformParametersModInv.txt";
const INVERSION_SCRATCH: &str = "inverse";
const REGISTRATION_PARAMS: &str = "CochleaRegParameters.txt";
const INVERSION_PARAMS: &str = "CochleaRegInversionParameters.txt";

/// Inputs of one registration run
#[derive(Debug, Clone)]
pub struct RegistrationJob {
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub fixed_landmark: Option<Landmark>,
    pub moving_landmark: Option<Landmark>,
}

impl RegistrationJob {
    pub fn direct(fixed: impl Into<PathBuf>, moving: impl Into<PathBuf>) -> Self {
        Self {
            fixed: fixed.into(),
            moving: moving.into(),
            fixed_landmark: None,
            moving_landmark: None,
        }
    }

    pub fn with_landmarks(mut self, fixed: Landmark, moving: Landmark) -> Self {
        self.fixed_landmark = Some(fixed);
        self.moving_landmark = Some(moving);
        self
    }
}

/// Artifacts of a finished run
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// Moving volume resampled onto the fixed grid
    pub registered_image: PathBuf,
    pub deformation_field: Option<PathBuf>,
    /// Transform that was applied to the moving volume
    pub transform: PathBuf,
    pub inverse_transform: Option<PathBuf>,
    /// Cochlea voxel in the fixed volume, for cropped runs
    pub fixed_landmark_ijk: Option<[i64; 3]>,
    /// Every external tool exited with status 0
    pub tools_ok: bool,
    pub elapsed: Duration,
}

/// Files and volumes prepared by `init_run`
struct Workspace {
    out_dir: PathBuf,
    fixed_name: String,
    moving_name: String,
    fixed_copy: PathBuf,
    moving_copy: PathBuf,
    fixed: Volume,
    moving: Volume,
    params: PathBuf,
    temporaries: Vec<PathBuf>,
    runs: Vec<ToolRun>,
}

/// The cochlea registration run
///
/// With a landmark in both volumes the run crops a box around each cochlea,
/// registers the crops, and relocates the crop-space transform onto the full
/// fixed image grid before applying it to the full moving volume. Without
/// landmarks the full volumes are registered directly.
pub struct Pipeline {
    settings: Settings,
    elastix: Elastix,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let elastix = Elastix::from_settings(&settings);
        Self { settings, elastix }
    }

    pub fn run(&self, job: &RegistrationJob) -> Result<RegistrationOutcome> {
        let start = Instant::now();

        let mut outcome = match (&job.fixed_landmark, &job.moving_landmark) {
            (Some(fixed), Some(moving)) => {
                info!("Image registration started: with cropping");
                self.run_cropped(job, fixed, moving)?
            }
            (None, None) => {
                info!("Image registration started: no cropping");
                self.run_direct(job)?
            }
            (Some(_), None) => return Err(RegistrationError::MissingLandmark("moving")),
            (None, Some(_)) => return Err(RegistrationError::MissingLandmark("fixed")),
        };

        outcome.elapsed = start.elapsed();
        info!(
            "Cochlea registration is complete in {:.1} s",
            outcome.elapsed.as_secs_f64()
        );
        Ok(outcome)
    }

    fn run_cropped(
        &self,
        job: &RegistrationJob,
        fixed_landmark: &Landmark,
        moving_landmark: &Landmark,
    ) -> Result<RegistrationOutcome> {
        // Landmarks are checked before the output folder is touched
        let fixed = read_nrrd(&job.fixed)?;
        let moving = read_nrrd(&job.moving)?;
        let (fixed_ijk, fixed_ras) =
            fixed_landmark.resolve_with_position(&fixed.geometry, "fixed")?;
        let (moving_ijk, moving_ras) =
            moving_landmark.resolve_with_position(&moving.geometry, "moving")?;
        info!("Fixed cochlea point: {:?}", fixed_ijk);
        info!("Moving cochlea point: {:?}", moving_ijk);

        let mut ws = self.init_run(job, fixed, moving)?;

        self.save_landmark(&ws, fixed_ras, "F")?;
        self.save_landmark(&ws, moving_ras, "M")?;

        let crop_options = self.settings.crop_options();
        let fixed_crop = ws.out_dir.join(format!("{}_F_Crop.nrrd", ws.fixed_name));
        let moving_crop = ws.out_dir.join(format!("{}_M_Crop.nrrd", ws.moving_name));
        run_cropping(&ws.fixed, fixed_ijk, &crop_options, &fixed_crop)?;
        run_cropping(&ws.moving, moving_ijk, &crop_options, &moving_crop)?;
        ws.temporaries.push(fixed_crop.clone());
        ws.temporaries.push(moving_crop.clone());

        info!("Registering cropped moving image to cropped fixed image");
        let run = self
            .elastix
            .register(&fixed_crop, &moving_crop, &ws.params, &ws.out_dir)?;
        ws.runs.push(run);

        let crop_transform = ws.out_dir.join(TRANSFORM_PARAMETERS);
        let mut relocated = load_transform(&crop_transform)?;
        relocated.relocate_to_reference(&ws.fixed.geometry);
        relocated.set_result_format(self.settings.result_format());
        let relocated_path = ws.out_dir.join(RELOCATED_TRANSFORM);
        relocated.save(&relocated_path)?;

        let inverse_path = self.invert(&mut ws, &relocated_path)?;

        let run = self
            .elastix
            .transform(&ws.moving_copy, &relocated_path, &ws.out_dir, true)?;
        ws.runs.push(run);

        let mut outcome = self.finish(ws, relocated_path)?;
        outcome.inverse_transform = inverse_path;
        outcome.fixed_landmark_ijk = Some(fixed_ijk);
        Ok(outcome)
    }

    fn run_direct(&self, job: &RegistrationJob) -> Result<RegistrationOutcome> {
        let fixed = read_nrrd(&job.fixed)?;
        let moving = read_nrrd(&job.moving)?;
        let mut ws = self.init_run(job, fixed, moving)?;

        info!("Registering moving image to fixed image");
        let run = self
            .elastix
            .register(&ws.fixed_copy, &ws.moving_copy, &ws.params, &ws.out_dir)?;
        ws.runs.push(run);

        let transform_path = ws.out_dir.join(TRANSFORM_PARAMETERS);
        let mut transform = load_transform(&transform_path)?;
        transform.set_result_format(self.settings.result_format());
        transform.save(&transform_path)?;

        let run = self
            .elastix
            .transform(&ws.moving_copy, &transform_path, &ws.out_dir, true)?;
        ws.runs.push(run);

        self.finish(ws, transform_path)
    }

    /// Clear the output folder and stage inputs and parameter files in it
    fn init_run(&self, job: &RegistrationJob, fixed: Volume, moving: Volume) -> Result<Workspace> {
        let fixed_name = volume_name(&job.fixed)?;
        let moving_name = volume_name(&job.moving)?;
        if fixed_name == moving_name {
            return Err(RegistrationError::invalid_configuration(format!(
                "fixed and moving volumes share the name '{}'",
                fixed_name
            )));
        }

        let out_dir = self.settings.output_dir.clone();
        fs::create_dir_all(&out_dir).map_err(|e| RegistrationError::io(&out_dir, e))?;

        for input in [&job.fixed, &job.moving] {
            if is_inside(input, &out_dir) {
                return Err(RegistrationError::invalid_configuration(format!(
                    "input {:?} lies inside the output folder {:?}, which is cleared on every run",
                    input, out_dir
                )));
            }
        }
        clear_dir(&out_dir)?;

        info!("Fixed volume  = {}", fixed_name);
        info!("Moving volume = {}", moving_name);
        info!("Output path   = {:?}", out_dir);

        let fixed_copy = out_dir.join(format!("{}.nrrd", fixed_name));
        let moving_copy = out_dir.join(format!("{}.nrrd", moving_name));
        copy_file(&job.fixed, &fixed_copy)?;
        copy_file(&job.moving, &moving_copy)?;

        let mut temporaries = vec![fixed_copy.clone(), moving_copy.clone()];
        let params = match &self.settings.parameter_file {
            Some(path) => path.clone(),
            None => {
                let path = out_dir.join(REGISTRATION_PARAMS);
                write_text(&path, DEFAULT_REGISTRATION_PARAMETERS)?;
                temporaries.push(path.clone());
                path
            }
        };
        info!("Parameters    = {:?}", params);

        Ok(Workspace {
            out_dir,
            fixed_name,
            moving_name,
            fixed_copy,
            moving_copy,
            fixed,
            moving,
            params,
            temporaries,
            runs: Vec::new(),
        })
    }

    fn save_landmark(&self, ws: &Workspace, ras: [f64; 3], tag: &str) -> Result<()> {
        let name = if tag == "F" { &ws.fixed_name } else { &ws.moving_name };
        let path = ws.out_dir.join(format!("{}_{}_Cochlea_Pos.fcsv", name, tag));
        write_fcsv(&path, &[Fiducial::new(format!("{}_CochleaLocation", tag), ras)])
    }

    /// Invert the relocated transform
    ///
    /// The inverse is an extra artifact: a failed inversion is logged and
    /// leaves the registration status untouched.
    fn invert(&self, ws: &mut Workspace, relocated: &Path) -> Result<Option<PathBuf>> {
        let invert_params = match &self.settings.inversion_parameter_file {
            Some(path) => path.clone(),
            None => {
                let path = ws.out_dir.join(INVERSION_PARAMS);
                write_text(&path, DEFAULT_INVERSION_PARAMETERS)?;
                ws.temporaries.push(path.clone());
                path
            }
        };

        let scratch = ws.out_dir.join(INVERSION_SCRATCH);
        ws.temporaries.push(scratch.clone());
        let inverse_path = ws.out_dir.join(INVERSE_TRANSFORM);

        let run = match self.elastix.invert(
            relocated,
            &ws.fixed_copy,
            &invert_params,
            &scratch,
            &inverse_path,
        ) {
            Ok(run) => run,
            Err(RegistrationError::MissingOutput(path)) => {
                warn!("Inversion wrote no {:?}; continuing without inverse", path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if run.succeeded() {
            Ok(Some(inverse_path))
        } else {
            warn!("Transform inversion failed; continuing without inverse");
            Ok(None)
        }
    }

    /// Rename transformix outputs, clean up and summarise the tool runs
    fn finish(&self, ws: Workspace, transform: PathBuf) -> Result<RegistrationOutcome> {
        let ext = &self.settings.image_extension;
        let result = ws.out_dir.join(format!("result{}", ext));
        let registered = self
            .settings
            .image_path(&format!("{}_Registered", ws.moving_name));
        if !result.exists() {
            error!("transformix produced no result image");
            return Err(RegistrationError::MissingOutput(result));
        }
        rename(&result, &registered)?;

        let field = ws.out_dir.join(format!("deformationField{}", ext));
        let deformation_field = if field.exists() {
            let renamed = self.settings.image_path(&format!("{}_dFld", ws.moving_name));
            rename(&field, &renamed)?;
            Some(renamed)
        } else {
            warn!("transformix produced no deformation field");
            None
        };

        if self.settings.keep_intermediates {
            info!("Keeping intermediate files");
        } else {
            remove_temporaries(&ws.temporaries);
        }

        let tools_ok = ws.runs.iter().all(ToolRun::succeeded);
        if tools_ok {
            info!("No error is reported during registration");
        } else {
            let failed: Vec<&str> = ws
                .runs
                .iter()
                .filter(|r| !r.succeeded())
                .map(|r| r.tool.as_str())
                .collect();
            error!("Error happened during registration (failed: {:?})", failed);
        }
        info!("Registered image: {:?}", registered);

        Ok(RegistrationOutcome {
            registered_image: registered,
            deformation_field,
            transform,
            inverse_transform: None,
            fixed_landmark_ijk: None,
            tools_ok,
            elapsed: Duration::ZERO,
        })
    }
}

fn load_transform(path: &Path) -> Result<ParameterFile> {
    if !path.exists() {
        error!("elastix produced no transform parameters");
        return Err(RegistrationError::MissingOutput(path.to_path_buf()));
    }
    ParameterFile::load(path)
}

/// File name without directory and without the (possibly double) extension
fn volume_name(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RegistrationError::invalid_configuration(format!("{:?} has no file name", path))
        })?;
    let name = file_name.split('.').next().unwrap_or_default().to_string();
    if name.is_empty() {
        return Err(RegistrationError::invalid_configuration(format!(
            "{:?} has an empty name",
            path
        )));
    }
    Ok(name)
}

fn is_inside(path: &Path, dir: &Path) -> bool {
    match (path.canonicalize(), dir.canonicalize()) {
        (Ok(path), Ok(dir)) => path.starts_with(dir),
        _ => false,
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| RegistrationError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| RegistrationError::io(dir, e))?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| RegistrationError::io(&path, e))?;
    }
    Ok(())
}

fn remove_temporaries(paths: &[PathBuf]) {
    for path in paths {
        let removed = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = removed {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).map_err(|e| RegistrationError::io(from, e))?;
    Ok(())
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| RegistrationError::io(from, e))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|e| RegistrationError::io(path, e))
}
