use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::landmark::{parse_triplet, Landmark};

#[derive(Parser, Debug)]
#[command(name = "cochlea-reg")]
#[command(version, about = "Landmark-guided cochlea image registration with elastix")]
pub struct Cli {
    /// YAML settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Show debug details and external tool output
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a moving volume to a fixed volume
    Register(RegisterArgs),
    /// Crop a volume around a point
    Crop(CropArgs),
    /// Convert a point between RAS and IJK
    Locate(LocateArgs),
    /// Move a crop-space transform onto a full reference image
    Relocate(RelocateArgs),
    /// Write a fused slice of two volumes as PNG
    Preview(PreviewArgs),
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Fixed (reference) NRRD volume
    #[arg(long)]
    pub fixed: PathBuf,

    /// Moving NRRD volume
    #[arg(long)]
    pub moving: PathBuf,

    /// Cochlea voxel in the fixed volume (e.g. "220,242,78")
    #[arg(long, value_parser = parse_triplet::<i64>, conflicts_with_all = ["fixed_ras", "fixed_fcsv"])]
    pub fixed_point: Option<[i64; 3]>,

    /// Cochlea RAS position in the fixed volume
    #[arg(long, value_parser = parse_triplet::<f64>, allow_hyphen_values = true, conflicts_with = "fixed_fcsv")]
    pub fixed_ras: Option<[f64; 3]>,

    /// FCSV file holding the fixed cochlea point
    #[arg(long)]
    pub fixed_fcsv: Option<PathBuf>,

    /// Cochlea voxel in the moving volume
    #[arg(long, value_parser = parse_triplet::<i64>, conflicts_with_all = ["moving_ras", "moving_fcsv"])]
    pub moving_point: Option<[i64; 3]>,

    /// Cochlea RAS position in the moving volume
    #[arg(long, value_parser = parse_triplet::<f64>, allow_hyphen_values = true, conflicts_with = "moving_fcsv")]
    pub moving_ras: Option<[f64; 3]>,

    /// FCSV file holding the moving cochlea point
    #[arg(long)]
    pub moving_fcsv: Option<PathBuf>,

    /// Output folder [default: from settings]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// elastix parameter file [default: built-in]
    #[arg(short, long)]
    pub params: Option<PathBuf>,

    /// elastix executable
    #[arg(long)]
    pub elastix: Option<PathBuf>,

    /// transformix executable
    #[arg(long)]
    pub transformix: Option<PathBuf>,

    /// Resample crops to the high-resolution spacing
    #[arg(long)]
    pub high_res: bool,

    /// Keep crops and scratch files
    #[arg(long)]
    pub keep_intermediates: bool,

    /// Write a fused preview PNG of the result
    #[arg(long)]
    pub preview: Option<PathBuf>,

    /// Grayscale preview instead of green/magenta
    #[arg(long)]
    pub no_colors: bool,
}

impl RegisterArgs {
    pub fn fixed_landmark(&self) -> Option<Landmark> {
        landmark(self.fixed_point, self.fixed_ras, self.fixed_fcsv.as_deref())
    }

    pub fn moving_landmark(&self) -> Option<Landmark> {
        landmark(self.moving_point, self.moving_ras, self.moving_fcsv.as_deref())
    }

    /// Flags take priority over file and environment settings
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(output) = &self.output {
            settings.output_dir = output.clone();
        }
        if let Some(params) = &self.params {
            settings.parameter_file = Some(params.clone());
        }
        if let Some(elastix) = &self.elastix {
            settings.elastix_bin = elastix.clone();
        }
        if let Some(transformix) = &self.transformix {
            settings.transformix_bin = transformix.clone();
        }
        settings.high_resolution |= self.high_res;
        settings.keep_intermediates |= self.keep_intermediates;
        settings.disable_colors |= self.no_colors;
    }
}

fn landmark(ijk: Option<[i64; 3]>, ras: Option<[f64; 3]>, fcsv: Option<&Path>) -> Option<Landmark> {
    ijk.map(Landmark::Ijk)
        .or(ras.map(Landmark::Ras))
        .or_else(|| fcsv.map(|p| Landmark::Fcsv(p.to_path_buf())))
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("center").required(true).args(["point", "ras"])))]
pub struct CropArgs {
    /// Input NRRD volume
    #[arg(required = true)]
    pub input: PathBuf,

    /// Crop centre voxel
    #[arg(long, value_parser = parse_triplet::<i64>)]
    pub point: Option<[i64; 3]>,

    /// Crop centre RAS position
    #[arg(long, value_parser = parse_triplet::<f64>, allow_hyphen_values = true)]
    pub ras: Option<[f64; 3]>,

    /// Crop box edge lengths in mm [default: from settings]
    #[arg(long, value_parser = parse_triplet::<f64>)]
    pub length: Option<[f64; 3]>,

    /// Resample the crop to this isotropic spacing in mm
    #[arg(long)]
    pub resample: Option<f64>,

    /// Output path [default: input_crop.nrrd]
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl CropArgs {
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| sibling_path(&self.input, "_crop.nrrd"))
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("point").required(true).args(["ras", "ijk"])))]
pub struct LocateArgs {
    /// NRRD volume that defines the coordinate frame
    #[arg(required = true)]
    pub volume: PathBuf,

    /// RAS position to convert to a voxel index
    #[arg(long, value_parser = parse_triplet::<f64>, allow_hyphen_values = true)]
    pub ras: Option<[f64; 3]>,

    /// Voxel index to convert to RAS
    #[arg(long, value_parser = parse_triplet::<f64>)]
    pub ijk: Option<[f64; 3]>,

    /// Also write the point to this FCSV file
    #[arg(long)]
    pub fcsv: Option<PathBuf>,

    /// Label for the FCSV point
    #[arg(long, default_value = "CochleaLocation")]
    pub label: String,
}

#[derive(Args, Debug)]
pub struct RelocateArgs {
    /// Transform parameter file from a crop registration
    #[arg(required = true)]
    pub transform: PathBuf,

    /// Full-size NRRD volume the transform should resample onto
    #[arg(long)]
    pub reference: PathBuf,

    /// Output path [default: transformMod.txt]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Value for ResultImageFormat
    #[arg(long, default_value = "nrrd")]
    pub result_format: String,
}

impl RelocateArgs {
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| sibling_path(&self.transform, "Mod.txt"))
    }
}

#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// Fixed NRRD volume
    #[arg(long)]
    pub fixed: PathBuf,

    /// Registered NRRD volume on the fixed grid
    #[arg(long)]
    pub registered: PathBuf,

    /// Output PNG path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Axial slice index [default: middle]
    #[arg(long)]
    pub slice: Option<usize>,

    /// Voxel to mark in the slice
    #[arg(long, value_parser = parse_triplet::<i64>)]
    pub point: Option<[i64; 3]>,

    /// Grayscale instead of green/magenta
    #[arg(long)]
    pub no_colors: bool,
}

/// `dir/stem<suffix>` next to `path`
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}{}", stem, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_register_with_points() {
        let cli = Cli::try_parse_from([
            "cochlea-reg",
            "register",
            "--fixed",
            "a.nrrd",
            "--moving",
            "b.nrrd",
            "--fixed-point",
            "220,242,78",
            "--moving-ras",
            "-1.5,2,-3",
        ])
        .unwrap();

        let Command::Register(args) = cli.command else {
            panic!("expected register");
        };
        assert_eq!(args.fixed_landmark(), Some(Landmark::Ijk([220, 242, 78])));
        assert_eq!(args.moving_landmark(), Some(Landmark::Ras([-1.5, 2.0, -3.0])));
    }

    #[test]
    fn test_conflicting_landmarks_rejected() {
        let result = Cli::try_parse_from([
            "cochlea-reg",
            "register",
            "--fixed",
            "a.nrrd",
            "--moving",
            "b.nrrd",
            "--fixed-point",
            "1,2,3",
            "--fixed-fcsv",
            "p.fcsv",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "cochlea-reg",
            "register",
            "--fixed",
            "a.nrrd",
            "--moving",
            "b.nrrd",
            "-o",
            "/tmp/reg",
            "--high-res",
        ])
        .unwrap();
        let Command::Register(args) = cli.command else {
            panic!("expected register");
        };

        let mut settings = Settings::default();
        args.apply_to(&mut settings);
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/reg"));
        assert!(settings.high_resolution);
        assert_eq!(args.fixed_landmark(), None);
    }

    #[test]
    fn test_default_output_paths() {
        let cli = Cli::try_parse_from(["cochlea-reg", "crop", "/data/scan.nrrd", "--point", "1,2,3"])
            .unwrap();
        let Command::Crop(args) = cli.command else {
            panic!("expected crop");
        };
        assert_eq!(args.output_path(), PathBuf::from("/data/scan_crop.nrrd"));

        let cli = Cli::try_parse_from([
            "cochlea-reg",
            "relocate",
            "out/TransformParameters.0.txt",
            "--reference",
            "f.nrrd",
        ])
        .unwrap();
        let Command::Relocate(args) = cli.command else {
            panic!("expected relocate");
        };
        assert_eq!(
            args.output_path(),
            PathBuf::from("out/TransformParameters.0Mod.txt")
        );
    }

    #[test]
    fn test_locate_requires_a_point() {
        assert!(Cli::try_parse_from(["cochlea-reg", "locate", "v.nrrd"]).is_err());
    }
}
