// End-to-end runs of the registration pipeline against stand-in elastix and
// transformix scripts that only produce the files the real tools would.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cochlea_reg::{
    read_fcsv, read_nrrd, write_nrrd, Encoding, Landmark, ParameterFile, Pipeline, RegistrationError,
    RegistrationJob, ScalarType, Settings, Volume, VolumeGeometry,
};

// Scripts are written and then executed; serialising the tests keeps another
// thread's fork from holding a script open for writing during exec.
static TOOLS: Mutex<()> = Mutex::new(());

const FAKE_ELASTIX: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -f) FIXED="$2"; shift 2 ;;
    -m) MOVING="$2"; shift 2 ;;
    -out) OUT="$2"; shift 2 ;;
    -p) PARAMS="$2"; shift 2 ;;
    -t0) INIT="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "elastix $FIXED $MOVING $INIT" >> "@LOG@"
if [ -n "$INIT" ]; then
  case "@INVERT@" in
    fail) exit 1 ;;
    silent) exit 0 ;;
  esac
fi
mkdir -p "$OUT"
cat > "$OUT/TransformParameters.0.txt" <<EOF
(Transform "TranslationTransform")
(NumberOfParameters 3)
(TransformParameters 0.5 -0.5 0)
(InitialTransformParametersFileName "${INIT:-NoInitialTransform}")
(HowToCombineTransforms "Compose")
// crop grid
(Size 11 11 11)
(Index 0 0 0)
(Spacing 1 1 1)
(Origin 9 9 9)
(Direction 1 0 0 0 1 0 0 0 1)
(ResultImageFormat "mha")
EOF
exit @STATUS@
"#;

const FAKE_TRANSFORMIX: &str = r#"#!/bin/sh
DEF=""
while [ $# -gt 0 ]; do
  case "$1" in
    -in) IN="$2"; shift 2 ;;
    -out) OUT="$2"; shift 2 ;;
    -tp) TP="$2"; shift 2 ;;
    -def) DEF="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "transformix $IN $TP" >> "@LOG@"
cp "$IN" "$OUT/result.nrrd"
if [ -n "$DEF" ]; then
  cp "$IN" "$OUT/deformationField.nrrd"
fi
exit 0
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    fixed: PathBuf,
    moving: PathBuf,
    out: PathBuf,
    log: PathBuf,
    settings: Settings,
}

fn write_script(path: &Path, text: &str) {
    fs::write(path, text).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_volume(path: &Path, origin: [f64; 3]) {
    let geometry = VolumeGeometry::axis_aligned([30, 30, 30], [1.0, 1.0, 1.0], origin);
    let mut volume = Volume::zeros(geometry, ScalarType::Int16);
    for k in 10..20 {
        for j in 10..20 {
            for i in 10..20 {
                volume.set(i, j, k, 1000.0);
            }
        }
    }
    write_nrrd(&volume, path, Encoding::Gzip).unwrap();
}

/// `invert` is "ok", "fail" (non-zero exit) or "silent" (exit 0, no output)
fn fixture_with(elastix_status: i32, invert: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    let bin = dir.path().join("bin");
    fs::create_dir_all(&inputs).unwrap();
    fs::create_dir_all(&bin).unwrap();

    let log = dir.path().join("calls.log");
    let log_str = log.to_string_lossy();
    let elastix = bin.join("elastix");
    let transformix = bin.join("transformix");
    write_script(
        &elastix,
        &FAKE_ELASTIX
            .replace("@LOG@", &log_str)
            .replace("@STATUS@", &elastix_status.to_string())
            .replace("@INVERT@", invert),
    );
    write_script(&transformix, &FAKE_TRANSFORMIX.replace("@LOG@", &log_str));

    let fixed = inputs.join("P100001_DV_L_a.nrrd");
    let moving = inputs.join("P100001_DV_L_b.nrrd");
    write_volume(&fixed, [1.0, 2.0, 3.0]);
    write_volume(&moving, [0.0, 0.0, 0.0]);

    let out = dir.path().join("out");
    let settings = Settings {
        elastix_bin: elastix,
        transformix_bin: transformix,
        output_dir: out.clone(),
        ..Settings::default()
    };

    Fixture {
        _dir: dir,
        fixed,
        moving,
        out,
        log,
        settings,
    }
}

fn fixture(elastix_status: i32) -> Fixture {
    fixture_with(elastix_status, "ok")
}

fn calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn cropped_run_relocates_inverts_and_applies() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    // Stale content from an earlier run is cleared
    fs::create_dir_all(&fx.out).unwrap();
    fs::write(fx.out.join("stale.txt"), "old").unwrap();

    // Moving volume sits at the origin with unit spacing: voxel (14, 16, 15)
    let moving_ras = [-14.2, -16.1, 15.3];
    let job = RegistrationJob::direct(&fx.fixed, &fx.moving)
        .with_landmarks(Landmark::Ijk([15, 15, 15]), Landmark::Ras(moving_ras));
    let outcome = Pipeline::new(fx.settings.clone()).run(&job).unwrap();

    assert!(outcome.tools_ok);
    assert_eq!(outcome.fixed_landmark_ijk, Some([15, 15, 15]));
    assert_eq!(
        outcome.registered_image,
        fx.out.join("P100001_DV_L_b_Registered.nrrd")
    );
    assert!(outcome.registered_image.exists());
    assert_eq!(
        outcome.deformation_field,
        Some(fx.out.join("P100001_DV_L_b_dFld.nrrd"))
    );
    assert!(!fx.out.join("stale.txt").exists());

    // Registration ran on the crops, inversion on the full fixed copy
    let calls = calls(&fx.log);
    assert_eq!(calls.len(), 3, "{:?}", calls);
    assert!(calls[0].contains("P100001_DV_L_a_F_Crop.nrrd"));
    assert!(calls[0].contains("P100001_DV_L_b_M_Crop.nrrd"));
    assert!(calls[1].contains("TransformParametersMod.txt"));
    assert!(calls[2].starts_with("transformix"));
    assert!(calls[2].contains("TransformParametersMod.txt"));

    // Relocated onto the full fixed grid
    assert_eq!(outcome.transform, fx.out.join("TransformParametersMod.txt"));
    let relocated = ParameterFile::load(&outcome.transform).unwrap();
    assert_eq!(relocated.get_numbers("Size").unwrap(), vec![30.0, 30.0, 30.0]);
    assert_eq!(relocated.get_numbers("Origin").unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(relocated.get("ResultImageFormat"), Some("nrrd"));
    assert_eq!(
        relocated.get_numbers("TransformParameters").unwrap(),
        vec![0.5, -0.5, 0.0]
    );

    // Inverse stands alone
    let inverse_path = outcome.inverse_transform.unwrap();
    let inverse = ParameterFile::load(&inverse_path).unwrap();
    assert_eq!(
        inverse.get("InitialTransformParametersFileName"),
        Some("NoInitialTransform")
    );

    // Landmarks saved, temporaries removed
    let fixed_points = read_fcsv(&fx.out.join("P100001_DV_L_a_F_Cochlea_Pos.fcsv")).unwrap();
    assert_eq!(fixed_points[0].label, "F_CochleaLocation");
    // Fixed origin (1, 2, 3) LPS plus voxel (15, 15, 15), in RAS
    assert_eq!(fixed_points[0].position_ras, [-16.0, -17.0, 18.0]);
    // The moving point is stored as picked, not snapped to its voxel
    let moving_points = read_fcsv(&fx.out.join("P100001_DV_L_b_M_Cochlea_Pos.fcsv")).unwrap();
    assert_eq!(moving_points[0].position_ras, moving_ras);
    assert!(!fx.out.join("P100001_DV_L_a_F_Crop.nrrd").exists());
    assert!(!fx.out.join("inverse").exists());
    assert!(!fx.out.join("P100001_DV_L_a.nrrd").exists());
}

#[test]
fn direct_run_uses_full_volumes() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    let job = RegistrationJob::direct(&fx.fixed, &fx.moving);
    let outcome = Pipeline::new(fx.settings.clone()).run(&job).unwrap();

    assert!(outcome.tools_ok);
    assert!(outcome.inverse_transform.is_none());
    assert!(outcome.fixed_landmark_ijk.is_none());

    let calls = calls(&fx.log);
    assert_eq!(calls.len(), 2, "{:?}", calls);
    assert!(calls[0].contains("P100001_DV_L_a.nrrd"));
    assert!(!calls[0].contains("Crop"));

    // Grid untouched, result format forced to the configured extension
    let transform = ParameterFile::load(&outcome.transform).unwrap();
    assert_eq!(transform.get_numbers("Size").unwrap(), vec![11.0, 11.0, 11.0]);
    assert_eq!(transform.get("ResultImageFormat"), Some("nrrd"));
}

#[test]
fn unpicked_landmark_stops_before_any_tool_runs() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    let job = RegistrationJob::direct(&fx.fixed, &fx.moving)
        .with_landmarks(Landmark::Ijk([0, 0, 0]), Landmark::Ijk([14, 16, 15]));
    let err = Pipeline::new(fx.settings.clone()).run(&job).unwrap_err();

    assert!(matches!(err, RegistrationError::MissingLandmark("fixed")));
    assert!(calls(&fx.log).is_empty());
    assert!(!fx.out.exists());
}

#[test]
fn failing_tool_is_reported_not_raised() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(3);

    let job = RegistrationJob::direct(&fx.fixed, &fx.moving);
    let outcome = Pipeline::new(fx.settings.clone()).run(&job).unwrap();

    assert!(!outcome.tools_ok);
    assert!(outcome.registered_image.exists());
}

#[test]
fn input_inside_output_folder_is_rejected() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    let mut settings = fx.settings.clone();
    settings.output_dir = fx.fixed.parent().unwrap().to_path_buf();
    let job = RegistrationJob::direct(&fx.fixed, &fx.moving);
    let err = Pipeline::new(settings).run(&job).unwrap_err();

    assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));
    assert!(fx.fixed.exists());
}

#[test]
fn failed_inversion_keeps_run_successful() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());

    for mode in ["fail", "silent"] {
        let fx = fixture_with(0, mode);
        let job = RegistrationJob::direct(&fx.fixed, &fx.moving)
            .with_landmarks(Landmark::Ijk([15, 15, 15]), Landmark::Ijk([14, 16, 15]));
        let outcome = Pipeline::new(fx.settings.clone()).run(&job).unwrap();

        assert!(outcome.tools_ok, "inversion mode {}", mode);
        assert!(outcome.inverse_transform.is_none(), "inversion mode {}", mode);
        assert!(!fx.out.join("TransformParametersModInv.txt").exists());
        assert!(outcome.registered_image.exists());
        assert_eq!(calls(&fx.log).len(), 3);
    }
}

#[test]
fn high_resolution_crops_are_resampled() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    let mut settings = fx.settings.clone();
    settings.high_resolution = true;
    settings.resample_spacing = 0.5;
    settings.keep_intermediates = true;

    let job = RegistrationJob::direct(&fx.fixed, &fx.moving)
        .with_landmarks(Landmark::Ijk([15, 15, 15]), Landmark::Ijk([14, 16, 15]));
    let outcome = Pipeline::new(settings).run(&job).unwrap();
    assert!(outcome.tools_ok);

    // 11 voxels of 1 mm become 22 voxels of 0.5 mm
    let crop = read_nrrd(&fx.out.join("P100001_DV_L_a_F_Crop.nrrd")).unwrap();
    assert_eq!(crop.size(), [22, 22, 22]);
    assert_eq!(crop.geometry.spacing.as_slice(), &[0.5, 0.5, 0.5]);
    // Crop corner voxel 10 at origin (1, 2, 3), shifted back a quarter voxel
    let origin = crop.geometry.origin_lps();
    let expected = [10.75, 11.75, 12.75];
    for axis in 0..3 {
        assert!((origin[axis] - expected[axis]).abs() < 1e-9, "{:?}", origin);
    }

    // The applied transform still resamples onto the full 1 mm fixed grid
    let relocated = ParameterFile::load(&outcome.transform).unwrap();
    assert_eq!(relocated.get_numbers("Spacing").unwrap(), vec![1.0, 1.0, 1.0]);
    assert_eq!(relocated.get_numbers("Size").unwrap(), vec![30.0, 30.0, 30.0]);
}

#[test]
fn volumes_sharing_a_name_are_rejected() {
    let _guard = TOOLS.lock().unwrap_or_else(|e| e.into_inner());
    let fx = fixture(0);

    let other_dir = fx.moving.parent().unwrap().join("second");
    fs::create_dir_all(&other_dir).unwrap();
    let twin = other_dir.join("P100001_DV_L_a.nii.nrrd");
    fs::copy(&fx.moving, &twin).unwrap();

    // Stale output survives because nothing is cleared
    fs::create_dir_all(&fx.out).unwrap();
    fs::write(fx.out.join("previous.txt"), "kept").unwrap();

    let job = RegistrationJob::direct(&fx.fixed, &twin);
    let err = Pipeline::new(fx.settings.clone()).run(&job).unwrap_err();

    assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));
    assert!(calls(&fx.log).is_empty());
    assert!(fx.out.join("previous.txt").exists());
}
