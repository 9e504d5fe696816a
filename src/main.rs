use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cochlea_reg::cli::{Command, CropArgs, LocateArgs, PreviewArgs, RegisterArgs, RelocateArgs};
use cochlea_reg::{
    read_fcsv, read_nrrd, run_cropping, write_fcsv, write_preview, Cli, Elastix, Fiducial, Landmark,
    ParameterFile, Pipeline, PreviewOptions, RegistrationJob, Settings,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "cochlea_reg=debug" } else { "cochlea_reg=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if cli.verbose {
        settings.quiet_tools = false;
    }

    match &cli.command {
        Command::Register(args) => register(args, settings),
        Command::Crop(args) => crop(args, &settings),
        Command::Locate(args) => locate(args),
        Command::Relocate(args) => relocate(args),
        Command::Preview(args) => preview(args),
    }
}

fn register(args: &RegisterArgs, mut settings: Settings) -> Result<()> {
    args.apply_to(&mut settings);
    settings.validate()?;

    let mut job = RegistrationJob::direct(&args.fixed, &args.moving);
    job.fixed_landmark = args.fixed_landmark();
    job.moving_landmark = args.moving_landmark();

    let colored = !settings.disable_colors;
    if !Elastix::from_settings(&settings).is_available() {
        warn!("{:?} did not answer --version; the run will likely fail", settings.elastix_bin);
    }
    let pipeline = Pipeline::new(settings);
    let outcome = pipeline.run(&job).context("Registration failed")?;

    eprintln!();
    eprintln!("Registered image:  {:?}", outcome.registered_image);
    if let Some(field) = &outcome.deformation_field {
        eprintln!("Deformation field: {:?}", field);
    }
    eprintln!("Transform:         {:?}", outcome.transform);
    if let Some(inverse) = &outcome.inverse_transform {
        eprintln!("Inverse transform: {:?}", inverse);
    }
    eprintln!("Time: {:.1} seconds", outcome.elapsed.as_secs_f64());

    if let Some(path) = &args.preview {
        let fixed = read_nrrd(&args.fixed)
            .with_context(|| format!("Failed to read fixed volume: {:?}", args.fixed))?;
        let registered = read_nrrd(&outcome.registered_image).with_context(|| {
            format!("Failed to read registered volume: {:?}", outcome.registered_image)
        })?;
        let options = PreviewOptions {
            slice: outcome.fixed_landmark_ijk.map(|p| p[2] as usize),
            colored,
            marker: outcome
                .fixed_landmark_ijk
                .map(|p| (p[0] as u32, p[1] as u32)),
        };
        write_preview(&fixed, &registered, path, &options)
            .with_context(|| format!("Failed to save preview: {:?}", path))?;
    }

    if !outcome.tools_ok {
        bail!("An external tool reported an error; check the log above");
    }
    Ok(())
}

fn crop(args: &CropArgs, settings: &Settings) -> Result<()> {
    let mut options = settings.crop_options();
    if let Some(length) = args.length {
        options.length_mm = length;
    }
    if args.resample.is_some() {
        options.resample_spacing = args.resample;
    }
    options.validate().context("Invalid crop options")?;

    let volume = read_nrrd(&args.input)
        .with_context(|| format!("Failed to read volume: {:?}", args.input))?;

    let landmark = match (args.point, args.ras) {
        (Some(ijk), _) => Landmark::Ijk(ijk),
        (None, Some(ras)) => Landmark::Ras(ras),
        (None, None) => bail!("Either --point or --ras is required"),
    };
    let center = landmark
        .resolve(&volume.geometry, "input")
        .context("Failed to locate crop centre")?;

    let output_path = args.output_path();
    let cropped = run_cropping(&volume, center, &options, &output_path)
        .with_context(|| format!("Failed to crop {:?}", args.input))?;

    eprintln!("Saved crop: {:?}", output_path);
    eprintln!(
        "Dimensions: {:?} -> {:?}",
        volume.size(),
        cropped.size()
    );
    Ok(())
}

fn locate(args: &LocateArgs) -> Result<()> {
    let volume = read_nrrd(&args.volume)
        .with_context(|| format!("Failed to read volume: {:?}", args.volume))?;
    let geometry = &volume.geometry;

    let ras = match (args.ras, args.ijk) {
        (Some(ras), _) => {
            let ijk = geometry.point_ras_to_ijk(ras)?;
            let rounded = geometry.point_ras_to_ijk_rounded(ras)?;
            println!("IJK: [{:.3}, {:.3}, {:.3}]", ijk[0], ijk[1], ijk[2]);
            println!("Voxel: {:?}", rounded);
            if !geometry.contains_index(&rounded) {
                eprintln!("Warning: point lies outside the volume {:?}", geometry.size);
            }
            ras
        }
        (None, Some(ijk)) => {
            let ras = geometry.point_ijk_to_ras(ijk);
            println!("RAS: [{:.4}, {:.4}, {:.4}]", ras[0], ras[1], ras[2]);
            ras
        }
        (None, None) => bail!("Either --ras or --ijk is required"),
    };

    if let Some(path) = &args.fcsv {
        write_fcsv(path, &[Fiducial::new(args.label.clone(), ras)])
            .with_context(|| format!("Failed to write fiducial: {:?}", path))?;
        // Read back so a broken file is caught here, not in a later run
        let written = read_fcsv(path)?;
        eprintln!("Saved {} point(s) to {:?}", written.len(), path);
    }
    Ok(())
}

fn relocate(args: &RelocateArgs) -> Result<()> {
    let reference = read_nrrd(&args.reference)
        .with_context(|| format!("Failed to read reference: {:?}", args.reference))?;
    let mut params = ParameterFile::load(&args.transform)
        .with_context(|| format!("Failed to read transform: {:?}", args.transform))?;

    let before = params.get_numbers("Size").ok();
    params.relocate_to_reference(&reference.geometry);
    params.set_result_format(&args.result_format);

    let output_path = args.output_path();
    params
        .save(&output_path)
        .with_context(|| format!("Failed to save transform: {:?}", output_path))?;

    eprintln!("Saved relocated transform: {:?}", output_path);
    eprintln!(
        "Size: {:?} -> {:?}, origin {:?}",
        before.unwrap_or_default(),
        reference.geometry.size,
        reference.geometry.origin_lps()
    );
    Ok(())
}

fn preview(args: &PreviewArgs) -> Result<()> {
    let fixed = read_nrrd(&args.fixed)
        .with_context(|| format!("Failed to read fixed volume: {:?}", args.fixed))?;
    let registered = read_nrrd(&args.registered)
        .with_context(|| format!("Failed to read registered volume: {:?}", args.registered))?;

    let options = PreviewOptions {
        slice: args.slice.or(args.point.map(|p| p[2].max(0) as usize)),
        colored: !args.no_colors,
        marker: args.point.map(|p| (p[0].max(0) as u32, p[1].max(0) as u32)),
    };
    write_preview(&fixed, &registered, &args.output, &options)
        .with_context(|| format!("Failed to save preview: {:?}", args.output))?;

    eprintln!("Saved preview: {:?}", args.output);
    Ok(())
}
