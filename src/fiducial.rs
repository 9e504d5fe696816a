use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{RegistrationError, Result};

/// Physical frame the FCSV rows are written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSystem {
    Ras,
    Lps,
}

impl CoordinateSystem {
    fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "0" | "RAS" => Ok(Self::Ras),
            "1" | "LPS" => Ok(Self::Lps),
            other => Err(RegistrationError::fiducial(format!(
                "unsupported coordinate system '{}'",
                other
            ))),
        }
    }
}

/// A single landmark point, always held in RAS
#[derive(Debug, Clone, PartialEq)]
pub struct Fiducial {
    pub label: String,
    pub position_ras: [f64; 3],
    pub description: String,
}

impl Fiducial {
    pub fn new(label: impl Into<String>, position_ras: [f64; 3]) -> Self {
        Self {
            label: label.into(),
            position_ras,
            description: String::new(),
        }
    }
}

/// Column positions, taken from the `# columns =` line when present
struct Columns {
    x: usize,
    y: usize,
    z: usize,
    label: usize,
    desc: usize,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            x: 1,
            y: 2,
            z: 3,
            label: 11,
            desc: 12,
        }
    }
}

impl Columns {
    fn from_header(spec: &str) -> Result<Self> {
        let names: Vec<&str> = spec.split(',').map(str::trim).collect();
        let find = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| RegistrationError::fiducial(format!("no '{}' column", name)))
        };
        let defaults = Self::default();
        Ok(Self {
            x: find("x")?,
            y: find("y")?,
            z: find("z")?,
            label: find("label").unwrap_or(defaults.label),
            desc: find("desc").unwrap_or(defaults.desc),
        })
    }
}

/// Read a Slicer markups FCSV file
pub fn read_fcsv(path: &Path) -> Result<Vec<Fiducial>> {
    let text = fs::read_to_string(path).map_err(|e| RegistrationError::io(path, e))?;
    parse_fcsv(&text)
}

pub fn parse_fcsv(text: &str) -> Result<Vec<Fiducial>> {
    let mut system = CoordinateSystem::Ras;
    let mut columns = Columns::default();
    let mut fiducials = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if let Some((key, value)) = comment.split_once('=') {
                match key.trim() {
                    "CoordinateSystem" => system = CoordinateSystem::parse(value)?,
                    "columns" => columns = Columns::from_header(value)?,
                    _ => {}
                }
            }
            continue;
        }

        let fields: Vec<&str> = line.split(',').collect();
        let coord = |idx: usize| -> Result<f64> {
            fields
                .get(idx)
                .and_then(|f| f.trim().parse::<f64>().ok())
                .ok_or_else(|| {
                    RegistrationError::fiducial(format!(
                        "line {}: bad coordinate in column {}",
                        number + 1,
                        idx
                    ))
                })
        };

        let mut position = [coord(columns.x)?, coord(columns.y)?, coord(columns.z)?];
        if system == CoordinateSystem::Lps {
            position[0] = -position[0];
            position[1] = -position[1];
        }

        let text_field = |idx: usize| fields.get(idx).map(|s| s.trim().to_string()).unwrap_or_default();
        fiducials.push(Fiducial {
            label: text_field(columns.label),
            position_ras: position,
            description: text_field(columns.desc),
        });
    }

    Ok(fiducials)
}

/// Render fiducials as an FCSV 4.10 document in RAS
///
/// Rows are plain comma-separated text, so labels and descriptions holding a
/// comma or a line break are rejected.
pub fn format_fcsv(fiducials: &[Fiducial]) -> Result<String> {
    let mut out = String::new();
    out.push_str("# Markups fiducial file version = 4.10\n");
    out.push_str("# CoordinateSystem = 0\n");
    out.push_str("# columns = id,x,y,z,ow,ox,oy,oz,vis,sel,lock,label,desc,associatedNodeID\n");

    for (n, f) in fiducials.iter().enumerate() {
        for text in [&f.label, &f.description] {
            if text.contains([',', '\n', '\r']) {
                return Err(RegistrationError::fiducial(format!(
                    "'{}' cannot be stored in an FCSV column",
                    text.escape_default()
                )));
            }
        }
        let [x, y, z] = f.position_ras;
        // Writing to a String cannot fail
        let _ = writeln!(
            out,
            "vtkMRMLMarkupsFiducialNode_{},{},{},{},0,0,0,1,1,1,0,{},{},",
            n, x, y, z, f.label, f.description
        );
    }

    Ok(out)
}

pub fn write_fcsv(path: &Path, fiducials: &[Fiducial]) -> Result<()> {
    fs::write(path, format_fcsv(fiducials)?).map_err(|e| RegistrationError::io(path, e))
}
