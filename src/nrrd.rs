use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{Matrix3, Point3, Vector3};

use crate::error::{RegistrationError, Result};
use crate::geometry::VolumeGeometry;

/// Voxel scalar type as named in the `type:` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
    Double,
}

impl ScalarType {
    pub fn parse(name: &str) -> Result<Self> {
        let scalar = match name.trim() {
            "signed char" | "int8" | "int8_t" => Self::Int8,
            "uchar" | "unsigned char" | "uint8" | "uint8_t" => Self::UInt8,
            "short" | "short int" | "signed short" | "signed short int" | "int16"
            | "int16_t" => Self::Int16,
            "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
                Self::UInt16
            }
            "int" | "signed int" | "int32" | "int32_t" => Self::Int32,
            "uint" | "unsigned int" | "uint32" | "uint32_t" => Self::UInt32,
            "float" => Self::Float,
            "double" => Self::Double,
            other => return Err(RegistrationError::nrrd(format!("unsupported type '{}'", other))),
        };
        Ok(scalar)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "short",
            Self::UInt16 => "ushort",
            Self::Int32 => "int",
            Self::UInt32 => "uint",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Double => 8,
        }
    }

    fn decode(&self, b: &[u8], big_endian: bool) -> f64 {
        macro_rules! read {
            ($t:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&b[..$n]);
                if big_endian {
                    <$t>::from_be_bytes(raw) as f64
                } else {
                    <$t>::from_le_bytes(raw) as f64
                }
            }};
        }

        match self {
            Self::Int8 => b[0] as i8 as f64,
            Self::UInt8 => b[0] as f64,
            Self::Int16 => read!(i16, 2),
            Self::UInt16 => read!(u16, 2),
            Self::Int32 => read!(i32, 4),
            Self::UInt32 => read!(u32, 4),
            Self::Float => read!(f32, 4),
            Self::Double => read!(f64, 8),
        }
    }

    /// Append `value` in little-endian order, rounding and saturating for integers
    fn encode(&self, value: f64, out: &mut Vec<u8>) {
        macro_rules! int {
            ($t:ty) => {
                out.extend_from_slice(
                    &(value.round().clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t).to_le_bytes(),
                )
            };
        }

        match self {
            Self::Int8 => int!(i8),
            Self::UInt8 => int!(u8),
            Self::Int16 => int!(i16),
            Self::UInt16 => int!(u16),
            Self::Int32 => int!(i32),
            Self::UInt32 => int!(u32),
            Self::Float => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Self::Double => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Data encoding used when writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Gzip,
}

/// A scalar volume with its geometry
///
/// Voxels are widened to `f64` in memory and narrowed back to the file's
/// scalar type on write.
#[derive(Debug, Clone)]
pub struct Volume {
    pub geometry: VolumeGeometry,
    pub scalar: ScalarType,
    /// Voxels with i varying fastest
    pub data: Vec<f64>,
}

impl Volume {
    pub fn new(geometry: VolumeGeometry, scalar: ScalarType, data: Vec<f64>) -> Result<Self> {
        if data.len() != geometry.voxel_count() {
            return Err(RegistrationError::nrrd(format!(
                "{} voxels do not fill size {:?}",
                data.len(),
                geometry.size
            )));
        }
        Ok(Self {
            geometry,
            scalar,
            data,
        })
    }

    pub fn zeros(geometry: VolumeGeometry, scalar: ScalarType) -> Self {
        let data = vec![0.0; geometry.voxel_count()];
        Self {
            geometry,
            scalar,
            data,
        }
    }

    pub fn size(&self) -> [usize; 3] {
        self.geometry.size
    }

    #[inline]
    pub fn offset(&self, i: usize, j: usize, k: usize) -> usize {
        let [nx, ny, _] = self.geometry.size;
        i + nx * (j + ny * k)
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.offset(i, j, k)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: f64) {
        let idx = self.offset(i, j, k);
        self.data[idx] = value;
    }
}

/// Read a NRRD file from disk
pub fn read_nrrd(path: &Path) -> Result<Volume> {
    let bytes = fs::read(path).map_err(|e| RegistrationError::io(path, e))?;
    parse_nrrd(&bytes)
}

/// Write a NRRD file to disk
pub fn write_nrrd(volume: &Volume, path: &Path, encoding: Encoding) -> Result<()> {
    let bytes = encode_nrrd(volume, encoding)?;
    fs::write(path, bytes).map_err(|e| RegistrationError::io(path, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Lps,
    Ras,
}

#[derive(Debug, Default)]
struct Header {
    scalar: Option<ScalarType>,
    dimension: Option<usize>,
    sizes: Option<Vec<usize>>,
    space: Option<Space>,
    directions: Option<[Vector3<f64>; 3]>,
    spacings: Option<[f64; 3]>,
    origin: Option<Vector3<f64>>,
    big_endian: bool,
    encoding: Option<String>,
}

/// Parse a complete NRRD byte stream
///
/// Only attached-header, three-dimensional files are handled.
pub fn parse_nrrd(bytes: &[u8]) -> Result<Volume> {
    let (header, data_start) = parse_header(bytes)?;

    let scalar = header
        .scalar
        .ok_or_else(|| RegistrationError::nrrd("missing 'type' field"))?;
    match header.dimension {
        Some(3) => {}
        Some(d) => {
            return Err(RegistrationError::nrrd(format!(
                "expected 3 dimensions, found {}",
                d
            )))
        }
        None => return Err(RegistrationError::nrrd("missing 'dimension' field")),
    }
    let size = header
        .sizes
        .as_deref()
        .ok_or_else(|| RegistrationError::nrrd("missing 'sizes' field"))
        .and_then(|sizes| {
            <[usize; 3]>::try_from(sizes)
                .map_err(|_| RegistrationError::nrrd(format!("sizes {:?} are not 3D", sizes)))
        })?;
    if size.contains(&0) {
        return Err(RegistrationError::nrrd(format!("empty axis in sizes {:?}", size)));
    }
    let count = size
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .and_then(|count| count.checked_mul(scalar.byte_size()).map(|_| count))
        .ok_or_else(|| RegistrationError::nrrd(format!("sizes {:?} are too large", size)))?;

    let geometry = build_geometry(&header, size)?;
    let payload = &bytes[data_start..];

    let encoding = header.encoding.as_deref().unwrap_or("raw");
    let data = match encoding {
        "raw" => decode_binary(payload, scalar, header.big_endian, count)?,
        "gzip" | "gz" => {
            let mut inflated = Vec::new();
            GzDecoder::new(payload)
                .read_to_end(&mut inflated)
                .map_err(|e| RegistrationError::nrrd(format!("gzip data: {}", e)))?;
            decode_binary(&inflated, scalar, header.big_endian, count)?
        }
        "ascii" | "text" | "txt" => decode_ascii(payload, count)?,
        other => {
            return Err(RegistrationError::nrrd(format!(
                "unsupported encoding '{}'",
                other
            )))
        }
    };

    Volume::new(geometry, scalar, data)
}

/// Returns the parsed header and the offset of the first data byte
fn parse_header(bytes: &[u8]) -> Result<(Header, usize)> {
    let mut header = Header::default();
    let mut pos = 0;
    let mut first = true;

    loop {
        let end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|n| pos + n)
            .ok_or_else(|| RegistrationError::nrrd("header is not terminated by a blank line"))?;
        let line = String::from_utf8_lossy(&bytes[pos..end]);
        let line = line.trim_end_matches('\r');
        pos = end + 1;

        if first {
            if !line.starts_with("NRRD000") {
                return Err(RegistrationError::nrrd("missing NRRD magic"));
            }
            first = false;
            continue;
        }
        if line.is_empty() {
            break;
        }
        if line.starts_with('#') || line.contains(":=") {
            continue;
        }

        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| RegistrationError::nrrd(format!("malformed header line '{}'", line)))?;
        apply_field(&mut header, key.trim(), value.trim())?;
    }

    Ok((header, pos))
}

fn apply_field(header: &mut Header, key: &str, value: &str) -> Result<()> {
    match key {
        "type" => header.scalar = Some(ScalarType::parse(value)?),
        "dimension" => {
            header.dimension = Some(
                value
                    .parse()
                    .map_err(|_| RegistrationError::nrrd(format!("bad dimension '{}'", value)))?,
            )
        }
        "sizes" => {
            header.sizes = Some(
                value
                    .split_whitespace()
                    .map(|s| s.parse::<usize>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| RegistrationError::nrrd(format!("bad sizes '{}'", value)))?,
            )
        }
        "spacings" => header.spacings = Some(parse_triple(value, "spacings")?),
        "space" => {
            header.space = Some(match value {
                "left-posterior-superior" | "LPS" => Space::Lps,
                "right-anterior-superior" | "RAS" => Space::Ras,
                other => {
                    return Err(RegistrationError::nrrd(format!(
                        "unsupported space '{}'",
                        other
                    )))
                }
            })
        }
        "space directions" => {
            let vectors = parse_vectors(value)?;
            if vectors.len() != 3 {
                return Err(RegistrationError::nrrd(format!(
                    "expected 3 space directions, found {}",
                    vectors.len()
                )));
            }
            header.directions = Some([vectors[0], vectors[1], vectors[2]]);
        }
        "space origin" => {
            let vectors = parse_vectors(value)?;
            header.origin = vectors.first().copied();
        }
        "endian" => header.big_endian = value == "big",
        "encoding" => header.encoding = Some(value.to_string()),
        "data file" | "datafile" => {
            return Err(RegistrationError::nrrd("detached data files are not supported"))
        }
        _ => {}
    }
    Ok(())
}

fn parse_triple<T: std::str::FromStr>(value: &str, field: &str) -> Result<[T; 3]> {
    let parts: Vec<T> = value
        .split_whitespace()
        .map(|s| s.parse::<T>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| RegistrationError::nrrd(format!("bad {} '{}'", field, value)))?;
    <[T; 3]>::try_from(parts)
        .map_err(|_| RegistrationError::nrrd(format!("{} needs 3 values: '{}'", field, value)))
}

/// Parse `(a,b,c) (d,e,f) ...`
fn parse_vectors(value: &str) -> Result<Vec<Vector3<f64>>> {
    value
        .split(')')
        .map(|chunk| chunk.trim().trim_start_matches('('))
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            if chunk == "none" {
                return Err(RegistrationError::nrrd("non-spatial axes are not supported"));
            }
            let coords: Vec<f64> = chunk
                .split(',')
                .map(|s| s.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| RegistrationError::nrrd(format!("bad vector '({})'", chunk)))?;
            if coords.len() != 3 {
                return Err(RegistrationError::nrrd(format!(
                    "vector '({})' is not 3D",
                    chunk
                )));
            }
            Ok(Vector3::new(coords[0], coords[1], coords[2]))
        })
        .collect()
}

fn build_geometry(header: &Header, size: [usize; 3]) -> Result<VolumeGeometry> {
    // RAS headers are stored flipped so the geometry is always LPS
    let to_lps = |v: Vector3<f64>| match header.space {
        Some(Space::Ras) => Vector3::new(-v.x, -v.y, v.z),
        _ => v,
    };

    let origin = header.origin.map(to_lps).unwrap_or_else(Vector3::zeros);

    let (spacing, direction) = match header.directions {
        Some(columns) => {
            let columns = columns.map(to_lps);
            let spacing = Vector3::new(columns[0].norm(), columns[1].norm(), columns[2].norm());
            if spacing.iter().any(|&s| s <= 1e-12) {
                return Err(RegistrationError::nrrd("zero-length space direction"));
            }
            let direction = Matrix3::from_columns(&[
                columns[0] / spacing.x,
                columns[1] / spacing.y,
                columns[2] / spacing.z,
            ]);
            (spacing, direction)
        }
        None => {
            let spacing = header
                .spacings
                .map(Vector3::from)
                .unwrap_or_else(|| Vector3::new(1.0, 1.0, 1.0));
            (spacing, Matrix3::identity())
        }
    };
    if spacing.iter().any(|&s| !s.is_finite() || s <= 0.0) {
        return Err(RegistrationError::nrrd(format!(
            "spacing {:?} must be finite and positive",
            spacing.as_slice()
        )));
    }
    if origin.iter().any(|v| !v.is_finite()) || direction.iter().any(|v| !v.is_finite()) {
        return Err(RegistrationError::nrrd("non-finite space origin or direction"));
    }

    Ok(VolumeGeometry::new(
        size,
        spacing,
        Point3::from(origin),
        direction,
    ))
}

fn decode_binary(
    payload: &[u8],
    scalar: ScalarType,
    big_endian: bool,
    count: usize,
) -> Result<Vec<f64>> {
    let width = scalar.byte_size();
    let needed = count * width;
    if payload.len() < needed {
        return Err(RegistrationError::nrrd(format!(
            "expected {} data bytes, found {}",
            needed,
            payload.len()
        )));
    }
    // Some writers pad the front; the data is always the trailing block
    let payload = &payload[payload.len() - needed..];

    Ok(payload
        .chunks_exact(width)
        .map(|chunk| scalar.decode(chunk, big_endian))
        .collect())
}

fn decode_ascii(payload: &[u8], count: usize) -> Result<Vec<f64>> {
    let text = String::from_utf8_lossy(payload);
    let data: Vec<f64> = text
        .split_whitespace()
        .map(|s| s.parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| RegistrationError::nrrd(format!("ascii data: {}", e)))?;
    if data.len() != count {
        return Err(RegistrationError::nrrd(format!(
            "expected {} ascii values, found {}",
            count,
            data.len()
        )));
    }
    Ok(data)
}

/// Serialise a volume, always in LPS space and little-endian order
pub fn encode_nrrd(volume: &Volume, encoding: Encoding) -> Result<Vec<u8>> {
    let g = &volume.geometry;
    let column = |axis: usize| -> Vector3<f64> { g.direction.column(axis) * g.spacing[axis] };
    let fmt = |v: Vector3<f64>| format!("({},{},{})", v.x, v.y, v.z);

    let mut out = Vec::new();
    let header = format!(
        "NRRD0004\n\
         # Complete NRRD file format specification at:\n\
         # http://teem.sourceforge.net/nrrd/format.html\n\
         type: {}\n\
         dimension: 3\n\
         space: left-posterior-superior\n\
         sizes: {} {} {}\n\
         space directions: {} {} {}\n\
         kinds: domain domain domain\n\
         endian: little\n\
         encoding: {}\n\
         space origin: {}\n\n",
        volume.scalar.name(),
        g.size[0],
        g.size[1],
        g.size[2],
        fmt(column(0)),
        fmt(column(1)),
        fmt(column(2)),
        match encoding {
            Encoding::Raw => "raw",
            Encoding::Gzip => "gzip",
        },
        fmt(g.origin.coords),
    );
    out.extend_from_slice(header.as_bytes());

    let mut raw = Vec::with_capacity(volume.data.len() * volume.scalar.byte_size());
    for &value in &volume.data {
        volume.scalar.encode(value, &mut raw);
    }

    match encoding {
        Encoding::Raw => out.extend_from_slice(&raw),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&raw)
                .and_then(|_| encoder.finish())
                .map(|compressed| out.extend_from_slice(&compressed))
                .map_err(|e| RegistrationError::nrrd(format!("gzip data: {}", e)))?;
        }
    }

    Ok(out)
}
