use std::fmt;
use std::fs;
use std::path::Path;

use nalgebra::Matrix3;
use tracing::debug;

use crate::error::{RegistrationError, Result};
use crate::geometry::VolumeGeometry;

/// One value of an entry
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(String),
    Text(String),
}

impl ParamValue {
    pub fn number(value: f64) -> Self {
        Self::Number(format!("{}", value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Number(s) | Self::Text(s) => s,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(s) => s.parse().ok(),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(s) => write!(f, "{}", s),
            Self::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Entry {
        key: String,
        values: Vec<ParamValue>,
        raw: String,
    },
    Other(String),
}

/// An elastix parameter or transform-parameter file, held line by line
///
/// Only entries that are explicitly set are re-rendered; comments and
/// untouched entries are written back as read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterFile {
    lines: Vec<Line>,
}

impl ParameterFile {
    pub fn parse(text: &str) -> Result<Self> {
        let lines = text
            .lines()
            .enumerate()
            .map(|(n, line)| parse_line(line).map_err(|msg| {
                RegistrationError::parameters(format!("line {}: {}", n + 1, msg))
            }))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { lines })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| RegistrationError::io(path, e))?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|e| RegistrationError::io(path, e))
    }

    pub fn get_values(&self, key: &str) -> Option<&[ParamValue]> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, values, .. } if k == key => Some(values.as_slice()),
            _ => None,
        })
    }

    /// First value of an entry, unquoted
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_values(key)
            .and_then(|values| values.first())
            .map(ParamValue::as_str)
    }

    pub fn get_numbers(&self, key: &str) -> Result<Vec<f64>> {
        let values = self
            .get_values(key)
            .ok_or_else(|| RegistrationError::parameters(format!("no ({} ...) entry", key)))?;
        values
            .iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    RegistrationError::parameters(format!("({} ...) holds non-number {}", key, v))
                })
            })
            .collect()
    }

    /// Replace the first entry named `key`, or append one
    pub fn set(&mut self, key: &str, values: Vec<ParamValue>) {
        let raw = render_entry(key, &values);
        let existing = self.lines.iter_mut().find_map(|line| match line {
            Line::Entry {
                key: k,
                values: v,
                raw: r,
            } if k == key => Some((v, r)),
            _ => None,
        });

        match existing {
            Some((v, r)) => {
                *v = values;
                *r = raw;
            }
            None => self.lines.push(Line::Entry {
                key: key.to_string(),
                values,
                raw,
            }),
        }
    }

    /// Move the output grid of a crop-space transform onto a full image
    ///
    /// Rewrites `Size`, `Index`, `Origin`, `Spacing` and `Direction` so that
    /// transformix resamples onto `reference`. Transform coefficients live in
    /// physical space and are left untouched.
    pub fn relocate_to_reference(&mut self, reference: &VolumeGeometry) {
        let size = reference.size.map(|n| ParamValue::Number(n.to_string()));
        let origin = reference.origin_lps().map(ParamValue::number);
        let spacing = [reference.spacing.x, reference.spacing.y, reference.spacing.z]
            .map(ParamValue::number);

        debug!(
            "Relocating transform grid to size {:?}, origin {:?}",
            reference.size,
            reference.origin_lps()
        );

        self.set("Size", size.to_vec());
        self.set("Index", vec![ParamValue::number(0.0); 3]);
        self.set("Origin", origin.to_vec());
        self.set("Spacing", spacing.to_vec());
        self.set("Direction", direction_values(&reference.direction));
    }

    pub fn set_initial_transform(&mut self, path: &Path) {
        self.set(
            "InitialTransformParametersFileName",
            vec![ParamValue::text(path.to_string_lossy())],
        );
    }

    /// Cut the chain to any earlier transform
    pub fn clear_initial_transform(&mut self) {
        self.set(
            "InitialTransformParametersFileName",
            vec![ParamValue::text("NoInitialTransform")],
        );
    }

    pub fn set_result_format(&mut self, format: &str) {
        self.set("ResultImageFormat", vec![ParamValue::text(format)]);
    }
}

impl fmt::Display for ParameterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Entry { raw, .. } => writeln!(f, "{}", raw)?,
                Line::Other(text) => writeln!(f, "{}", text)?,
            }
        }
        Ok(())
    }
}

/// elastix stores direction cosines column by column
fn direction_values(direction: &Matrix3<f64>) -> Vec<ParamValue> {
    direction.as_slice().iter().map(|&v| ParamValue::number(v)).collect()
}

fn render_entry(key: &str, values: &[ParamValue]) -> String {
    let mut raw = format!("({}", key);
    for value in values {
        raw.push(' ');
        raw.push_str(&value.to_string());
    }
    raw.push(')');
    raw
}

fn parse_line(line: &str) -> std::result::Result<Line, String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('(') {
        return Ok(Line::Other(line.to_string()));
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut closed = false;
    let mut chars = trimmed[1..].chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                tokens.push(ParamValue::Text(std::mem::take(&mut current)));
                in_quotes = false;
            }
            '"' => {
                flush_number(&mut current, &mut tokens);
                in_quotes = true;
            }
            _ if in_quotes => current.push(c),
            ')' => {
                flush_number(&mut current, &mut tokens);
                closed = true;
                break;
            }
            '/' if chars.peek() == Some(&'/') => {
                return Err("comment inside entry".to_string());
            }
            c if c.is_whitespace() => flush_number(&mut current, &mut tokens),
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated string".to_string());
    }
    if !closed {
        return Err("missing ')'".to_string());
    }

    let rest = chars.collect::<String>();
    let rest = rest.trim();
    if !rest.is_empty() && !rest.starts_with("//") {
        return Err(format!("unexpected text after entry: '{}'", rest));
    }

    if tokens.is_empty() {
        return Err("empty entry".to_string());
    }
    let key = match tokens.remove(0) {
        ParamValue::Number(k) => k,
        ParamValue::Text(_) => return Err("entry key must not be quoted".to_string()),
    };

    Ok(Line::Entry {
        key,
        values: tokens,
        raw: line.to_string(),
    })
}

fn flush_number(current: &mut String, tokens: &mut Vec<ParamValue>) {
    if !current.is_empty() {
        tokens.push(ParamValue::Number(std::mem::take(current)));
    }
}
