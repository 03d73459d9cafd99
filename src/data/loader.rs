use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;

use super::model::{Normalization, RawSpectrum};

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load raw spectra from a data file.  Dispatch by extension.
///
/// Supported formats:
/// * `.json` – `[{ "energy": [...], "intensity": [...], ...meta }, ...]`
///   (`x`/`y` are accepted for the arrays)
/// * `.csv`  – columns `energy` and `intensity` (or `x`/`y`) containing
///   semicolon-separated floats
///
/// Records without samples are skipped with a warning. `fname` defaults to
/// the source path.
pub fn load_file(path: &Path) -> Result<Vec<RawSpectrum>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let mut spectra = match ext.as_str() {
        "json" => load_json(path),
        "csv" | "txt" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    for raw in &mut spectra {
        if raw.fname.is_empty() {
            raw.fname = path.display().to_string();
        }
    }
    log::info!("imported {} spectra from {}", spectra.len(), path.display());
    Ok(spectra)
}

// ---------------------------------------------------------------------------
// Metadata mapping
// ---------------------------------------------------------------------------

/// Loosely typed metadata cell, as found in JSON records or CSV columns.
#[derive(Debug, Clone, PartialEq)]
enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Null,
}

impl MetadataValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::String(s) => s.trim().parse().ok(),
            MetadataValue::Null => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            MetadataValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            MetadataValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn into_string(self) -> String {
        match self {
            MetadataValue::String(s) => s,
            MetadataValue::Integer(i) => i.to_string(),
            MetadataValue::Float(f) => f.to_string(),
            MetadataValue::Null => String::new(),
        }
    }
}

/// Store a known metadata column on `raw`; unknown columns are ignored.
fn apply_metadata(raw: &mut RawSpectrum, key: &str, value: MetadataValue, row: usize) -> Result<()> {
    let number = |v: &MetadataValue| {
        v.as_f64()
            .with_context(|| format!("Row {row}: '{key}' is not a number"))
    };
    let integer = |v: &MetadataValue| {
        v.as_i64()
            .filter(|i| *i >= 0)
            .with_context(|| format!("Row {row}: '{key}' is not a non-negative integer"))
    };

    if value == MetadataValue::Null {
        return Ok(());
    }
    match key {
        "name" => raw.name = value.into_string(),
        "notes" => raw.notes = value.into_string(),
        "fname" => raw.fname = value.into_string(),
        "visibility" => raw.visibility = Some(value.into_string()),
        "eis_region" => {
            raw.eis_region = value
                .as_i64()
                .with_context(|| format!("Row {row}: 'eis_region' is not an integer"))?
        }
        "sweeps" => raw.sweeps = integer(&value)? as u32,
        "smoothness" => raw.smoothness = integer(&value)? as usize,
        "dwelltime" => raw.dwelltime = number(&value)?,
        "passenergy" => raw.passenergy = number(&value)?,
        "calibration" => raw.calibration = number(&value)?,
        "norm" => raw.norm = parse_norm(&value),
        other => log::debug!("Row {row}: ignoring column '{other}'"),
    }
    Ok(())
}

/// `0`/`off`/empty → off, `max`/`auto`/`1`... → divide by maximum, other
/// positive numbers → fixed divisor.
fn parse_norm(value: &MetadataValue) -> Normalization {
    match value.as_f64() {
        Some(v) if v == 0.0 => Normalization::Off,
        Some(v) if v > 0.0 && v != 1.0 => Normalization::Value(v),
        Some(_) => Normalization::Max,
        None => match value.clone().into_string().trim().to_ascii_lowercase().as_str() {
            "" | "off" | "none" | "false" => Normalization::Off,
            _ => Normalization::Max,
        },
    }
}

fn is_energy(key: &str) -> bool {
    key == "energy" || key == "x"
}

fn is_intensity(key: &str) -> bool {
    key == "intensity" || key == "y"
}

fn keep_if_filled(raw: RawSpectrum, row: usize, spectra: &mut Vec<RawSpectrum>) {
    if raw.energy.as_ref().is_some_and(|e| e.is_empty()) {
        log::warn!("Row {row}: no samples, skipped");
        return;
    }
    spectra.push(raw);
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented):
///
/// ```json
/// [
///   {
///     "energy": [290.0, 289.9, ...],
///     "intensity": [812.0, 830.0, ...],
///     "name": "C 1s",
///     "eis_region": 2,
///     "sweeps": 4
///   },
///   ...
/// ]
/// ```
///
/// An object with a `spectra` array is accepted too.
fn load_json(path: &Path) -> Result<Vec<RawSpectrum>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root
        .as_array()
        .or_else(|| root.get("spectra").and_then(|s| s.as_array()))
        .context("Expected top-level JSON array")?;

    let mut spectra = Vec::with_capacity(records.len());

    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        let energy_key = obj.keys().find(|k| is_energy(k)).map(String::as_str);
        let intensity_key = obj.keys().find(|k| is_intensity(k)).map(String::as_str);
        let x = json_array_to_f64(energy_key.and_then(|k| obj.get(k)), i, "energy")?;
        let y = json_array_to_f64(intensity_key.and_then(|k| obj.get(k)), i, "intensity")?;

        if x.len() != y.len() {
            bail!("Row {i}: energy has {} values but intensity has {}", x.len(), y.len());
        }

        let mut raw = RawSpectrum::from_arrays(x, y);
        for (key, val) in obj {
            if is_energy(key) || is_intensity(key) || key == "regions" {
                continue;
            }
            apply_metadata(&mut raw, key, json_to_metadata(val), i)?;
        }
        if let Some(regions) = obj.get("regions") {
            raw.regions = serde_json::from_value(regions.clone())
                .with_context(|| format!("Row {i}: invalid 'regions'"))?;
        }

        keep_if_filled(raw, i, &mut spectra);
    }

    Ok(spectra)
}

fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number"))
        })
        .collect()
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Integer(i64::from(*b)),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout:  header row with column names.
/// `energy` and `intensity` columns contain semicolon-separated floats:
///   `"290.0;289.9;289.8"`, `"812;830;851"`
/// Other known columns map onto spectrum metadata.
fn load_csv(path: &Path) -> Result<Vec<RawSpectrum>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let x_idx = headers
        .iter()
        .position(|h| is_energy(h))
        .context("CSV missing 'energy' column")?;
    let y_idx = headers
        .iter()
        .position(|h| is_intensity(h))
        .context("CSV missing 'intensity' column")?;

    let mut spectra = Vec::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let x = parse_semicolon_floats(record.get(x_idx).unwrap_or(""), row_no, "energy")?;
        let y = parse_semicolon_floats(record.get(y_idx).unwrap_or(""), row_no, "intensity")?;

        if x.len() != y.len() {
            bail!(
                "CSV row {row_no}: energy has {} values but intensity has {}",
                x.len(),
                y.len()
            );
        }

        let mut raw = RawSpectrum::from_arrays(x, y);
        for (col_idx, value) in record.iter().enumerate() {
            if col_idx == x_idx || col_idx == y_idx {
                continue;
            }
            apply_metadata(&mut raw, &headers[col_idx], guess_metadata_type(value), row_no)?;
        }

        keep_if_filled(raw, row_no, &mut spectra);
    }

    Ok(spectra)
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

fn guess_metadata_type(s: &str) -> MetadataValue {
    if s.is_empty() {
        return MetadataValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return MetadataValue::Float(f);
    }
    MetadataValue::String(s.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::data::model::BgType;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn json_records_with_metadata() {
        let file = write_temp(
            ".json",
            r#"[
                {"x": [3.0, 2.0, 1.0], "y": [4.0, 5.0, 6.0], "name": "O 1s",
                 "sweeps": 4, "dwelltime": 0.1, "eis_region": 2, "norm": "max",
                 "sample": "ignored"},
                {"energy": [1.0], "intensity": [2.0], "fname": "scan.xy",
                 "regions": [{"emin": 1.0, "emax": 1.0, "bgtype": "linear"}]}
            ]"#,
        );
        let spectra = load_file(file.path()).unwrap();
        assert_eq!(spectra.len(), 2);
        let first = &spectra[0];
        assert_eq!(first.energy, Some(vec![3.0, 2.0, 1.0]));
        assert_eq!(first.name, "O 1s");
        assert_eq!(first.sweeps, 4);
        assert_eq!(first.eis_region, 2);
        assert_eq!(first.norm, Normalization::Max);
        assert_eq!(first.fname, file.path().display().to_string());
        assert_eq!(spectra[1].fname, "scan.xy");
        assert_eq!(spectra[1].regions[0].bgtype, Some(BgType::Linear));
    }

    #[test]
    fn json_length_mismatch_names_the_row() {
        let file = write_temp(".json", r#"[{"x": [1.0, 2.0], "y": [1.0]}]"#);
        let err = format!("{:#}", load_file(file.path()).unwrap_err());
        assert!(err.contains("Row 0"), "{err}");
    }

    #[test]
    fn csv_semicolon_columns() {
        let file = write_temp(
            ".csv",
            "name,energy,intensity,sweeps,calibration\n\
             Au 4f,\"86;85;84\",\"10;20;15\",2,-0.4\n\
             empty,,,1,0\n",
        );
        let spectra = load_file(file.path()).unwrap();
        assert_eq!(spectra.len(), 1);
        assert_eq!(spectra[0].name, "Au 4f");
        assert_eq!(spectra[0].intensity, Some(vec![10.0, 20.0, 15.0]));
        assert_eq!(spectra[0].sweeps, 2);
        assert_eq!(spectra[0].calibration, -0.4);
    }

    #[test]
    fn csv_bad_number_is_reported() {
        let file = write_temp(".csv", "x,y\n\"1;two\",\"1;2\"\n");
        let err = format!("{:#}", load_file(file.path()).unwrap_err());
        assert!(err.contains("'two' is not a number"), "{err}");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = write_temp(".vms", "");
        assert!(load_file(file.path()).is_err());
    }

    #[test]
    fn norm_column_forms() {
        assert_eq!(parse_norm(&MetadataValue::Integer(0)), Normalization::Off);
        assert_eq!(parse_norm(&MetadataValue::Integer(1)), Normalization::Max);
        assert_eq!(parse_norm(&MetadataValue::Float(250.0)), Normalization::Value(250.0));
        assert_eq!(parse_norm(&MetadataValue::String("auto".into())), Normalization::Max);
        assert_eq!(parse_norm(&MetadataValue::String("off".into())), Normalization::Off);
    }
}
