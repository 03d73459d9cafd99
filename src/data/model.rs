use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::XpsError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Process-unique entity identifier.
pub type Sid = u64;

static NEXT_SID: AtomicU64 = AtomicU64::new(1);

/// Hand out a fresh identifier. Never returns the same value twice.
pub fn next_sid() -> Sid {
    NEXT_SID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Processing selectors
// ---------------------------------------------------------------------------

/// Background algorithm of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BgType {
    None,
    Linear,
    #[default]
    Shirley,
}

impl BgType {
    pub const ALL: [BgType; 3] = [BgType::None, BgType::Linear, BgType::Shirley];

    pub fn as_str(&self) -> &'static str {
        match self {
            BgType::None => "none",
            BgType::Linear => "linear",
            BgType::Shirley => "shirley",
        }
    }
}

impl fmt::Display for BgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BgType {
    type Err = XpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BgType::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| XpsError::UnknownBackground(s.to_string()))
    }
}

/// Intensity normalization of a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    Off,
    /// Divide by the maximum intensity.
    Max,
    /// Divide by a fixed value; non-positive values behave like `Max`.
    Value(f64),
}

impl Normalization {
    pub fn is_off(&self) -> bool {
        matches!(self, Normalization::Off)
    }
}

// ---------------------------------------------------------------------------
// Raw mappings exchanged with import and persistence
// ---------------------------------------------------------------------------

/// One spectrum as supplied by an importer or stored in a project file.
///
/// `energy` and `intensity` are optional here so that their absence can be
/// reported as [`XpsError::MissingField`] when a `Spectrum` is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSpectrum {
    #[serde(alias = "x", skip_serializing_if = "Option::is_none")]
    pub energy: Option<Vec<f64>>,
    #[serde(alias = "y", skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Vec<f64>>,
    pub name: String,
    pub notes: String,
    pub eis_region: i64,
    pub fname: String,
    pub sweeps: u32,
    pub dwelltime: f64,
    pub passenergy: f64,
    pub visibility: Option<String>,
    pub smoothness: usize,
    pub calibration: f64,
    pub norm: Normalization,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RawRegion>,
}

impl RawSpectrum {
    /// Convenience constructor for the two required arrays.
    pub fn from_arrays(energy: Vec<f64>, intensity: Vec<f64>) -> Self {
        Self {
            energy: Some(energy),
            intensity: Some(intensity),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRegion {
    pub emin: Option<f64>,
    pub emax: Option<f64>,
    pub bgtype: Option<BgType>,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub peaks: Vec<RawPeak>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPeak {
    pub name: Option<String>,
    pub model_name: Option<String>,
    pub center: Option<f64>,
    pub fwhm: Option<f64>,
    pub area: Option<f64>,
}

// ---------------------------------------------------------------------------
// Patches: the only mutation path besides construction
// ---------------------------------------------------------------------------

/// Attribute changes for a spectrum. `None` fields are left untouched.
///
/// The same type describes what changed in [`crate::events::Event::ChangedSpectrum`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumPatch {
    pub name: Option<String>,
    pub notes: Option<String>,
    pub eis_region: Option<i64>,
    pub fname: Option<String>,
    pub sweeps: Option<u32>,
    pub dwelltime: Option<f64>,
    pub passenergy: Option<f64>,
    pub visibility: Option<String>,
    pub smoothness: Option<usize>,
    pub calibration: Option<f64>,
    pub norm: Option<Normalization>,
}

impl SpectrumPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether this patch touches the processed energy/intensity arrays.
    pub fn touches_processing(&self) -> bool {
        self.smoothness.is_some() || self.calibration.is_some() || self.norm.is_some()
    }
}

/// Attribute changes for a region.
///
/// `spectrum_changed` forces a re-slice against the spectrum's current arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionPatch {
    pub emin: Option<f64>,
    pub emax: Option<f64>,
    pub bgtype: Option<BgType>,
    pub name: Option<String>,
    pub spectrum_changed: bool,
}

impl RegionPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Store `new` into `slot` if it differs; returns the value that was stored.
pub(crate) fn update_field<T: PartialEq + Clone>(slot: &mut T, new: Option<T>) -> Option<T> {
    match new {
        Some(value) if *slot != value => {
            *slot = value.clone();
            Some(value)
        }
        _ => None,
    }
}

/// Drop a non-finite value; NaN never equals the stored one and would count
/// as a change on every call.
pub(crate) fn finite(field: &str, value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if !v.is_finite() => {
            log::warn!("ignoring non-finite {field}: {v}");
            None
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

/// Letter label for the `n`-th peak of a region: A..Z, AA, AB, ...
pub fn peak_label(mut n: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sids_are_unique() {
        let a = next_sid();
        let b = next_sid();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn bgtype_parses_case_insensitively() {
        assert_eq!("Shirley".parse::<BgType>(), Ok(BgType::Shirley));
        assert_eq!(" linear ".parse::<BgType>(), Ok(BgType::Linear));
        assert_eq!("none".parse::<BgType>(), Ok(BgType::None));
        assert_eq!(
            "tougaard".parse::<BgType>(),
            Err(XpsError::UnknownBackground("tougaard".into()))
        );
    }

    #[test]
    fn peak_labels_continue_past_z() {
        assert_eq!(peak_label(0), "A");
        assert_eq!(peak_label(25), "Z");
        assert_eq!(peak_label(26), "AA");
        assert_eq!(peak_label(27), "AB");
        assert_eq!(peak_label(26 + 26 * 26), "AAA");
    }

    #[test]
    fn raw_spectrum_accepts_xy_aliases() {
        let raw: RawSpectrum =
            serde_json::from_str(r#"{"x": [2.0, 1.0], "y": [5.0, 6.0], "sweeps": 3}"#).unwrap();
        assert_eq!(raw.energy, Some(vec![2.0, 1.0]));
        assert_eq!(raw.intensity, Some(vec![5.0, 6.0]));
        assert_eq!(raw.sweeps, 3);
        assert_eq!(raw.norm, Normalization::Off);
    }

    #[test]
    fn normalization_serde_shape() {
        assert_eq!(serde_json::to_string(&Normalization::Max).unwrap(), r#""max""#);
        assert_eq!(
            serde_json::to_string(&Normalization::Value(2.5)).unwrap(),
            r#"{"value":2.5}"#
        );
    }

    #[test]
    fn patch_helpers() {
        assert!(SpectrumPatch::default().is_empty());
        let p = SpectrumPatch {
            calibration: Some(0.3),
            ..Default::default()
        };
        assert!(p.touches_processing());
        let q = SpectrumPatch {
            name: Some("x".into()),
            ..Default::default()
        };
        assert!(!q.touches_processing());
        assert!(RegionPatch::default().is_empty());
    }
}
