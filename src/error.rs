use thiserror::Error;

use crate::data::model::Sid;

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

/// Errors raised by the spectrum/region/peak model and the fit collaborator.
///
/// File-facing code (loader, project, session) wraps these in `anyhow`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum XpsError {
    #[error("missing field for {entity}: {field}")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("energy has {energy} samples but intensity has {intensity}")]
    LengthMismatch { energy: usize, intensity: usize },

    #[error("spectrum has no samples")]
    EmptySpectrum,

    #[error("unknown background type: {0}")]
    UnknownBackground(String),

    #[error("unknown line shape: {0}")]
    UnknownLineShape(String),

    #[error("no peak with id {0} is registered")]
    UnknownPeak(Sid),

    #[error("spectrum {0} is already in the container")]
    DuplicateSpectrum(Sid),

    #[error("region {0} is not attached to a spectrum")]
    DetachedRegion(Sid),

    #[error("region {0} contains no samples")]
    EmptyRegion(Sid),

    #[error("invalid value {value} for {param}")]
    InvalidParameter { param: &'static str, value: f64 },

    #[error("fit failed: {0}")]
    FitFailed(String),
}

/// Result alias for model operations.
pub type Result<T> = std::result::Result<T, XpsError>;
