//! Fit-model collaborator.
//!
//! Peaks hold no numeric fit state. Each region owns one [`FitModel`] that
//! keeps the parameters of its peaks, keyed by peak id, and evaluates or
//! refines them against the region's background-subtracted signal.
//! [`LineShapeModel`] is the built-in implementation.

use std::f64::consts::{LN_2, PI};
use std::fmt;
use std::str::FromStr;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::data::model::Sid;
use crate::error::{Result, XpsError};

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// One of the three parameters every peak carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeakParam {
    Center,
    Fwhm,
    Area,
}

impl PeakParam {
    pub const ALL: [PeakParam; 3] = [PeakParam::Center, PeakParam::Fwhm, PeakParam::Area];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeakParam::Center => "center",
            PeakParam::Fwhm => "fwhm",
            PeakParam::Area => "area",
        }
    }

    fn index(self) -> usize {
        match self {
            PeakParam::Center => 0,
            PeakParam::Fwhm => 1,
            PeakParam::Area => 2,
        }
    }
}

impl fmt::Display for PeakParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Region samples handed to the fit model.
#[derive(Debug, Clone, Copy)]
pub struct FitData<'a> {
    pub energy: &'a [f64],
    /// Intensity minus background.
    pub signal: &'a [f64],
}

/// Initial parameters of a newly registered peak.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PeakInit {
    /// Estimate from what the other peaks leave unexplained.
    #[default]
    Guess,
    Params { center: f64, fwhm: f64, area: f64 },
}

/// Bounds and expression of one parameter. Setting a constraint only
/// overwrites the fields that are `Some`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraint {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub expr: Option<String>,
}

impl Constraint {
    fn merge(&mut self, other: Constraint) {
        if other.min.is_some() {
            self.min = other.min;
        }
        if other.max.is_some() {
            self.max = other.max;
        }
        if other.expr.is_some() {
            self.expr = other.expr.filter(|e| !e.trim().is_empty());
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        let value = self.min.map_or(value, |m| value.max(m));
        self.max.map_or(value, |m| value.min(m))
    }

    fn is_fixed(&self) -> bool {
        self.expr.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintArg {
    Min,
    Max,
    Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintValue {
    Bound(f64),
    Expr(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    /// Residual evaluations the solver used.
    pub evaluations: usize,
    pub chi_square: f64,
    pub converged: bool,
}

/// Numeric state of all peaks of one region.
///
/// `evaluate` and `evaluate_region_total` return `None` until a fit has
/// succeeded, and again after peaks are registered or removed.
pub trait FitModel {
    fn register(&mut self, peak: Sid, model: &str, init: PeakInit, data: &FitData<'_>)
        -> Result<()>;
    fn deregister(&mut self, peak: Sid);
    /// Switch the line shape of `peak` and estimate its parameters again.
    fn reinit(&mut self, peak: Sid, model: &str, data: &FitData<'_>) -> Result<()>;
    fn evaluate(&self, peak: Sid, energy: &[f64]) -> Option<Vec<f64>>;
    fn evaluate_region_total(&self, energy: &[f64]) -> Option<Vec<f64>>;
    fn fit_region(&mut self, data: &FitData<'_>) -> Result<FitReport>;
    fn set_constraint(&mut self, peak: Sid, param: PeakParam, constraint: Constraint)
        -> Result<()>;
    fn get_constraint(
        &self,
        peak: Sid,
        param: PeakParam,
        arg: ConstraintArg,
    ) -> Option<ConstraintValue>;
    fn param(&self, peak: Sid, param: PeakParam) -> Option<f64>;
    /// Store `value`, clamped to the constraint bounds, and return what was
    /// stored.
    fn set_param(&mut self, peak: Sid, param: PeakParam, value: f64) -> Result<f64>;
}

// ---------------------------------------------------------------------------
// Line shapes
// ---------------------------------------------------------------------------

/// Area-normalised peak profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineShape {
    Gaussian,
    Lorentzian,
    /// Equal mix of Gaussian and Lorentzian with a shared FWHM.
    PseudoVoigt,
}

impl LineShape {
    pub const ALL: [LineShape; 3] = [
        LineShape::Gaussian,
        LineShape::Lorentzian,
        LineShape::PseudoVoigt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LineShape::Gaussian => "Gaussian",
            LineShape::Lorentzian => "Lorentzian",
            LineShape::PseudoVoigt => "PseudoVoigt",
        }
    }

    /// Value at `x` of a unit-area profile.
    pub fn profile(&self, x: f64, center: f64, fwhm: f64) -> f64 {
        let gaussian = || {
            let sigma = fwhm / (2.0 * (2.0 * LN_2).sqrt());
            (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp() / (sigma * (2.0 * PI).sqrt())
        };
        let lorentzian = || {
            let gamma = fwhm / 2.0;
            gamma / (PI * ((x - center).powi(2) + gamma * gamma))
        };
        match self {
            LineShape::Gaussian => gaussian(),
            LineShape::Lorentzian => lorentzian(),
            LineShape::PseudoVoigt => 0.5 * gaussian() + 0.5 * lorentzian(),
        }
    }
}

impl fmt::Display for LineShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineShape {
    type Err = XpsError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        LineShape::ALL
            .into_iter()
            .find(|shape| shape.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| XpsError::UnknownLineShape(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Built-in model
// ---------------------------------------------------------------------------

const MIN_FWHM: f64 = 1e-6;

struct PeakState {
    sid: Sid,
    shape: LineShape,
    /// center, fwhm, area
    values: [f64; 3],
    constraints: [Constraint; 3],
}

impl PeakState {
    fn curve(&self, energy: &[f64]) -> Vec<f64> {
        energy.iter().map(|&e| self.at(e, &self.values)).collect()
    }

    fn at(&self, e: f64, values: &[f64; 3]) -> f64 {
        values[2] * self.shape.profile(e, values[0], values[1])
    }

    /// Hard physical limits plus the user bounds.
    fn limit(&self, index: usize, value: f64) -> f64 {
        let value = match index {
            1 => value.max(MIN_FWHM),
            2 => value.max(0.0),
            _ => value,
        };
        self.constraints[index].clamp(value)
    }

    /// Interval the fit may move parameter `index` in; `None` when it is
    /// held fixed.
    fn bounds(&self, index: usize) -> Option<Bounds> {
        let constraint = &self.constraints[index];
        if constraint.is_fixed() {
            return None;
        }
        let floor = match index {
            1 => Some(MIN_FWHM),
            2 => Some(0.0),
            _ => None,
        };
        let min = match (floor, constraint.min) {
            (Some(floor), Some(min)) => Some(floor.max(min)),
            (floor, min) => floor.or(min),
        };
        Bounds::new(min, constraint.max)
    }
}

/// Box constraint of a free parameter, mapped onto an unbounded internal
/// coordinate so the solver never steps outside it.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Bounds {
    Unbounded,
    Lower(f64),
    Upper(f64),
    Both(f64, f64),
}

impl Bounds {
    fn new(min: Option<f64>, max: Option<f64>) -> Option<Self> {
        match (min, max) {
            (None, None) => Some(Bounds::Unbounded),
            (Some(lo), None) => Some(Bounds::Lower(lo)),
            (None, Some(hi)) => Some(Bounds::Upper(hi)),
            (Some(lo), Some(hi)) if lo < hi => Some(Bounds::Both(lo, hi)),
            // empty interval, the clamped value stays put
            _ => None,
        }
    }

    fn to_internal(self, x: f64) -> f64 {
        match self {
            Bounds::Unbounded => x,
            Bounds::Lower(lo) => ((x - lo + 1.0).powi(2) - 1.0).max(0.0).sqrt(),
            Bounds::Upper(hi) => ((hi - x + 1.0).powi(2) - 1.0).max(0.0).sqrt(),
            Bounds::Both(lo, hi) => (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0).asin(),
        }
    }

    fn to_external(self, u: f64) -> f64 {
        match self {
            Bounds::Unbounded => u,
            Bounds::Lower(lo) => lo - 1.0 + (u * u + 1.0).sqrt(),
            Bounds::Upper(hi) => hi + 1.0 - (u * u + 1.0).sqrt(),
            Bounds::Both(lo, hi) => lo + (u.sin() + 1.0) * (hi - lo) / 2.0,
        }
    }
}

struct FreeParam {
    peak: usize,
    index: usize,
    bounds: Bounds,
}

/// Least-squares view of one region fit. The solver only sees the internal
/// coordinates of the free parameters; fixed ones ride along in `values`.
struct LineShapeProblem<'a> {
    peaks: &'a [PeakState],
    data: FitData<'a>,
    free: Vec<FreeParam>,
    values: Vec<[f64; 3]>,
    internal: DVector<f64>,
}

impl LineShapeProblem<'_> {
    fn model_at(&self, e: f64) -> f64 {
        self.peaks
            .iter()
            .zip(&self.values)
            .map(|(peak, values)| peak.at(e, values))
            .sum()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for LineShapeProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.internal = x.clone();
        for (free, &u) in self.free.iter().zip(x.iter()) {
            self.values[free.peak][free.index] = free.bounds.to_external(u);
        }
    }

    fn params(&self) -> DVector<f64> {
        self.internal.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(DVector::from_iterator(
            self.data.energy.len(),
            self.data
                .energy
                .iter()
                .zip(self.data.signal)
                .map(|(&e, &s)| self.model_at(e) - s),
        ))
    }

    /// Forward differences in the internal coordinates.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.data.energy.len(), self.free.len());
        for (k, free) in self.free.iter().enumerate() {
            let u = self.internal[k];
            let step = f64::EPSILON.sqrt() * u.abs().max(1.0);
            let peak = &self.peaks[free.peak];
            let values = self.values[free.peak];
            let mut shifted = values;
            shifted[free.index] = free.bounds.to_external(u + step);
            for (row, &e) in self.data.energy.iter().enumerate() {
                jacobian[(row, k)] = (peak.at(e, &shifted) - peak.at(e, &values)) / step;
            }
        }
        Some(jacobian)
    }
}

/// Sum-of-line-shapes model refined with Levenberg–Marquardt.
pub struct LineShapeModel {
    peaks: Vec<PeakState>,
    fitted: bool,
    /// Residual evaluations allowed per free parameter.
    pub patience: usize,
    /// Relative reduction of chi² and of the step below which the fit
    /// counts as converged.
    pub tolerance: f64,
}

impl Default for LineShapeModel {
    fn default() -> Self {
        Self {
            peaks: Vec::new(),
            fitted: false,
            patience: 100,
            tolerance: f64::EPSILON.sqrt(),
        }
    }
}

impl LineShapeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    fn state(&self, peak: Sid) -> Option<&PeakState> {
        self.peaks.iter().find(|p| p.sid == peak)
    }

    fn state_mut(&mut self, peak: Sid) -> Result<&mut PeakState> {
        self.peaks
            .iter_mut()
            .find(|p| p.sid == peak)
            .ok_or(XpsError::UnknownPeak(peak))
    }

    /// Signal left after subtracting every peak except `skip`.
    fn residual(&self, data: &FitData<'_>, skip: Sid) -> Vec<f64> {
        let mut residual = data.signal.to_vec();
        for peak in self.peaks.iter().filter(|p| p.sid != skip) {
            for (r, &e) in residual.iter_mut().zip(data.energy) {
                *r -= peak.at(e, &peak.values);
            }
        }
        residual
    }

    fn model_at(&self, e: f64, params: &[[f64; 3]]) -> f64 {
        self.peaks
            .iter()
            .zip(params)
            .map(|(peak, values)| peak.at(e, values))
            .sum()
    }

    fn chi_square(&self, data: &FitData<'_>, params: &[[f64; 3]]) -> f64 {
        data.energy
            .iter()
            .zip(data.signal)
            .map(|(&e, &s)| (s - self.model_at(e, params)).powi(2))
            .sum()
    }
}

/// Center at the residual maximum, FWHM from the half-maximum crossings,
/// area from the height.
fn guess(shape: LineShape, energy: &[f64], residual: &[f64]) -> Result<[f64; 3]> {
    let n = energy.len().min(residual.len());
    if n == 0 {
        return Err(XpsError::FitFailed("no samples to estimate a peak from".into()));
    }
    let (top, height) = residual[..n]
        .iter()
        .copied()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .unwrap_or((0, 0.0));
    let center = energy[top];

    let spacing = if n > 1 {
        ((energy[n - 1] - energy[0]) / (n - 1) as f64).abs()
    } else {
        0.0
    };
    let half = height / 2.0;
    let mut lo = top;
    while lo > 0 && residual[lo - 1] > half {
        lo -= 1;
    }
    let mut hi = top;
    while hi + 1 < n && residual[hi + 1] > half {
        hi += 1;
    }
    let width = (energy[hi] - energy[lo]).abs();
    let fwhm = width.max(2.0 * spacing).max(MIN_FWHM);

    let area = if height.is_finite() && height > 0.0 {
        height / shape.profile(center, center, fwhm)
    } else {
        0.0
    };
    Ok([center, fwhm, area])
}

fn check_param(param: PeakParam, value: f64) -> Result<()> {
    let valid = value.is_finite()
        && match param {
            PeakParam::Center => true,
            PeakParam::Fwhm => value > 0.0,
            PeakParam::Area => value >= 0.0,
        };
    if valid {
        Ok(())
    } else {
        Err(XpsError::InvalidParameter {
            param: param.as_str(),
            value,
        })
    }
}

impl FitModel for LineShapeModel {
    fn register(
        &mut self,
        peak: Sid,
        model: &str,
        init: PeakInit,
        data: &FitData<'_>,
    ) -> Result<()> {
        let shape: LineShape = model.parse()?;
        let values = match init {
            PeakInit::Params { center, fwhm, area } => {
                check_param(PeakParam::Center, center)?;
                check_param(PeakParam::Fwhm, fwhm)?;
                check_param(PeakParam::Area, area)?;
                [center, fwhm, area]
            }
            PeakInit::Guess => guess(shape, data.energy, &self.residual(data, peak))?,
        };
        log::debug!("register peak {peak} as {shape}: {values:?}");
        self.peaks.retain(|p| p.sid != peak);
        self.peaks.push(PeakState {
            sid: peak,
            shape,
            values,
            constraints: Default::default(),
        });
        self.fitted = false;
        Ok(())
    }

    fn deregister(&mut self, peak: Sid) {
        let before = self.peaks.len();
        self.peaks.retain(|p| p.sid != peak);
        if self.peaks.len() != before {
            self.fitted = false;
        }
    }

    fn reinit(&mut self, peak: Sid, model: &str, data: &FitData<'_>) -> Result<()> {
        let shape: LineShape = model.parse()?;
        let residual = self.residual(data, peak);
        let values = guess(shape, data.energy, &residual)?;
        let state = self.state_mut(peak)?;
        state.shape = shape;
        for (i, value) in values.into_iter().enumerate() {
            state.values[i] = state.limit(i, value);
        }
        self.fitted = false;
        Ok(())
    }

    fn evaluate(&self, peak: Sid, energy: &[f64]) -> Option<Vec<f64>> {
        if !self.fitted {
            return None;
        }
        self.state(peak).map(|p| p.curve(energy))
    }

    fn evaluate_region_total(&self, energy: &[f64]) -> Option<Vec<f64>> {
        if !self.fitted || self.peaks.is_empty() {
            return None;
        }
        let params: Vec<[f64; 3]> = self.peaks.iter().map(|p| p.values).collect();
        Some(energy.iter().map(|&e| self.model_at(e, &params)).collect())
    }

    fn fit_region(&mut self, data: &FitData<'_>) -> Result<FitReport> {
        if self.peaks.is_empty() {
            return Err(XpsError::FitFailed("region has no peaks".into()));
        }
        let n = data.energy.len().min(data.signal.len());
        if n == 0 {
            return Err(XpsError::FitFailed("region has no samples".into()));
        }
        let data = FitData {
            energy: &data.energy[..n],
            signal: &data.signal[..n],
        };

        let values: Vec<[f64; 3]> = self
            .peaks
            .iter()
            .map(|peak| {
                let mut v = peak.values;
                for (i, value) in v.iter_mut().enumerate() {
                    *value = peak.limit(i, *value);
                }
                v
            })
            .collect();
        let free: Vec<FreeParam> = self
            .peaks
            .iter()
            .enumerate()
            .flat_map(|(p, peak)| {
                (0..3).filter_map(move |index| {
                    peak.bounds(index).map(|bounds| FreeParam {
                        peak: p,
                        index,
                        bounds,
                    })
                })
            })
            .collect();

        let (values, evaluations, converged) = if free.is_empty() {
            (values, 0, true)
        } else {
            let internal = DVector::from_iterator(
                free.len(),
                free.iter()
                    .map(|f| f.bounds.to_internal(values[f.peak][f.index])),
            );
            let problem = LineShapeProblem {
                peaks: &self.peaks,
                data,
                free,
                values,
                internal,
            };
            let (problem, report) = LevenbergMarquardt::new()
                .with_ftol(self.tolerance)
                .with_xtol(self.tolerance)
                .with_patience(self.patience)
                .minimize(problem);
            log::debug!(
                "fit ended with {:?} after {} evaluations",
                report.termination,
                report.number_of_evaluations
            );
            if let TerminationReason::Numerical(what) = report.termination {
                return Err(XpsError::FitFailed(format!("numerical failure in {what}")));
            }
            (
                problem.values,
                report.number_of_evaluations,
                report.termination.was_successful(),
            )
        };

        for (peak, values) in self.peaks.iter_mut().zip(values) {
            for (i, value) in values.into_iter().enumerate() {
                peak.values[i] = peak.limit(i, value);
            }
        }
        let params: Vec<[f64; 3]> = self.peaks.iter().map(|p| p.values).collect();
        let chi_square = self.chi_square(&data, &params);
        if !chi_square.is_finite() {
            return Err(XpsError::FitFailed("chi² is not finite".into()));
        }
        self.fitted = true;
        if !converged {
            log::warn!("fit stopped after {evaluations} evaluations without converging");
        }
        Ok(FitReport {
            evaluations,
            chi_square,
            converged,
        })
    }

    fn set_constraint(
        &mut self,
        peak: Sid,
        param: PeakParam,
        constraint: Constraint,
    ) -> Result<()> {
        let state = self.state_mut(peak)?;
        let index = param.index();
        state.constraints[index].merge(constraint);
        state.values[index] = state.limit(index, state.values[index]);
        Ok(())
    }

    fn get_constraint(
        &self,
        peak: Sid,
        param: PeakParam,
        arg: ConstraintArg,
    ) -> Option<ConstraintValue> {
        let constraint = &self.state(peak)?.constraints[param.index()];
        match arg {
            ConstraintArg::Min => constraint.min.map(ConstraintValue::Bound),
            ConstraintArg::Max => constraint.max.map(ConstraintValue::Bound),
            ConstraintArg::Expr => constraint.expr.clone().map(ConstraintValue::Expr),
        }
    }

    fn param(&self, peak: Sid, param: PeakParam) -> Option<f64> {
        self.state(peak).map(|p| p.values[param.index()])
    }

    fn set_param(&mut self, peak: Sid, param: PeakParam, value: f64) -> Result<f64> {
        check_param(param, value)?;
        let state = self.state_mut(peak)?;
        let index = param.index();
        state.values[index] = state.constraints[index].clamp(value);
        Ok(state.values[index])
    }
}

impl fmt::Debug for LineShapeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineShapeModel")
            .field("peaks", &self.peaks.len())
            .field("fitted", &self.fitted)
            .finish()
    }
}
