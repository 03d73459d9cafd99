use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Result, XpsError};
use crate::events::{ChangeBus, Event, Source, Subscriber};
use crate::fit::{FitModel, LineShapeModel};

use super::model::{
    finite, next_sid, update_field, Normalization, RawRegion, RawSpectrum, RegionPatch, Sid,
    SpectrumPatch,
};
use super::processing::{energy_at_maximum, moving_average, normalize};
use super::region::{Region, RegionOptions};

/// Visibility flags given to spectra that do not specify any.
pub const DEFAULT_VISIBILITY: &str = "dbrp";

// ---------------------------------------------------------------------------
// Spectrum state
// ---------------------------------------------------------------------------

pub(crate) struct SpectrumInner {
    sid: Sid,
    name: String,
    notes: String,
    eis_region: i64,
    fname: String,
    sweeps: u32,
    dwelltime: f64,
    passenergy: f64,
    visibility: String,
    smoothness: usize,
    calibration: f64,
    norm: Normalization,

    raw_energy: Rc<[f64]>,
    raw_intensity: Rc<[f64]>,
    /// `raw_energy + calibration`.
    pub(super) energy: Rc<[f64]>,
    /// `moving_average(normalize(raw_intensity, norm), 2 * smoothness + 1)`.
    pub(super) intensity: Rc<[f64]>,
    /// Bumped whenever `energy` or `intensity` is recomputed.
    pub(super) generation: u64,

    regions: Vec<Region>,
    region_counter: usize,
    bus: ChangeBus,
}

impl SpectrumInner {
    fn apply(&mut self, patch: SpectrumPatch) -> SpectrumPatch {
        SpectrumPatch {
            name: update_field(&mut self.name, patch.name),
            notes: update_field(&mut self.notes, patch.notes),
            eis_region: update_field(&mut self.eis_region, patch.eis_region),
            fname: update_field(&mut self.fname, patch.fname),
            sweeps: update_field(&mut self.sweeps, patch.sweeps),
            dwelltime: update_field(&mut self.dwelltime, finite("dwelltime", patch.dwelltime)),
            passenergy: update_field(&mut self.passenergy, finite("passenergy", patch.passenergy)),
            visibility: update_field(&mut self.visibility, patch.visibility),
            smoothness: update_field(&mut self.smoothness, patch.smoothness),
            calibration: update_field(
                &mut self.calibration,
                finite("calibration", patch.calibration),
            ),
            norm: update_field(&mut self.norm, patch.norm),
        }
    }

    fn reprocess_energy(&mut self) {
        self.energy = if self.calibration == 0.0 {
            Rc::clone(&self.raw_energy)
        } else {
            self.raw_energy.iter().map(|e| e + self.calibration).collect()
        };
    }

    fn reprocess_intensity(&mut self) {
        self.intensity = if self.norm.is_off() && self.smoothness == 0 {
            Rc::clone(&self.raw_intensity)
        } else {
            let window = 2 * self.smoothness + 1;
            moving_average(&normalize(&self.raw_intensity, self.norm), window).into()
        };
    }
}

// ---------------------------------------------------------------------------
// Spectrum handle
// ---------------------------------------------------------------------------

/// One measured energy/intensity curve with metadata, processing parameters
/// and an ordered list of regions.
///
/// Cloning the handle shares the spectrum.
#[derive(Clone)]
pub struct Spectrum(pub(super) Rc<RefCell<SpectrumInner>>);

impl Spectrum {
    /// Build a spectrum (and its stored regions/peaks) from an imported mapping.
    pub fn new(raw: RawSpectrum) -> Result<Self> {
        let energy = raw.energy.ok_or(XpsError::MissingField {
            entity: "spectrum",
            field: "energy",
        })?;
        let intensity = raw.intensity.ok_or(XpsError::MissingField {
            entity: "spectrum",
            field: "intensity",
        })?;
        if energy.len() != intensity.len() {
            return Err(XpsError::LengthMismatch {
                energy: energy.len(),
                intensity: intensity.len(),
            });
        }
        if energy.is_empty() {
            return Err(XpsError::EmptySpectrum);
        }

        let name = if raw.name.is_empty() {
            format!("(R {})", raw.eis_region)
        } else {
            raw.name
        };
        let raw_energy: Rc<[f64]> = energy.into();
        let raw_intensity: Rc<[f64]> = intensity.into();

        let mut inner = SpectrumInner {
            sid: next_sid(),
            name,
            notes: raw.notes,
            eis_region: raw.eis_region,
            fname: raw.fname,
            sweeps: raw.sweeps,
            dwelltime: raw.dwelltime,
            passenergy: raw.passenergy,
            visibility: raw
                .visibility
                .unwrap_or_else(|| DEFAULT_VISIBILITY.to_string()),
            smoothness: raw.smoothness,
            calibration: raw.calibration,
            norm: raw.norm,
            energy: Rc::clone(&raw_energy),
            intensity: Rc::clone(&raw_intensity),
            raw_energy,
            raw_intensity,
            generation: 0,
            regions: Vec::new(),
            region_counter: 0,
            bus: ChangeBus::new(),
        };
        inner.reprocess_energy();
        inner.reprocess_intensity();

        let spectrum = Spectrum(Rc::new(RefCell::new(inner)));
        for region in &raw.regions {
            spectrum.add_region_from(region)?;
        }
        Ok(spectrum)
    }

    // -- plain attributes --

    pub fn sid(&self) -> Sid {
        self.0.borrow().sid
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn notes(&self) -> String {
        self.0.borrow().notes.clone()
    }

    pub fn eis_region(&self) -> i64 {
        self.0.borrow().eis_region
    }

    pub fn fname(&self) -> String {
        self.0.borrow().fname.clone()
    }

    pub fn sweeps(&self) -> u32 {
        self.0.borrow().sweeps
    }

    pub fn dwelltime(&self) -> f64 {
        self.0.borrow().dwelltime
    }

    pub fn passenergy(&self) -> f64 {
        self.0.borrow().passenergy
    }

    pub fn visibility(&self) -> String {
        self.0.borrow().visibility.clone()
    }

    /// Whether a renderer should draw the part named by `flag`
    /// (`b`ackground, `d`ata, `r`egions, `p`eaks).
    pub fn is_visible(&self, flag: char) -> bool {
        self.0.borrow().visibility.contains(flag)
    }

    /// Moving-average half-width in samples; the window is
    /// `2 * smoothness + 1` and 0 leaves the intensity untouched.
    pub fn smoothness(&self) -> usize {
        self.0.borrow().smoothness
    }

    pub fn calibration(&self) -> f64 {
        self.0.borrow().calibration
    }

    pub fn norm(&self) -> Normalization {
        self.0.borrow().norm
    }

    /// Counter bumped on every recomputation of the processed arrays.
    pub fn generation(&self) -> u64 {
        self.0.borrow().generation
    }

    pub fn len(&self) -> usize {
        self.0.borrow().raw_energy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- arrays --

    pub fn raw_energy(&self) -> Rc<[f64]> {
        Rc::clone(&self.0.borrow().raw_energy)
    }

    pub fn raw_intensity(&self) -> Rc<[f64]> {
        Rc::clone(&self.0.borrow().raw_intensity)
    }

    /// Calibrated energy axis.
    pub fn energy(&self) -> Rc<[f64]> {
        Rc::clone(&self.0.borrow().energy)
    }

    /// Normalized and smoothed intensity.
    pub fn intensity(&self) -> Rc<[f64]> {
        Rc::clone(&self.0.borrow().intensity)
    }

    // -- mutation --

    /// Apply `patch` and return what actually changed.
    ///
    /// Processed arrays are recomputed and every region re-sliced before
    /// `changed_spectrum` is emitted. Nothing is emitted if nothing changed.
    pub fn set(&self, patch: SpectrumPatch) -> SpectrumPatch {
        let (changed, regions) = {
            let mut inner = self.0.borrow_mut();
            let changed = inner.apply(patch);
            if changed.is_empty() {
                return changed;
            }
            if changed.calibration.is_some() {
                inner.reprocess_energy();
            }
            if changed.smoothness.is_some() || changed.norm.is_some() {
                inner.reprocess_intensity();
            }
            let regions = if changed.touches_processing() {
                inner.generation += 1;
                log::debug!(
                    "spectrum {}: reprocessed (generation {})",
                    inner.sid,
                    inner.generation
                );
                inner.regions.clone()
            } else {
                Vec::new()
            };
            (changed, regions)
        };

        for region in &regions {
            region.set(RegionPatch {
                spectrum_changed: true,
                ..Default::default()
            });
        }
        self.emit(Event::ChangedSpectrum(changed.clone()));
        changed
    }

    pub fn set_calibration(&self, calibration: f64) -> SpectrumPatch {
        self.set(SpectrumPatch {
            calibration: Some(calibration),
            ..Default::default()
        })
    }

    pub fn set_smoothness(&self, smoothness: usize) -> SpectrumPatch {
        self.set(SpectrumPatch {
            smoothness: Some(smoothness),
            ..Default::default()
        })
    }

    pub fn set_norm(&self, norm: Normalization) -> SpectrumPatch {
        self.set(SpectrumPatch {
            norm: Some(norm),
            ..Default::default()
        })
    }

    pub fn set_name(&self, name: impl Into<String>) -> SpectrumPatch {
        self.set(SpectrumPatch {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    pub fn set_notes(&self, notes: impl Into<String>) -> SpectrumPatch {
        self.set(SpectrumPatch {
            notes: Some(notes.into()),
            ..Default::default()
        })
    }

    pub fn set_visibility(&self, visibility: impl Into<String>) -> SpectrumPatch {
        self.set(SpectrumPatch {
            visibility: Some(visibility.into()),
            ..Default::default()
        })
    }

    // -- calibration helpers --

    /// Energy of the highest processed intensity within `span`.
    pub fn energy_at_maximum(&self, span: (f64, f64)) -> Option<f64> {
        let inner = self.0.borrow();
        energy_at_maximum(&inner.energy, &inner.intensity, span)
    }

    /// Calibration that moves the maximum found in `span` onto `target`.
    pub fn calibration_for(&self, span: (f64, f64), target: f64) -> Option<f64> {
        let found = self.energy_at_maximum(span)?;
        Some(target - found + self.calibration())
    }

    // -- regions --

    pub fn regions(&self) -> Vec<Region> {
        self.0.borrow().regions.clone()
    }

    pub fn region_count(&self) -> usize {
        self.0.borrow().regions.len()
    }

    /// New region with default options and the built-in fit engine.
    pub fn add_region(&self, emin: f64, emax: f64) -> Region {
        self.add_region_with(
            emin,
            emax,
            RegionOptions::default(),
            Box::new(LineShapeModel::default()),
        )
    }

    /// New region named `"Region {n}"`, `n` counting every region ever
    /// created on this spectrum.
    pub fn add_region_with(
        &self,
        emin: f64,
        emax: f64,
        options: RegionOptions,
        model: Box<dyn FitModel>,
    ) -> Region {
        let (region, subscribers) = {
            let mut inner = self.0.borrow_mut();
            inner.region_counter += 1;
            let name = format!("Region {}", inner.region_counter);
            let region = Region::attach(Rc::downgrade(&self.0), name, emin, emax, options, model);
            inner.regions.push(region.clone());
            (region, inner.bus.subscribers())
        };
        region.refresh();
        for sub in subscribers {
            region.subscribe(sub);
        }
        self.emit(Event::AddRegion {
            region: region.sid(),
        });
        region
    }

    /// Rebuild a stored region together with its peaks.
    pub fn add_region_from(&self, raw: &RawRegion) -> Result<Region> {
        let emin = raw.emin.ok_or(XpsError::MissingField {
            entity: "region",
            field: "emin",
        })?;
        let emax = raw.emax.ok_or(XpsError::MissingField {
            entity: "region",
            field: "emax",
        })?;
        let options = RegionOptions {
            bgtype: raw.bgtype.unwrap_or_default(),
            ..Default::default()
        };
        let region = self.add_region_with(emin, emax, options, Box::new(LineShapeModel::default()));
        if let Some(name) = &raw.name {
            region.set_name(name.clone());
        }
        for peak in &raw.peaks {
            region.add_peak_from(peak)?;
        }
        Ok(region)
    }

    /// Remove `region`, unhook this spectrum's subscribers from it and
    /// detach its peaks. Returns `false` if it is not one of ours.
    pub fn remove_region(&self, region: &Region) -> bool {
        let subscribers = {
            let mut inner = self.0.borrow_mut();
            let Some(index) = inner.regions.iter().position(|r| r == region) else {
                return false;
            };
            inner.regions.remove(index);
            inner.bus.subscribers()
        };
        for sub in &subscribers {
            region.unsubscribe(sub);
        }
        region.detach();
        self.emit(Event::RemoveRegion {
            region: region.sid(),
        });
        true
    }

    pub fn clear_regions(&self) {
        for region in self.regions() {
            self.remove_region(&region);
        }
    }

    // -- notification --

    /// Subscribe to this spectrum and, transitively, its regions and peaks,
    /// including ones created later.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let regions = {
            let inner = self.0.borrow();
            inner.bus.subscribe(subscriber.clone());
            inner.regions.clone()
        };
        for region in regions {
            region.subscribe(subscriber.clone());
        }
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        let regions = {
            let inner = self.0.borrow();
            inner.bus.unsubscribe(subscriber);
            inner.regions.clone()
        };
        for region in regions {
            region.unsubscribe(subscriber);
        }
    }

    pub fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.0.borrow().bus.is_subscribed(subscriber)
    }

    /// Ask renderers to redraw without any data change.
    pub fn request_plot(&self) {
        self.emit(Event::Plot);
    }

    fn emit(&self, event: Event) {
        let bus = self.0.borrow().bus.clone();
        bus.emit(&event, &Source::Spectrum(self.clone()));
    }

    // -- persistence --

    /// Snapshot suitable for a project file.
    pub fn to_raw(&self) -> RawSpectrum {
        let regions = self.regions();
        let inner = self.0.borrow();
        RawSpectrum {
            energy: Some(inner.raw_energy.to_vec()),
            intensity: Some(inner.raw_intensity.to_vec()),
            name: inner.name.clone(),
            notes: inner.notes.clone(),
            eis_region: inner.eis_region,
            fname: inner.fname.clone(),
            sweeps: inner.sweeps,
            dwelltime: inner.dwelltime,
            passenergy: inner.passenergy,
            visibility: Some(inner.visibility.clone()),
            smoothness: inner.smoothness,
            calibration: inner.calibration,
            norm: inner.norm,
            regions: regions.iter().map(Region::to_raw).collect(),
        }
    }
}

impl PartialEq for Spectrum {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Spectrum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("Spectrum")
                .field("sid", &inner.sid)
                .field("name", &inner.name)
                .field("samples", &inner.raw_energy.len())
                .field("regions", &inner.regions.len())
                .finish(),
            Err(_) => f.write_str("Spectrum(<borrowed>)"),
        }
    }
}
