use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Result, XpsError};
use crate::events::{ChangeBus, Event, Source, Subscriber};
use crate::fit::{FitData, FitModel, FitReport, PeakInit, PeakParam};

use super::model::{
    finite, next_sid, peak_label, update_field, BgType, RawPeak, RawRegion, RegionPatch, Sid,
};
use super::peak::{Peak, DEFAULT_PEAK_MODEL};
use super::processing::{
    index_range, linear_background, nearest_index, shirley, ShirleyParams, ShirleyStatus,
};
use super::spectrum::{Spectrum, SpectrumInner};

/// Creation-time settings of a region.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionOptions {
    pub bgtype: BgType,
    pub shirley: ShirleyParams,
}

// ---------------------------------------------------------------------------
// Cached derived values
// ---------------------------------------------------------------------------

/// (spectrum generation, bounds generation)
type SliceStamp = (u64, u64);

struct SliceCache {
    stamp: SliceStamp,
    range: (usize, usize),
    energy: Rc<[f64]>,
    intensity: Rc<[f64]>,
}

struct BackgroundCache {
    stamp: (SliceStamp, u64),
    curve: Option<Rc<[f64]>>,
    status: Option<ShirleyStatus>,
}

pub(crate) struct RegionInner {
    sid: Sid,
    name: String,
    emin: f64,
    emax: f64,
    bgtype: BgType,
    shirley: ShirleyParams,
    spectrum: Weak<RefCell<SpectrumInner>>,
    peaks: Vec<Peak>,
    peak_counter: usize,
    model: Box<dyn FitModel>,
    bus: ChangeBus,

    bounds_generation: u64,
    background_generation: u64,
    slice: Option<SliceCache>,
    background: Option<BackgroundCache>,
}

impl RegionInner {
    /// Bring slice and background up to date with the spectrum and our own
    /// settings. A detached region keeps whatever it computed last.
    fn refresh(&mut self) {
        let Some(spectrum) = self.spectrum.upgrade() else {
            return;
        };
        let spectrum = spectrum.borrow();

        let stamp = (spectrum.generation, self.bounds_generation);
        if self.slice.as_ref().map(|s| s.stamp) != Some(stamp) {
            let (lo, hi) = index_range(&spectrum.energy, self.emin, self.emax);
            log::debug!("region {}: slice {lo}..={hi}", self.sid);
            self.slice = Some(SliceCache {
                stamp,
                range: (lo, hi),
                energy: spectrum.energy[lo..=hi].into(),
                intensity: spectrum.intensity[lo..=hi].into(),
            });
        }

        let bg_stamp = (stamp, self.background_generation);
        if self.background.as_ref().map(|b| b.stamp) == Some(bg_stamp) {
            return;
        }
        let Some(slice) = self.slice.as_ref() else {
            return;
        };
        let (curve, status) = match self.bgtype {
            BgType::None => (None, None),
            BgType::Linear => (Some(linear_background(&slice.intensity).into()), None),
            BgType::Shirley => {
                let bg = shirley(&slice.energy, &slice.intensity, self.shirley);
                log::debug!(
                    "region {}: shirley {:?} after {} iteration(s)",
                    self.sid,
                    bg.status,
                    bg.iterations
                );
                (Some(bg.curve.into()), Some(bg.status))
            }
        };
        self.background = Some(BackgroundCache {
            stamp: bg_stamp,
            curve,
            status,
        });
    }
}

fn empty() -> Rc<[f64]> {
    Rc::from(Vec::new())
}

// ---------------------------------------------------------------------------
// Region handle
// ---------------------------------------------------------------------------

/// An energy sub-range of a spectrum with its own background and peaks.
///
/// `emin`/`emax` are stored as given; the slice is taken between the two
/// looked-up indices in ascending index order, whatever the axis direction.
#[derive(Clone)]
pub struct Region(pub(super) Rc<RefCell<RegionInner>>);

impl Region {
    pub(super) fn attach(
        spectrum: Weak<RefCell<SpectrumInner>>,
        name: String,
        emin: f64,
        emax: f64,
        options: RegionOptions,
        model: Box<dyn FitModel>,
    ) -> Self {
        Region(Rc::new(RefCell::new(RegionInner {
            sid: next_sid(),
            name,
            emin,
            emax,
            bgtype: options.bgtype,
            shirley: options.shirley,
            spectrum,
            peaks: Vec::new(),
            peak_counter: 0,
            model,
            bus: ChangeBus::new(),
            bounds_generation: 0,
            background_generation: 0,
            slice: None,
            background: None,
        })))
    }

    pub(super) fn refresh(&self) {
        self.0.borrow_mut().refresh();
    }

    /// Drop the link to the spectrum and detach every peak.
    pub(super) fn detach(&self) {
        let peaks = {
            let mut inner = self.0.borrow_mut();
            inner.spectrum = Weak::new();
            std::mem::take(&mut inner.peaks)
        };
        for peak in peaks {
            self.0.borrow_mut().model.deregister(peak.sid());
            peak.detach();
        }
    }

    // -- attributes --

    pub fn sid(&self) -> Sid {
        self.0.borrow().sid
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn emin(&self) -> f64 {
        self.0.borrow().emin
    }

    pub fn emax(&self) -> f64 {
        self.0.borrow().emax
    }

    pub fn bgtype(&self) -> BgType {
        self.0.borrow().bgtype
    }

    pub fn shirley_params(&self) -> ShirleyParams {
        self.0.borrow().shirley
    }

    pub fn spectrum(&self) -> Option<Spectrum> {
        self.0.borrow().spectrum.upgrade().map(Spectrum)
    }

    pub fn is_attached(&self) -> bool {
        self.0.borrow().spectrum.strong_count() > 0
    }

    // -- derived values --

    /// Inclusive index range into the spectrum's arrays.
    pub fn index_range(&self) -> Option<(usize, usize)> {
        let mut inner = self.0.borrow_mut();
        inner.refresh();
        inner.slice.as_ref().map(|s| s.range)
    }

    pub fn energy(&self) -> Rc<[f64]> {
        let mut inner = self.0.borrow_mut();
        inner.refresh();
        inner
            .slice
            .as_ref()
            .map(|s| Rc::clone(&s.energy))
            .unwrap_or_else(empty)
    }

    pub fn intensity(&self) -> Rc<[f64]> {
        let mut inner = self.0.borrow_mut();
        inner.refresh();
        inner
            .slice
            .as_ref()
            .map(|s| Rc::clone(&s.intensity))
            .unwrap_or_else(empty)
    }

    /// Background over the slice; `None` for [`BgType::None`].
    pub fn background(&self) -> Option<Rc<[f64]>> {
        let mut inner = self.0.borrow_mut();
        inner.refresh();
        inner.background.as_ref().and_then(|b| b.curve.clone())
    }

    /// Outcome of the last Shirley computation, if that is the active type.
    pub fn background_status(&self) -> Option<ShirleyStatus> {
        let mut inner = self.0.borrow_mut();
        inner.refresh();
        inner.background.as_ref().and_then(|b| b.status)
    }

    /// Background value at the sample closest to `energy`.
    pub fn background_from_energy(&self, energy: f64) -> Option<f64> {
        let axis = self.energy();
        let background = self.background()?;
        let index = nearest_index(&axis, energy)?;
        background.get(index).copied()
    }

    /// Intensity minus background (or plain intensity without background).
    pub fn subtracted_intensity(&self) -> Vec<f64> {
        let intensity = self.intensity();
        match self.background() {
            Some(bg) => intensity.iter().zip(bg.iter()).map(|(i, b)| i - b).collect(),
            None => intensity.to_vec(),
        }
    }

    // -- mutation --

    /// Apply `patch` and return what actually changed.
    ///
    /// The slice is recomputed when a bound changed or the spectrum changed,
    /// the background when the slice or the background type changed. Both
    /// happen before `changed_region` is emitted.
    pub fn set(&self, patch: RegionPatch) -> RegionPatch {
        let changed = {
            let mut inner = self.0.borrow_mut();
            let emin = update_field(&mut inner.emin, finite("emin", patch.emin));
            let emax = update_field(&mut inner.emax, finite("emax", patch.emax));
            if emin.is_some() || emax.is_some() {
                inner.bounds_generation += 1;
            }
            let bgtype = update_field(&mut inner.bgtype, patch.bgtype);
            if bgtype.is_some() {
                inner.background_generation += 1;
            }
            let name = update_field(&mut inner.name, patch.name);
            // a detached region keeps its last slice
            if patch.spectrum_changed && inner.spectrum.strong_count() > 0 {
                inner.slice = None;
                inner.background = None;
            }
            let changed = RegionPatch {
                emin,
                emax,
                bgtype,
                name,
                spectrum_changed: patch.spectrum_changed,
            };
            if changed.is_empty() {
                return changed;
            }
            inner.refresh();
            changed
        };
        self.emit(Event::ChangedRegion(changed.clone()));
        changed
    }

    pub fn set_bounds(&self, emin: f64, emax: f64) -> RegionPatch {
        self.set(RegionPatch {
            emin: Some(emin),
            emax: Some(emax),
            ..Default::default()
        })
    }

    pub fn set_emin(&self, emin: f64) -> RegionPatch {
        self.set(RegionPatch {
            emin: Some(emin),
            ..Default::default()
        })
    }

    pub fn set_emax(&self, emax: f64) -> RegionPatch {
        self.set(RegionPatch {
            emax: Some(emax),
            ..Default::default()
        })
    }

    pub fn set_bgtype(&self, bgtype: BgType) -> RegionPatch {
        self.set(RegionPatch {
            bgtype: Some(bgtype),
            ..Default::default()
        })
    }

    pub fn set_name(&self, name: impl Into<String>) -> RegionPatch {
        self.set(RegionPatch {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    // -- peaks and fitting --

    pub fn peaks(&self) -> Vec<Peak> {
        self.0.borrow().peaks.clone()
    }

    pub fn peak_by_name(&self, name: &str) -> Option<Peak> {
        self.peaks().into_iter().find(|p| p.name() == name)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(XpsError::DetachedRegion(self.sid()))
        }
    }

    /// Add a peak labelled with the next letter of this region's sequence
    /// and register it with the fit model.
    pub fn add_peak(&self, model_name: &str, init: PeakInit) -> Result<Peak> {
        self.ensure_attached()?;
        let energy = self.energy();
        if energy.is_empty() {
            return Err(XpsError::EmptyRegion(self.sid()));
        }
        let signal = self.subtracted_intensity();

        let (peak, subscribers) = {
            let mut inner = self.0.borrow_mut();
            let sid = next_sid();
            inner.model.register(
                sid,
                model_name,
                init,
                &FitData {
                    energy: &energy,
                    signal: &signal,
                },
            )?;
            let name = peak_label(inner.peak_counter);
            inner.peak_counter += 1;
            let peak = Peak::attach(
                sid,
                name,
                model_name.to_string(),
                Rc::downgrade(&self.0),
                inner.spectrum.clone(),
            );
            inner.peaks.push(peak.clone());
            (peak, inner.bus.subscribers())
        };
        for sub in subscribers {
            peak.subscribe(sub);
        }
        self.emit(Event::AddPeak { peak: peak.sid() });
        Ok(peak)
    }

    /// Rebuild a stored peak. Missing parameters are guessed.
    pub fn add_peak_from(&self, raw: &RawPeak) -> Result<Peak> {
        let model_name = raw.model_name.as_deref().unwrap_or(DEFAULT_PEAK_MODEL);
        let init = match (raw.center, raw.fwhm, raw.area) {
            (Some(center), Some(fwhm), Some(area)) => PeakInit::Params { center, fwhm, area },
            _ => PeakInit::Guess,
        };
        let guessed = init == PeakInit::Guess;
        let peak = self.add_peak(model_name, init)?;
        if guessed {
            let given = [
                (PeakParam::Center, raw.center),
                (PeakParam::Fwhm, raw.fwhm),
                (PeakParam::Area, raw.area),
            ];
            for (param, value) in given {
                if let Some(value) = value {
                    peak.set_param(param, value)?;
                }
            }
        }
        if let Some(name) = &raw.name {
            peak.set_name(name.clone());
        }
        Ok(peak)
    }

    /// Remove `peak` and deregister it from the fit model.
    pub fn remove_peak(&self, peak: &Peak) -> bool {
        let subscribers = {
            let mut inner = self.0.borrow_mut();
            let Some(index) = inner.peaks.iter().position(|p| p == peak) else {
                return false;
            };
            let removed = inner.peaks.remove(index);
            inner.model.deregister(removed.sid());
            inner.bus.subscribers()
        };
        for sub in &subscribers {
            peak.unsubscribe(sub);
        }
        peak.detach();
        self.emit(Event::RemovePeak { peak: peak.sid() });
        true
    }

    /// Fit all peaks against the background-subtracted intensity.
    pub fn fit(&self) -> Result<FitReport> {
        self.ensure_attached()?;
        let energy = self.energy();
        let signal = self.subtracted_intensity();
        let report = self.0.borrow_mut().model.fit_region(&FitData {
            energy: &energy,
            signal: &signal,
        })?;
        log::debug!(
            "region {}: fit {} after {} evaluation(s), chi² {:.4e}",
            self.sid(),
            if report.converged { "converged" } else { "stopped" },
            report.evaluations,
            report.chi_square
        );
        self.emit(Event::Fit);
        Ok(report)
    }

    /// Sum of all fitted peaks over the region (without background);
    /// `None` until a fit has succeeded.
    pub fn fit_intensity(&self) -> Option<Vec<f64>> {
        let energy = self.energy();
        self.0.borrow().model.evaluate_region_total(&energy)
    }

    pub(super) fn with_model<R>(&self, f: impl FnOnce(&dyn FitModel) -> R) -> R {
        f(self.0.borrow().model.as_ref())
    }

    pub(super) fn with_model_mut<R>(&self, f: impl FnOnce(&mut dyn FitModel) -> R) -> R {
        f(self.0.borrow_mut().model.as_mut())
    }

    pub(super) fn fit_data(&self) -> (Rc<[f64]>, Vec<f64>) {
        (self.energy(), self.subtracted_intensity())
    }

    // -- notification --

    /// Subscribe to this region and its current and future peaks.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let peaks = {
            let inner = self.0.borrow();
            inner.bus.subscribe(subscriber.clone());
            inner.peaks.clone()
        };
        for peak in peaks {
            peak.subscribe(subscriber.clone());
        }
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        let peaks = {
            let inner = self.0.borrow();
            inner.bus.unsubscribe(subscriber);
            inner.peaks.clone()
        };
        for peak in peaks {
            peak.unsubscribe(subscriber);
        }
    }

    pub fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.0.borrow().bus.is_subscribed(subscriber)
    }

    fn emit(&self, event: Event) {
        let bus = self.0.borrow().bus.clone();
        bus.emit(&event, &Source::Region(self.clone()));
    }

    pub fn to_raw(&self) -> RawRegion {
        let peaks = self.peaks();
        let inner = self.0.borrow();
        let (emin, emax, bgtype, name) = (inner.emin, inner.emax, inner.bgtype, inner.name.clone());
        drop(inner);
        RawRegion {
            emin: Some(emin),
            emax: Some(emax),
            bgtype: Some(bgtype),
            name: Some(name),
            peaks: peaks.iter().map(Peak::to_raw).collect(),
        }
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("Region")
                .field("sid", &inner.sid)
                .field("name", &inner.name)
                .field("emin", &inner.emin)
                .field("emax", &inner.emax)
                .field("bgtype", &inner.bgtype)
                .field("peaks", &inner.peaks.len())
                .finish(),
            Err(_) => f.write_str("Region(<borrowed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::data::model::RawSpectrum;
    use crate::fit::{Constraint, ConstraintArg, ConstraintValue};

    fn scenario_spectrum() -> Spectrum {
        Spectrum::new(RawSpectrum::from_arrays(
            vec![10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
            vec![1.0, 1.0, 1.0, 5.0, 10.0, 10.0, 5.0, 1.0, 1.0, 1.0],
        ))
        .unwrap()
    }

    fn gaussian_spectrum() -> Spectrum {
        let energy: Vec<f64> = (0..201).map(|i| 20.0 - i as f64 * 0.1).collect();
        let intensity = energy
            .iter()
            .map(|e| 2.0 + 50.0 * (-(e - 10.0_f64).powi(2) / 0.5).exp())
            .collect();
        Spectrum::new(RawSpectrum::from_arrays(energy, intensity)).unwrap()
    }

    /// Gaussian on an inelastic step, higher on the high-energy side.
    fn stepped_spectrum() -> Spectrum {
        let energy: Vec<f64> = (0..201).map(|i| 20.0 - i as f64 * 0.1).collect();
        let intensity = energy
            .iter()
            .map(|e| {
                let step = 3.0 / (1.0 + (-(e - 10.0) * 4.0).exp());
                2.0 + step + 50.0 * (-(e - 10.0_f64).powi(2) / 0.5).exp()
            })
            .collect();
        Spectrum::new(RawSpectrum::from_arrays(energy, intensity)).unwrap()
    }

    /// Records every call the region makes on its fit collaborator.
    #[derive(Default)]
    struct Recording {
        calls: Rc<RefCell<Vec<String>>>,
        registered: Vec<Sid>,
        fitted: bool,
    }

    impl FitModel for Recording {
        fn register(&mut self, peak: Sid, model: &str, _: PeakInit, _: &FitData<'_>) -> Result<()> {
            self.calls.borrow_mut().push(format!("register {peak} {model}"));
            self.registered.push(peak);
            self.fitted = false;
            Ok(())
        }
        fn deregister(&mut self, peak: Sid) {
            self.calls.borrow_mut().push(format!("deregister {peak}"));
            self.registered.retain(|p| *p != peak);
            self.fitted = false;
        }
        fn reinit(&mut self, peak: Sid, model: &str, _: &FitData<'_>) -> Result<()> {
            self.calls.borrow_mut().push(format!("reinit {peak} {model}"));
            Ok(())
        }
        fn evaluate(&self, peak: Sid, energy: &[f64]) -> Option<Vec<f64>> {
            (self.fitted && self.registered.contains(&peak)).then(|| vec![1.0; energy.len()])
        }
        fn evaluate_region_total(&self, energy: &[f64]) -> Option<Vec<f64>> {
            (self.fitted && !self.registered.is_empty())
                .then(|| vec![self.registered.len() as f64; energy.len()])
        }
        fn fit_region(&mut self, _: &FitData<'_>) -> Result<FitReport> {
            self.calls.borrow_mut().push("fit".into());
            self.fitted = true;
            Ok(FitReport {
                evaluations: 1,
                chi_square: 0.0,
                converged: true,
            })
        }
        fn set_constraint(&mut self, _: Sid, _: PeakParam, _: Constraint) -> Result<()> {
            Ok(())
        }
        fn get_constraint(&self, _: Sid, _: PeakParam, _: ConstraintArg) -> Option<ConstraintValue> {
            None
        }
        fn param(&self, _: Sid, _: PeakParam) -> Option<f64> {
            None
        }
        fn set_param(&mut self, _: Sid, _: PeakParam, value: f64) -> Result<f64> {
            Ok(value)
        }
    }

    #[test]
    fn linear_background_scenario_is_flat() {
        let s = scenario_spectrum();
        let forward = s.add_region(9.0, 1.0);
        forward.set_bgtype(BgType::Linear);
        let bg = forward.background().unwrap();
        assert_eq!(bg.len(), forward.energy().len());
        assert!(bg.iter().all(|b| (*b - 1.0).abs() < 1e-12));

        let swapped = s.add_region(1.0, 9.0);
        swapped.set_bgtype(BgType::Linear);
        assert_eq!(&*swapped.energy(), &*forward.energy());
        assert_eq!(&*swapped.background().unwrap(), &*bg);
    }

    #[test]
    fn swapped_bounds_give_identical_shirley() {
        let s = gaussian_spectrum();
        let a = s.add_region(14.0, 6.0);
        let b = s.add_region(6.0, 14.0);
        assert_eq!(a.index_range(), b.index_range());
        assert_eq!(&*a.background().unwrap(), &*b.background().unwrap());
        assert_eq!(a.emin(), 14.0, "stored bounds are not reordered");
    }

    #[test]
    fn out_of_range_bounds_clamp() {
        let s = scenario_spectrum();
        let r = s.add_region(100.0, -100.0);
        assert_eq!(r.index_range(), Some((0, 9)));
        assert_eq!(r.energy().len(), 10);
    }

    #[test]
    fn bgtype_change_alone_recomputes_background() {
        let s = stepped_spectrum();
        let r = s.add_region(14.0, 6.0);
        let shirley_bg = r.background().unwrap();
        r.set_bgtype(BgType::None);
        assert!(r.background().is_none());
        r.set_bgtype(BgType::Linear);
        let linear_bg = r.background().unwrap();
        assert_ne!(&*linear_bg, &*shirley_bg);
        assert_eq!(r.background_status(), None);
        r.set_bgtype(BgType::Shirley);
        assert!(r.background_status().is_some());
        assert_eq!(&*r.background().unwrap(), &*shirley_bg);
    }

    #[test]
    fn spectrum_processing_invalidates_background() {
        let s = gaussian_spectrum();
        let r = s.add_region(14.0, 6.0);
        let before = r.background().unwrap();
        s.set_norm(crate::data::model::Normalization::Max);
        let after = r.background().unwrap();
        assert_eq!(before.len(), after.len());
        assert!((after[0] - before[0] / 52.0).abs() < 1e-9);
    }

    #[test]
    fn background_lookup_uses_nearest_sample() {
        let s = scenario_spectrum();
        let r = s.add_region(9.0, 1.0);
        r.set_bgtype(BgType::Linear);
        assert_eq!(r.background_from_energy(4.2), Some(1.0));
        r.set_bgtype(BgType::None);
        assert_eq!(r.background_from_energy(4.2), None);
    }

    #[test]
    fn bounds_changes_emit_once_with_payload() {
        let s = scenario_spectrum();
        let r = s.add_region(9.0, 1.0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        r.subscribe(Subscriber::new(move |ev, _| sink.borrow_mut().push(ev.clone())));
        r.set_bounds(9.0, 3.0);
        r.set_emax(3.0);
        assert_eq!(
            *seen.borrow(),
            vec![Event::ChangedRegion(RegionPatch {
                emax: Some(3.0),
                ..Default::default()
            })]
        );
        assert_eq!(r.energy().len(), 7);
    }

    #[test]
    fn peaks_are_named_by_letters_past_deletions() {
        let s = gaussian_spectrum();
        let r = s.add_region(14.0, 6.0);
        let a = r.add_peak("Gaussian", PeakInit::Guess).unwrap();
        let b = r.add_peak("Gaussian", PeakInit::Guess).unwrap();
        assert_eq!((a.name().as_str(), b.name().as_str()), ("A", "B"));
        r.remove_peak(&b);
        let c = r.add_peak("Gaussian", PeakInit::Guess).unwrap();
        assert_eq!(c.name(), "C");
        assert_eq!(r.peak_by_name("C"), Some(c));
    }

    #[test]
    fn removing_peak_deregisters_it() {
        let s = gaussian_spectrum();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let model = Recording {
            calls: Rc::clone(&calls),
            ..Default::default()
        };
        let r = s.add_region_with(14.0, 6.0, RegionOptions::default(), Box::new(model));
        let peak = r.add_peak("PseudoVoigt", PeakInit::Guess).unwrap();
        assert!(peak.fit_intensity().is_none());
        assert!(r.fit_intensity().is_none());

        r.fit().unwrap();
        assert!(peak.fit_intensity().is_some());
        assert!(r.remove_peak(&peak));
        assert!(peak.fit_intensity().is_none());
        assert!(r.fit_intensity().is_none());
        assert_eq!(
            *calls.borrow(),
            vec![
                format!("register {} PseudoVoigt", peak.sid()),
                "fit".to_string(),
                format!("deregister {}", peak.sid()),
            ]
        );
    }

    #[test]
    fn removing_region_deregisters_its_peaks() {
        let s = gaussian_spectrum();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let model = Recording {
            calls: Rc::clone(&calls),
            ..Default::default()
        };
        let r = s.add_region_with(14.0, 6.0, RegionOptions::default(), Box::new(model));
        let peak = r.add_peak("Gaussian", PeakInit::Guess).unwrap();
        s.remove_region(&r);
        assert!(calls.borrow().contains(&format!("deregister {}", peak.sid())));
        assert!(peak.region().is_none());
        assert_eq!(r.add_peak("Gaussian", PeakInit::Guess), Err(XpsError::DetachedRegion(r.sid())));
    }

    #[test]
    fn fit_recovers_a_single_gaussian() {
        let s = gaussian_spectrum();
        let r = s.add_region(14.0, 6.0);
        let peak = r.add_peak("Gaussian", PeakInit::Guess).unwrap();
        let report = r.fit().unwrap();
        assert!(report.evaluations > 0);
        assert!((peak.center().unwrap() - 10.0).abs() < 0.05);
        let total = r.fit_intensity().unwrap();
        assert_eq!(total.len(), r.energy().len());
    }

    #[test]
    fn nested_emission_terminates() {
        let s = scenario_spectrum();
        let r = s.add_region(9.0, 1.0);
        let depth = Rc::new(Cell::new(0usize));
        let max_depth = Rc::new(Cell::new(0usize));
        let (d, m, region) = (Rc::clone(&depth), Rc::clone(&max_depth), r.clone());
        s.subscribe(Subscriber::new(move |ev, _| {
            d.set(d.get() + 1);
            m.set(m.get().max(d.get()));
            // reacting to a spectrum change by mutating a child re-enters the bus
            if let Event::ChangedSpectrum(_) = ev {
                region.set_bgtype(BgType::Linear);
            }
            d.set(d.get() - 1);
        }));
        s.set_calibration(1.0);
        assert_eq!(max_depth.get(), 2);
        assert_eq!(r.bgtype(), BgType::Linear);
        // second change: the region already is linear, so no nested event
        max_depth.set(0);
        s.set_calibration(2.0);
        assert_eq!(max_depth.get(), 1);
    }

    #[test]
    fn reasserting_a_clamped_parameter_terminates() {
        let s = gaussian_spectrum();
        let r = s.add_region(14.0, 6.0);
        let peak = r
            .add_peak(
                "Gaussian",
                PeakInit::Params {
                    center: 10.0,
                    fwhm: 1.0,
                    area: 10.0,
                },
            )
            .unwrap();
        peak.set_constraint(
            PeakParam::Area,
            Constraint {
                max: Some(20.0),
                ..Default::default()
            },
        )
        .unwrap();

        let emits = Rc::new(Cell::new(0usize));
        let (n, handle) = (Rc::clone(&emits), peak.clone());
        s.subscribe(Subscriber::new(move |ev, _| {
            if let Event::ChangedPeak = ev {
                n.set(n.get() + 1);
                if n.get() < 10 {
                    handle.set_area(100.0).unwrap();
                }
            }
        }));
        peak.set_area(100.0).unwrap();
        assert_eq!(emits.get(), 1);
        assert_eq!(peak.area(), Some(20.0));
        peak.set_area(100.0).unwrap();
        assert_eq!(emits.get(), 1);
    }

    #[test]
    fn smoothness_change_reslices_and_recomputes_background() {
        let s = scenario_spectrum();
        let r = s.add_region(9.0, 4.0);
        r.set_bgtype(BgType::Linear);
        let before_intensity = r.intensity().to_vec();
        let before_bg = r.background().unwrap().to_vec();

        s.set_smoothness(1);
        let (lo, hi) = r.index_range().unwrap();
        assert_eq!(&*r.intensity(), &s.intensity()[lo..=hi]);
        assert_ne!(r.intensity().to_vec(), before_intensity);
        let bg = r.background().unwrap();
        assert_eq!(&*bg, &*linear_background(&r.intensity()));
        assert_ne!(bg.to_vec(), before_bg);
    }

    #[test]
    fn detached_region_keeps_its_last_slice() {
        let s = scenario_spectrum();
        let r = s.add_region(9.0, 2.0);
        let energy = r.energy().to_vec();
        assert!(s.remove_region(&r));
        r.set(RegionPatch {
            spectrum_changed: true,
            ..Default::default()
        });
        assert_eq!(r.energy().to_vec(), energy);
        assert!(!r.intensity().is_empty());
    }

    #[test]
    fn stored_peaks_keep_parameters() {
        let s = gaussian_spectrum();
        let r = s.add_region(14.0, 6.0);
        let raw = RawPeak {
            name: Some("C1s".into()),
            model_name: Some("Lorentzian".into()),
            center: Some(10.0),
            fwhm: Some(1.2),
            area: Some(40.0),
        };
        let peak = r.add_peak_from(&raw).unwrap();
        assert_eq!(peak.name(), "C1s");
        assert_eq!(peak.to_raw(), raw);

        let partial = r
            .add_peak_from(&RawPeak {
                center: Some(9.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(partial.center(), Some(9.5));
        assert_eq!(partial.model_name(), DEFAULT_PEAK_MODEL);
        assert!(partial.fwhm().unwrap() > 0.0);
    }
}
