use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Result, XpsError};
use crate::events::{ChangeBus, Event, Source, Subscriber};
use crate::fit::{Constraint, ConstraintArg, ConstraintValue, FitData, PeakParam};

use super::model::{RawPeak, Sid};
use super::region::{Region, RegionInner};
use super::spectrum::{Spectrum, SpectrumInner};

/// Line shape given to peaks that do not name one.
pub const DEFAULT_PEAK_MODEL: &str = "PseudoVoigt";

pub(crate) struct PeakInner {
    sid: Sid,
    name: String,
    model_name: String,
    region: Weak<RefCell<RegionInner>>,
    spectrum: Weak<RefCell<SpectrumInner>>,
    bus: ChangeBus,
}

/// A component of a region's fit. Parameters live in the region's fit
/// model, keyed by this peak's id; the handle only names them.
#[derive(Clone)]
pub struct Peak(Rc<RefCell<PeakInner>>);

impl Peak {
    pub(super) fn attach(
        sid: Sid,
        name: String,
        model_name: String,
        region: Weak<RefCell<RegionInner>>,
        spectrum: Weak<RefCell<SpectrumInner>>,
    ) -> Self {
        Peak(Rc::new(RefCell::new(PeakInner {
            sid,
            name,
            model_name,
            region,
            spectrum,
            bus: ChangeBus::new(),
        })))
    }

    pub(super) fn detach(&self) {
        let mut inner = self.0.borrow_mut();
        inner.region = Weak::new();
        inner.spectrum = Weak::new();
    }

    pub fn sid(&self) -> Sid {
        self.0.borrow().sid
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn model_name(&self) -> String {
        self.0.borrow().model_name.clone()
    }

    pub fn region(&self) -> Option<Region> {
        self.0.borrow().region.upgrade().map(Region)
    }

    pub fn spectrum(&self) -> Option<Spectrum> {
        self.0.borrow().spectrum.upgrade().map(Spectrum)
    }

    fn attached_region(&self) -> Result<Region> {
        self.region().ok_or(XpsError::UnknownPeak(self.sid()))
    }

    // -- parameters --

    pub fn param(&self, param: PeakParam) -> Option<f64> {
        let sid = self.sid();
        self.region()?.with_model(|m| m.param(sid, param))
    }

    pub fn center(&self) -> Option<f64> {
        self.param(PeakParam::Center)
    }

    pub fn fwhm(&self) -> Option<f64> {
        self.param(PeakParam::Fwhm)
    }

    pub fn area(&self) -> Option<f64> {
        self.param(PeakParam::Area)
    }

    /// Set a parameter through the fit model. `changed_peak` is emitted only
    /// if the stored value moved, which the model may clamp to the bounds.
    pub fn set_param(&self, param: PeakParam, value: f64) -> Result<()> {
        let sid = self.sid();
        let region = self.attached_region()?;
        let before = region.with_model(|m| m.param(sid, param));
        let stored = region.with_model_mut(|m| m.set_param(sid, param, value))?;
        if before == Some(stored) {
            return Ok(());
        }
        self.emit(Event::ChangedPeak);
        Ok(())
    }

    pub fn set_center(&self, value: f64) -> Result<()> {
        self.set_param(PeakParam::Center, value)
    }

    pub fn set_fwhm(&self, value: f64) -> Result<()> {
        self.set_param(PeakParam::Fwhm, value)
    }

    pub fn set_area(&self, value: f64) -> Result<()> {
        self.set_param(PeakParam::Area, value)
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut inner = self.0.borrow_mut();
            if inner.name == name {
                return;
            }
            inner.name = name;
        }
        self.emit(Event::ChangedPeak);
    }

    /// Switch the line shape; the fit model re-estimates the parameters.
    pub fn set_model_name(&self, model_name: &str) -> Result<()> {
        if self.0.borrow().model_name == model_name {
            return Ok(());
        }
        let sid = self.sid();
        let region = self.attached_region()?;
        let (energy, signal) = region.fit_data();
        region.with_model_mut(|m| {
            m.reinit(
                sid,
                model_name,
                &FitData {
                    energy: &energy,
                    signal: &signal,
                },
            )
        })?;
        self.0.borrow_mut().model_name = model_name.to_string();
        self.emit(Event::ChangedPeak);
        Ok(())
    }

    pub fn set_constraint(&self, param: PeakParam, constraint: Constraint) -> Result<()> {
        let sid = self.sid();
        self.attached_region()?
            .with_model_mut(|m| m.set_constraint(sid, param, constraint))?;
        self.emit(Event::ChangedPeak);
        Ok(())
    }

    pub fn get_constraint(&self, param: PeakParam, arg: ConstraintArg) -> Option<ConstraintValue> {
        let sid = self.sid();
        self.region()?
            .with_model(|m| m.get_constraint(sid, param, arg))
    }

    /// This peak's fitted curve over the region; `None` before a fit.
    pub fn fit_intensity(&self) -> Option<Vec<f64>> {
        let sid = self.sid();
        let region = self.region()?;
        let energy = region.energy();
        region.with_model(|m| m.evaluate(sid, &energy))
    }

    // -- notification --

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.0.borrow().bus.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        self.0.borrow().bus.unsubscribe(subscriber);
    }

    pub fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.0.borrow().bus.is_subscribed(subscriber)
    }

    fn emit(&self, event: Event) {
        let bus = self.0.borrow().bus.clone();
        bus.emit(&event, &Source::Peak(self.clone()));
    }

    pub fn to_raw(&self) -> RawPeak {
        RawPeak {
            name: Some(self.name()),
            model_name: Some(self.model_name()),
            center: self.center(),
            fwhm: self.fwhm(),
            area: self.area(),
        }
    }
}

impl PartialEq for Peak {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Peak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("Peak")
                .field("sid", &inner.sid)
                .field("name", &inner.name)
                .field("model_name", &inner.model_name)
                .finish(),
            Err(_) => f.write_str("Peak(<borrowed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::data::model::RawSpectrum;
    use crate::fit::PeakInit;

    fn region_with_peak() -> (Spectrum, Region, Peak) {
        let energy: Vec<f64> = (0..121).map(|i| 290.0 - i as f64 * 0.05).collect();
        let intensity = energy
            .iter()
            .map(|e| 5.0 + 40.0 * (-(e - 287.0_f64).powi(2) / 0.4).exp())
            .collect();
        let s = Spectrum::new(RawSpectrum::from_arrays(energy, intensity)).unwrap();
        let r = s.add_region(289.5, 284.5);
        let p = r
            .add_peak(
                "Gaussian",
                PeakInit::Params {
                    center: 287.0,
                    fwhm: 1.0,
                    area: 30.0,
                },
            )
            .unwrap();
        (s, r, p)
    }

    #[test]
    fn links_and_defaults() {
        let (s, r, p) = region_with_peak();
        assert_eq!(p.name(), "A");
        assert_eq!(p.region(), Some(r.clone()));
        assert_eq!(p.spectrum(), Some(s));
        assert_eq!(p.center(), Some(287.0));
        assert_eq!(r.peaks(), vec![p]);
    }

    #[test]
    fn setters_emit_only_on_change() {
        let (s, _r, p) = region_with_peak();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        s.subscribe(Subscriber::new(move |ev, src| {
            sink.borrow_mut().push((ev.kind(), src.sid()))
        }));
        p.set_area(30.0).unwrap();
        p.set_area(25.0).unwrap();
        p.set_name("C1s");
        p.set_name("C1s");
        assert_eq!(
            *seen.borrow(),
            vec![
                ("changed_peak", Some(p.sid())),
                ("changed_peak", Some(p.sid()))
            ]
        );
        assert_eq!(p.area(), Some(25.0));
    }

    #[test]
    fn model_switch_reestimates() {
        let (_s, _r, p) = region_with_peak();
        p.set_center(286.0).unwrap();
        p.set_model_name("Lorentzian").unwrap();
        assert_eq!(p.model_name(), "Lorentzian");
        assert!((p.center().unwrap() - 287.0).abs() < 0.06);
        assert!(p.set_model_name("Doniach").is_err());
        assert_eq!(p.model_name(), "Lorentzian");
    }

    #[test]
    fn constraints_round_trip_through_the_region_model() {
        let (_s, _r, p) = region_with_peak();
        p.set_constraint(
            PeakParam::Area,
            Constraint {
                min: Some(10.0),
                max: Some(20.0),
                expr: None,
            },
        )
        .unwrap();
        assert_eq!(p.area(), Some(20.0));
        assert_eq!(
            p.get_constraint(PeakParam::Area, ConstraintArg::Min),
            Some(ConstraintValue::Bound(10.0))
        );
        assert_eq!(p.get_constraint(PeakParam::Area, ConstraintArg::Expr), None);
    }

    #[test]
    fn fit_intensity_appears_after_fit() {
        let (_s, r, p) = region_with_peak();
        assert!(p.fit_intensity().is_none());
        r.fit().unwrap();
        let curve = p.fit_intensity().unwrap();
        assert_eq!(curve.len(), r.energy().len());
        assert!((p.center().unwrap() - 287.0).abs() < 0.01);
    }

    #[test]
    fn detached_peak_reports_nothing() {
        let (_s, r, p) = region_with_peak();
        r.remove_peak(&p);
        assert!(p.region().is_none());
        assert!(p.center().is_none());
        assert_eq!(p.set_area(1.0), Err(XpsError::UnknownPeak(p.sid())));
    }
}
