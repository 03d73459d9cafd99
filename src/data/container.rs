use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Result, XpsError};
use crate::events::{ChangeBus, Event, Source, Subscriber};

use super::model::Sid;
use super::spectrum::Spectrum;

/// Ordered collection of spectra with a dirty flag for persistence.
///
/// Subscribing to the container reaches every contained spectrum, region and
/// peak, including ones added later.
pub struct SpectrumContainer {
    spectra: Vec<Spectrum>,
    bus: ChangeBus,
    altered: Rc<Cell<bool>>,
    /// Marks the container altered on any data event from below.
    tracker: Subscriber,
}

impl SpectrumContainer {
    pub fn new() -> Self {
        let altered = Rc::new(Cell::new(false));
        let flag = Rc::clone(&altered);
        let tracker = Subscriber::new(move |event, _| {
            if event.alters_data() {
                flag.set(true);
            }
        });
        let bus = ChangeBus::new();
        bus.subscribe(tracker.clone());
        Self {
            spectra: Vec::new(),
            bus,
            altered,
            tracker,
        }
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Spectrum> {
        self.spectra.get(index)
    }

    pub fn get_by_sid(&self, sid: Sid) -> Option<&Spectrum> {
        self.spectra.iter().find(|s| s.sid() == sid)
    }

    pub fn get_index_by_sid(&self, sid: Sid) -> Option<usize> {
        self.spectra.iter().position(|s| s.sid() == sid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spectrum> {
        self.spectra.iter()
    }

    pub fn spectra(&self) -> &[Spectrum] {
        &self.spectra
    }

    /// Append `spectrum` and hook all container subscribers into it.
    /// Returns its index.
    pub fn append(&mut self, spectrum: Spectrum) -> Result<usize> {
        let sid = spectrum.sid();
        if self.get_by_sid(sid).is_some() {
            return Err(XpsError::DuplicateSpectrum(sid));
        }
        for sub in self.bus.subscribers() {
            spectrum.subscribe(sub);
        }
        self.spectra.push(spectrum);
        let index = self.spectra.len() - 1;
        log::debug!("container: appended spectrum {sid} at {index}");
        self.emit(Event::AddSpectrum { index });
        Ok(index)
    }

    /// Remove the spectrum at `index`, unhook it and drop its regions.
    pub fn remove(&mut self, index: usize) -> Option<Spectrum> {
        if index >= self.spectra.len() {
            return None;
        }
        let spectrum = self.spectra.remove(index);
        for sub in self.bus.subscribers() {
            spectrum.unsubscribe(&sub);
        }
        spectrum.clear_regions();
        self.emit(Event::RemoveSpectrum { index });
        Some(spectrum)
    }

    pub fn remove_by_sid(&mut self, sid: Sid) -> Option<Spectrum> {
        let index = self.get_index_by_sid(sid)?;
        self.remove(index)
    }

    pub fn clear(&mut self) {
        let subscribers = self.bus.subscribers();
        for spectrum in self.spectra.drain(..) {
            for sub in &subscribers {
                spectrum.unsubscribe(sub);
            }
            spectrum.clear_regions();
        }
        self.emit(Event::ClearContainer);
    }

    // -- dirty flag --

    /// Whether anything changed since the last [`clear_altered`](Self::clear_altered).
    pub fn altered(&self) -> bool {
        self.altered.get()
    }

    pub fn set_altered(&self, altered: bool) {
        self.altered.set(altered);
    }

    /// Called by persistence after a successful save or load.
    pub fn clear_altered(&self) {
        self.altered.set(false);
    }

    // -- notification --

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.bus.subscribe(subscriber.clone());
        for spectrum in &self.spectra {
            spectrum.subscribe(subscriber.clone());
        }
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        if *subscriber == self.tracker {
            return;
        }
        self.bus.unsubscribe(subscriber);
        for spectrum in &self.spectra {
            spectrum.unsubscribe(subscriber);
        }
    }

    /// Show only the listed spectra, with `flags` as their visibility.
    pub fn show_only(&self, sids: &[Sid], flags: &str) {
        for spectrum in &self.spectra {
            let flags = if sids.contains(&spectrum.sid()) {
                flags
            } else {
                ""
            };
            spectrum.set_visibility(flags);
        }
    }

    pub fn request_plot(&self) {
        self.emit(Event::Plot);
    }

    fn emit(&self, event: Event) {
        self.bus.emit(&event, &Source::Container);
    }
}

impl Default for SpectrumContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpectrumContainer {
    fn drop(&mut self) {
        // spectra may outlive the container through other handles
        for spectrum in &self.spectra {
            spectrum.unsubscribe(&self.tracker);
        }
    }
}

impl fmt::Debug for SpectrumContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumContainer")
            .field("spectra", &self.spectra)
            .field("altered", &self.altered.get())
            .finish()
    }
}
