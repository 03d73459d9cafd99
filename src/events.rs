//! Synchronous change notification shared by every entity of the model.
//!
//! Each entity owns a [`ChangeBus`]. Subscribing to a composite entity
//! (container, spectrum, region) attaches the same [`Subscriber`] to every
//! current child bus, and composites copy their subscribers onto children
//! created later. Delivery is therefore exactly-once per event and per
//! subscriber, in subscription order, with the emitting entity as [`Source`].
//!
//! Emission never holds a borrow of the emitting entity: the subscriber list
//! is snapshotted first, so callbacks may read or mutate the model (and
//! subscribe/unsubscribe) without panicking. The model itself only nests
//! emissions along Spectrum → Region → Peak; any further nesting comes from
//! callbacks that mutate, and setters that do not change a value emit
//! nothing, which ends such chains.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::data::model::{RegionPatch, Sid, SpectrumPatch};
use crate::data::peak::Peak;
use crate::data::region::Region;
use crate::data::spectrum::Spectrum;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened. Payloads describe only what actually changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Spectrum attributes changed; the patch holds the new values.
    ChangedSpectrum(SpectrumPatch),
    /// Region attributes changed, or its spectrum's processed arrays did.
    ChangedRegion(RegionPatch),
    ChangedPeak,
    AddRegion { region: Sid },
    RemoveRegion { region: Sid },
    AddPeak { peak: Sid },
    RemovePeak { peak: Sid },
    /// A region fit finished.
    Fit,
    AddSpectrum { index: usize },
    RemoveSpectrum { index: usize },
    ClearContainer,
    /// Re-render hint, no data changed.
    Plot,
}

impl Event {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ChangedSpectrum(_) => "changed_spectrum",
            Event::ChangedRegion(_) => "changed_region",
            Event::ChangedPeak => "changed_peak",
            Event::AddRegion { .. } => "add_region",
            Event::RemoveRegion { .. } => "remove_region",
            Event::AddPeak { .. } => "add_peak",
            Event::RemovePeak { .. } => "remove_peak",
            Event::Fit => "fit",
            Event::AddSpectrum { .. } => "add_spectrum",
            Event::RemoveSpectrum { .. } => "remove_spectrum",
            Event::ClearContainer => "clear_container",
            Event::Plot => "plot",
        }
    }

    /// Whether this event reflects a change of stored data.
    pub fn alters_data(&self) -> bool {
        !matches!(self, Event::Plot)
    }
}

/// The entity that emitted an event.
#[derive(Debug, Clone)]
pub enum Source {
    Container,
    Spectrum(Spectrum),
    Region(Region),
    Peak(Peak),
}

impl Source {
    /// Identity of the emitter; `None` for the container.
    pub fn sid(&self) -> Option<Sid> {
        match self {
            Source::Container => None,
            Source::Spectrum(s) => Some(s.sid()),
            Source::Region(r) => Some(r.sid()),
            Source::Peak(p) => Some(p.sid()),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A callback registered on one or more buses.
///
/// Clones share identity, which is what `unsubscribe` compares.
#[derive(Clone)]
pub struct Subscriber(Rc<dyn Fn(&Event, &Source)>);

impl Subscriber {
    pub fn new(callback: impl Fn(&Event, &Source) + 'static) -> Self {
        Self(Rc::new(callback))
    }

    pub fn notify(&self, event: &Event, source: &Source) {
        (self.0)(event, source);
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Rc::as_ptr(&self.0) as *const u8 == Rc::as_ptr(&other.0) as *const u8
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber({:p})", Rc::as_ptr(&self.0) as *const u8)
    }
}

// ---------------------------------------------------------------------------
// ChangeBus
// ---------------------------------------------------------------------------

/// Ordered subscriber list of a single entity.
#[derive(Clone, Default)]
pub struct ChangeBus {
    subscribers: Rc<RefCell<Vec<Subscriber>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber. Returns `false` if it was already registered.
    pub fn subscribe(&self, subscriber: Subscriber) -> bool {
        let mut subs = self.subscribers.borrow_mut();
        if subs.contains(&subscriber) {
            return false;
        }
        subs.push(subscriber);
        true
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        let mut subs = self.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|s| s != subscriber);
        subs.len() != before
    }

    /// Snapshot of the current subscribers, in subscription order.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.borrow().clone()
    }

    pub fn is_subscribed(&self, subscriber: &Subscriber) -> bool {
        self.subscribers.borrow().contains(subscriber)
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Call every subscriber synchronously, in order.
    pub fn emit(&self, event: &Event, source: &Source) {
        let subs = self.subscribers();
        log::trace!("emit {} to {} subscriber(s)", event.kind(), subs.len());
        for sub in &subs {
            sub.notify(event, source);
        }
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("subscribers", &self.len())
            .finish()
    }
}
