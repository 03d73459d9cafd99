//! Reactive data model for X-ray photoelectron spectra.
//!
//! Spectra own regions, regions own peaks, and every entity notifies its
//! subscribers synchronously through a [`events::ChangeBus`] whenever it
//! changes. Derived arrays (calibrated energy, processed intensity, region
//! slices and backgrounds) are recomputed before the corresponding event is
//! emitted, so observers never see stale data.

pub mod data;
pub mod error;
pub mod events;
pub mod fit;
pub mod session;
pub mod settings;

pub use data::container::SpectrumContainer;
pub use data::model::{BgType, Normalization, RawPeak, RawRegion, RawSpectrum, Sid};
pub use data::peak::Peak;
pub use data::processing::{ShirleyParams, ShirleyStatus};
pub use data::region::{Region, RegionOptions};
pub use data::spectrum::Spectrum;
pub use error::{Result, XpsError};
pub use events::{ChangeBus, Event, Source, Subscriber};
pub use fit::{FitModel, LineShape, LineShapeModel, PeakInit, PeakParam};
pub use session::Session;
pub use settings::Settings;
