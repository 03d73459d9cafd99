/// Data layer: the reactive spectrum model and its file boundaries.
///
/// Architecture:
/// ```text
///  .json / .csv                 project .json
///        │                            │
///        ▼                            ▼
///   ┌──────────┐               ┌───────────┐
///   │  loader   │  RawSpectrum  │  project   │  save / load
///   └──────────┘               └───────────┘
///        │                            │
///        ▼                            ▼
///   ┌─────────────────────────────────────┐
///   │ SpectrumContainer                    │  Vec<Spectrum>, altered flag
///   │   Spectrum ─▶ Region ─▶ Peak         │  ChangeBus on every entity
///   └─────────────────────────────────────┘
///        │
///        ▼
///   ┌────────────┐
///   │ processing  │  calibration, normalization, smoothing, backgrounds
///   └────────────┘
/// ```

pub mod container;
pub mod loader;
pub mod model;
pub mod peak;
pub mod processing;
pub mod project;
pub mod region;
pub mod spectrum;
