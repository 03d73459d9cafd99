use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::data::container::SpectrumContainer;
use crate::data::loader;
use crate::data::model::Sid;
use crate::data::peak::Peak;
use crate::data::project;
use crate::data::region::Region;
use crate::data::spectrum::Spectrum;
use crate::fit::{LineShapeModel, PeakInit};
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Everything an application front end works on, independent of rendering.
pub struct Session {
    /// All open spectra.
    pub container: SpectrumContainer,

    pub settings: Settings,

    /// Where `save` writes to (None until saved or opened).
    pub project_path: Option<PathBuf>,

    /// Last status / error message for the user.
    pub status_message: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Session {
    pub fn new(settings: Settings) -> Self {
        Self {
            container: SpectrumContainer::new(),
            settings,
            project_path: None,
            status_message: None,
        }
    }

    /// Whether there are changes a save would keep.
    pub fn needs_save(&self) -> bool {
        self.container.altered()
    }

    /// Drop every spectrum and forget the project path.
    pub fn new_project(&mut self) {
        self.container.clear();
        self.container.clear_altered();
        self.project_path = None;
        self.status_message = None;
    }

    pub fn open_project(&mut self, path: &Path) -> Result<()> {
        project::load_into(&mut self.container, path)?;
        self.project_path = Some(path.to_path_buf());
        self.status_message = Some(format!("Opened {}", path.display()));
        Ok(())
    }

    /// Save to the current project path. Returns `false` if there is none.
    pub fn save(&mut self) -> Result<bool> {
        let Some(path) = self.project_path.clone() else {
            return Ok(false);
        };
        project::save(&self.container, &path)?;
        self.status_message = Some(format!("Saved {}", path.display()));
        Ok(true)
    }

    pub fn save_as(&mut self, path: &Path) -> Result<()> {
        project::save(&self.container, path)?;
        self.project_path = Some(path.to_path_buf());
        self.status_message = Some(format!("Saved {}", path.display()));
        Ok(())
    }

    /// Import a data file and append its spectra. Returns their indices.
    pub fn import_file(&mut self, path: &Path) -> Result<Vec<usize>> {
        let raws = loader::load_file(path)?;
        let spectra = raws
            .into_iter()
            .enumerate()
            .map(|(i, mut raw)| {
                if raw.visibility.is_none() {
                    raw.visibility = Some(self.settings.default_visibility.clone());
                }
                Spectrum::new(raw)
                    .with_context(|| format!("{}: record {i}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut indices = Vec::with_capacity(spectra.len());
        for spectrum in spectra {
            indices.push(self.container.append(spectrum)?);
        }
        self.status_message = Some(format!(
            "Imported {} spectra from {}",
            indices.len(),
            path.display()
        ));
        Ok(indices)
    }

    /// Remove the listed spectra; unknown ids are ignored.
    pub fn remove_spectra(&mut self, sids: &[Sid]) -> usize {
        sids.iter()
            .filter(|sid| self.container.remove_by_sid(**sid).is_some())
            .count()
    }

    fn spectrum(&self, sid: Sid) -> Result<&Spectrum> {
        self.container
            .get_by_sid(sid)
            .with_context(|| format!("no spectrum with id {sid}"))
    }

    /// Add a region with the configured background defaults.
    pub fn add_region(&mut self, sid: Sid, emin: f64, emax: f64) -> Result<Region> {
        let options = self.settings.region_options();
        let spectrum = self.spectrum(sid)?;
        Ok(spectrum.add_region_with(emin, emax, options, Box::new(LineShapeModel::new())))
    }

    /// Add a guessed peak of the configured line shape.
    pub fn add_peak(&mut self, region: &Region) -> Result<Peak> {
        let peak = region.add_peak(&self.settings.default_peak_model, PeakInit::Guess)?;
        Ok(peak)
    }

    /// Shift each listed spectrum so its maximum inside `span` lands on
    /// `target`. Spectra without samples in the span are left alone; an
    /// unknown id fails before anything is changed.
    pub fn calibrate(&mut self, sids: &[Sid], span: (f64, f64), target: f64) -> Result<usize> {
        let spectra = sids
            .iter()
            .map(|&sid| self.spectrum(sid).cloned())
            .collect::<Result<Vec<_>>>()?;
        let mut calibrated = 0;
        for spectrum in spectra {
            match spectrum.calibration_for(span, target) {
                Some(calibration) => {
                    spectrum.set_calibration(calibration);
                    calibrated += 1;
                }
                None => log::warn!(
                    "spectrum {}: no samples between {} and {}, not calibrated",
                    spectrum.sid(),
                    span.0,
                    span.1
                ),
            }
        }
        self.status_message = Some(format!("Calibrated {calibrated} spectra"));
        Ok(calibrated)
    }
}
