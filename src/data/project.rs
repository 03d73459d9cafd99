use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::container::SpectrumContainer;
use super::model::RawSpectrum;
use super::spectrum::Spectrum;

/// Current project file layout.
pub const PROJECT_VERSION: u32 = 1;

/// On-disk project: every spectrum with its regions and peaks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub version: u32,
    pub spectra: Vec<RawSpectrum>,
}

impl ProjectFile {
    pub fn from_container(container: &SpectrumContainer) -> Self {
        Self {
            version: PROJECT_VERSION,
            spectra: container.iter().map(Spectrum::to_raw).collect(),
        }
    }
}

/// Write `container` as pretty JSON and clear its altered flag.
pub fn save(container: &SpectrumContainer, path: &Path) -> Result<()> {
    let project = ProjectFile::from_container(container);
    let text = serde_json::to_string_pretty(&project).context("serializing project")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    container.clear_altered();
    log::info!("saved {} spectra to {}", project.spectra.len(), path.display());
    Ok(())
}

/// Whether `path` holds a project rather than importable data: a JSON
/// object with a `version` key. Malformed JSON is an error, not a "no".
pub fn is_project_file(path: &Path) -> Result<bool> {
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(false);
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(value.get("version").is_some())
}

/// Read a project file without building any entities.
pub fn load(path: &Path) -> Result<ProjectFile> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let project: ProjectFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing project {}", path.display()))?;
    if project.version != PROJECT_VERSION {
        bail!(
            "{}: unsupported project version {} (expected {PROJECT_VERSION})",
            path.display(),
            project.version
        );
    }
    Ok(project)
}

/// Replace the contents of `container` with the project at `path`.
///
/// The container is only touched once the whole file has been turned into
/// spectra.
pub fn load_into(container: &mut SpectrumContainer, path: &Path) -> Result<()> {
    let project = load(path)?;
    let spectra = project
        .spectra
        .into_iter()
        .enumerate()
        .map(|(i, raw)| Spectrum::new(raw).with_context(|| format!("spectrum {i}")))
        .collect::<Result<Vec<_>>>()?;

    container.clear();
    for spectrum in spectra {
        container.append(spectrum)?;
    }
    container.clear_altered();
    log::info!("loaded {} spectra from {}", container.len(), path.display());
    Ok(())
}
