use std::path::PathBuf;

use anyhow::{Context, Result};

use rusty_xps::data::project;
use rusty_xps::{Session, Settings};

fn main() -> Result<()> {
    env_logger::init();

    let config = Settings::config_path();
    let settings = Settings::load_or_default(&config)
        .with_context(|| format!("loading settings from {}", config.display()))?;

    let mut files: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        files.extend(settings.project_file.clone());
    }
    if files.is_empty() {
        eprintln!("usage: rusty-xps [PROJECT.json | DATA.json | DATA.csv]...");
        return Ok(());
    }

    let mut session = Session::new(settings);
    for path in &files {
        if project::is_project_file(path)? && session.container.is_empty() {
            session.open_project(path)?;
        } else {
            session.import_file(path)?;
        }
        if let Some(msg) = &session.status_message {
            log::info!("{msg}");
        }
    }

    for spectrum in session.container.iter() {
        let energy = spectrum.energy();
        println!(
            "{:>4}  {:<24} {:>6} samples  {:>9.3} .. {:<9.3} eV  {} region(s)",
            spectrum.sid(),
            spectrum.name(),
            spectrum.len(),
            energy.first().copied().unwrap_or_default(),
            energy.last().copied().unwrap_or_default(),
            spectrum.region_count()
        );
        for region in spectrum.regions() {
            let status = region
                .background_status()
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "      {:<20} {:>9.3} .. {:<9.3} {:<8} {:<14} {} peak(s)",
                region.name(),
                region.emin(),
                region.emax(),
                region.bgtype().as_str(),
                status,
                region.peaks().len()
            );
        }
    }
    Ok(())
}
