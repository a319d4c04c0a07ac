use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::analysis::metrics::Discrepancy;
use crate::core::error::Result;
use crate::core::spatial;
use crate::solvers::active::{EnergySource, RunReport};

#[derive(Serialize)]
struct ConvergenceRow {
    iteration: usize,
    generation: Option<u64>,
    optimizer_state: String,
    optimizer_steps: usize,
    max_force: f64,
    energy_rmse: Option<f64>,
    energy_max: Option<f64>,
    force_rmse: Option<f64>,
    force_max: Option<f64>,
    validated: usize,
    training_set_size: usize,
    reference_evaluations: usize,
    fit_failed: bool,
    timestamp: String,
}

#[derive(Serialize)]
struct ProfileRow {
    image: usize,
    reaction_coordinate: f64,
    energy: f64,
    relative_energy: f64,
    source: EnergySource,
    min_pair_distance: Option<f64>,
}

/// Paths of the files written by [`write_all`].
#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub convergence: PathBuf,
    pub profile: PathBuf,
    pub summary: PathBuf,
    pub path: PathBuf,
}

/// One CSV row per outer iteration.
pub fn write_convergence_csv(report: &RunReport, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    for e in report.record.entries() {
        writer.serialize(ConvergenceRow {
            iteration: e.iteration,
            generation: e.generation,
            optimizer_state: format!("{:?}", e.optimizer_state),
            optimizer_steps: e.optimizer_steps,
            max_force: e.max_force,
            energy_rmse: e.discrepancy.map(|d| d.energy_rmse),
            energy_max: e.discrepancy.map(|d| d.energy_max),
            force_rmse: e.discrepancy.map(|d| d.force_rmse),
            force_max: e.discrepancy.map(|d| d.force_max),
            validated: e.validated_images.len(),
            training_set_size: e.training_set_size,
            reference_evaluations: e.reference_evaluations,
            fit_failed: e.fit_failed,
            timestamp: e.timestamp.to_rfc3339(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Energy profile along the reported path, relative to the initial state.
pub fn write_profile_csv(report: &RunReport, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    let coordinates = report.path.reaction_coordinates();
    let e0 = report.energies.first().copied().unwrap_or(0.0);

    for (i, image) in report.path.images().iter().enumerate() {
        writer.serialize(ProfileRow {
            image: i,
            reaction_coordinate: coordinates[i],
            energy: report.energies[i],
            relative_energy: report.energies[i] - e0,
            source: report.energy_sources[i],
            min_pair_distance: spatial::min_pair_distance(image),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct Summary<'a> {
    run_id: String,
    status: String,
    barrier: Option<f64>,
    saddle_image: Option<usize>,
    optimizer_state: String,
    generation: Option<u64>,
    iterations: usize,
    training_set_size: usize,
    reference_evaluations: usize,
    elapsed_secs: f64,
    discrepancy: &'a Option<Discrepancy>,
}

pub fn write_summary_json(report: &RunReport, path: &Path) -> Result<()> {
    let summary = Summary {
        run_id: report.run_id.to_string(),
        status: format!("{:?}", report.status),
        barrier: report.barrier,
        saddle_image: report.saddle_image(),
        optimizer_state: format!("{:?}", report.optimizer_state),
        generation: report.generation,
        iterations: report.record.len(),
        training_set_size: report.training_set_size,
        reference_evaluations: report.reference_evaluations,
        elapsed_secs: report.elapsed_secs,
        discrepancy: &report.discrepancy,
    };
    fs::write(path, serde_json::to_string_pretty(&summary)?)?;
    Ok(())
}

/// Writes the convergence log, energy profile, summary and final path into `dir`.
pub fn write_all(report: &RunReport, dir: &Path) -> Result<ReportFiles> {
    fs::create_dir_all(dir)?;
    let files = ReportFiles {
        convergence: dir.join("convergence.csv"),
        profile: dir.join("profile.csv"),
        summary: dir.join("summary.json"),
        path: dir.join("path.json"),
    };

    write_convergence_csv(report, &files.convergence)?;
    write_profile_csv(report, &files.profile)?;
    write_summary_json(report, &files.summary)?;
    fs::write(&files.path, serde_json::to_string_pretty(&report.path)?)?;

    info!("Reports written to {}", dir.display());
    Ok(files)
}
