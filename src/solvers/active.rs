use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::metrics::Discrepancy;
use crate::core::dataset::TrainingSet;
use crate::core::domain::{Configuration, Sample};
use crate::core::error::{ConfigurationError, Result, SurrogateError};
use crate::core::params::Params;
use crate::core::path::PathRepresentation;
use crate::engine::evaluator::{evaluate_batch, ReferenceEvaluator};
use crate::engine::surface::SurrogateSurface;
use crate::engine::surrogate::SurrogateModel;
use crate::solvers::neb::{profile_energies, ElasticBand, OptimizerState, Relaxation};
use crate::solvers::policy::{self, PolicyState};
use crate::solvers::SolverEvent;

/// Controller state machine: `Seeding → (Optimizing → Validating)* → Accepted | Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Seeding,
    Optimizing,
    Validating,
    Accepted,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus {
    /// The surrogate agrees with the reference on the optimised path.
    Accepted,
    /// Outer-iteration budget consumed without acceptance. Not an error.
    Exhausted,
}

/// Where a reported image energy comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergySource {
    Reference,
    Surrogate,
}

/// One outer iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceEntry {
    pub iteration: usize,
    /// Surrogate generation the path was optimised under.
    pub generation: Option<u64>,
    pub optimizer_state: OptimizerState,
    pub optimizer_steps: usize,
    /// Largest projected per-atom force on the returned path.
    pub max_force: f64,
    /// `None` when the optimizer diverged and nothing was validated.
    pub discrepancy: Option<Discrepancy>,
    pub validated_images: Vec<usize>,
    pub training_set_size: usize,
    pub reference_evaluations: usize,
    /// The retrain at the end of this iteration diverged; the previous generation was kept.
    pub fit_failed: bool,
    pub timestamp: DateTime<Utc>,
}

impl ConvergenceEntry {
    /// Largest energy or force discrepancy, if validated.
    pub fn max_discrepancy(&self) -> Option<f64> {
        self.discrepancy.map(|d| d.worst())
    }
}

/// Append-only per-iteration log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    entries: Vec<ConvergenceEntry>,
}

impl ConvergenceRecord {
    pub fn push(&mut self, entry: ConvergenceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ConvergenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ConvergenceEntry> {
        self.entries.last()
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: TerminalStatus,
    /// Accepted: the validated path. Exhausted: the path with the smallest discrepancy.
    pub path: PathRepresentation,
    pub energies: Vec<f64>,
    pub energy_sources: Vec<EnergySource>,
    /// Highest image energy above the initial state.
    pub barrier: Option<f64>,
    /// Discrepancy belonging to `path`.
    pub discrepancy: Option<Discrepancy>,
    pub optimizer_state: OptimizerState,
    pub generation: Option<u64>,
    pub record: ConvergenceRecord,
    pub training_set_size: usize,
    pub reference_evaluations: usize,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn is_accepted(&self) -> bool {
        self.status == TerminalStatus::Accepted
    }

    /// Index of the highest-energy image.
    pub fn saddle_image(&self) -> Option<usize> {
        (0..self.energies.len()).max_by(|&a, &b| self.energies[a].total_cmp(&self.energies[b]))
    }
}

/// The best validated outcome seen so far.
struct Candidate {
    ratio: f64,
    discrepancy: Discrepancy,
    relaxation: Relaxation,
}

/// Couples elastic-band relaxation under a surrogate to reference validation and retraining.
///
/// Owns the training set and the surrogate for the duration of a run; parallel reference
/// evaluations are merged back into the set on the controller thread only.
pub struct ActiveLearningController {
    reference: Arc<dyn ReferenceEvaluator>,
    surrogate: Box<dyn SurrogateModel>,
    training: TrainingSet,
    params: Params,
    events: Option<Sender<SolverEvent>>,
    run_id: Uuid,
    reference_evaluations: usize,
}

impl ActiveLearningController {
    pub fn new(
        reference: Arc<dyn ReferenceEvaluator>,
        surrogate: Box<dyn SurrogateModel>,
        params: Params,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            reference,
            surrogate,
            training: TrainingSet::new(params.dataset.min_distance),
            params,
            events: None,
            run_id: Uuid::new_v4(),
            reference_evaluations: 0,
        })
    }

    /// Seeds the training set with samples from an earlier run.
    /// Together with an already fitted surrogate this skips `Seeding`.
    pub fn with_prior_samples(mut self, samples: impl IntoIterator<Item = Sample>) -> Self {
        let (inserted, refreshed) = self.training.extend(samples);
        info!("Resumed {} prior samples ({} merged as near-duplicates)", inserted, refreshed);
        self
    }

    pub fn with_events(mut self, tx: Sender<SolverEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn training_set(&self) -> &TrainingSet {
        &self.training
    }

    pub fn surrogate(&self) -> &dyn SurrogateModel {
        self.surrogate.as_ref()
    }

    pub fn reference_evaluations(&self) -> usize {
        self.reference_evaluations
    }

    pub fn into_parts(self) -> (TrainingSet, Box<dyn SurrogateModel>) {
        (self.training, self.surrogate)
    }

    fn emit(&self, event: SolverEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn enter(&self, phase: Phase) {
        debug!("Phase -> {:?}", phase);
        self.emit(SolverEvent::PhaseChanged(phase));
    }

    /// Interpolates the endpoints and runs the loop.
    pub fn run(&mut self, initial: &Configuration, final_: &Configuration) -> Result<RunReport> {
        let path = PathRepresentation::initialize_with(
            initial,
            final_,
            self.params.n_images,
            self.params.interpolation,
            &self.params.idpp,
            self.params.endpoint_tolerance,
        )?;
        self.run_from_path(path)
    }

    /// Runs the loop from an existing path (warm start).
    pub fn run_from_path(&mut self, path: PathRepresentation) -> Result<RunReport> {
        if path.n_interior() == 0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "path",
                reason: "at least one interior image is required for validation".to_string(),
            }
            .into());
        }
        let start = Instant::now();
        info!(
            "Run {}: {} images, reference '{}', surrogate '{}'",
            self.run_id,
            path.len(),
            self.reference.name(),
            self.surrogate.name()
        );
        self.emit(SolverEvent::Log(format!("Run {} started", self.run_id)));
        self.warn_collapsed(&path);

        self.seed(&path)?;

        let mut path = path;
        let mut record = ConvergenceRecord::default();
        let mut state = PolicyState::default();
        let mut best: Option<Candidate> = None;
        let mut latest: Option<Relaxation> = None;

        for iteration in 1..=self.params.max_outer_iterations {
            state.iteration = iteration;
            state.generation = self.surrogate.generation();
            let plan = policy::plan(&self.params, path.n_interior(), &state);
            info!(
                "Iteration {}: generation {:?}, {} steps, validating {} image(s)",
                iteration,
                state.generation,
                plan.max_steps(),
                plan.n_validate
            );

            // A. Optimizing
            self.enter(Phase::Optimizing);
            let relaxation = {
                let surface = SurrogateSurface::new(self.surrogate.as_ref());
                ElasticBand::new(plan.neb.clone()).relax_stages(path.clone(), &surface, &plan.stages)?
            };

            if relaxation.state == OptimizerState::Diverged {
                warn!("Iteration {}: optimizer diverged, densifying around the last stable path", iteration);
                let interior = relaxation.path.interior().to_vec();
                let samples = self.evaluate(&interior)?;
                self.training.extend(samples);
                let fit_failed = self.retrain(&mut state);

                path = relaxation.path.clone();
                let entry = self.entry(iteration, &relaxation, None, Vec::new(), fit_failed);
                self.emit(SolverEvent::IterationUpdate(entry.clone()));
                record.push(entry);
                latest = Some(relaxation);
                continue;
            }
            self.warn_collapsed(&relaxation.path);

            // B. Validating
            self.enter(Phase::Validating);
            let chosen = policy::select_validation_images(&relaxation.energies, plan.n_validate);
            let configs: Vec<Configuration> = chosen.iter().map(|&i| relaxation.path.images()[i].clone()).collect();
            let samples = self.evaluate(&configs)?;
            let discrepancy = Discrepancy::of_model(self.surrogate.as_ref(), &samples)?;
            let ratio = discrepancy.ratio(&self.params.tolerance);

            let accepted = !chosen.is_empty()
                && discrepancy.within(&self.params.tolerance)
                && relaxation.is_converged()
                && relaxation.generation == self.surrogate.generation();

            info!(
                "Iteration {}: {:?} in {} steps, fmax {:.3e} | E_max {:.3e} eV/atom, F_max {:.3e} eV/Å (x{:.2} tolerance)",
                iteration,
                relaxation.state,
                relaxation.iterations,
                relaxation.max_force,
                discrepancy.energy_max,
                discrepancy.force_max,
                ratio
            );

            self.training.extend(samples);

            if best.as_ref().map_or(true, |b| ratio < b.ratio) {
                best = Some(Candidate {
                    ratio,
                    discrepancy,
                    relaxation: relaxation.clone(),
                });
            }

            let fit_failed = if accepted { false } else { self.retrain(&mut state) };
            let entry = self.entry(iteration, &relaxation, Some(discrepancy), chosen, fit_failed);
            self.emit(SolverEvent::IterationUpdate(entry.clone()));
            record.push(entry);

            if accepted {
                self.enter(Phase::Accepted);
                info!("Accepted after {} iteration(s)", iteration);
                return Ok(self.report(TerminalStatus::Accepted, relaxation, Some(discrepancy), record, start));
            }

            state.last_discrepancy = Some(discrepancy);
            path = relaxation.path.clone();
            latest = Some(relaxation);
        }

        self.enter(Phase::Exhausted);
        warn!(
            "Outer-iteration budget ({}) exhausted without acceptance",
            self.params.max_outer_iterations
        );

        let (relaxation, discrepancy) = match (best, latest) {
            (Some(b), _) => (b.relaxation, Some(b.discrepancy)),
            (None, Some(r)) => (r, None),
            (None, None) => {
                let surface = SurrogateSurface::new(self.surrogate.as_ref());
                let energies = profile_energies(&path, &surface)?;
                let relaxation = Relaxation {
                    state: OptimizerState::Initialized,
                    path,
                    energies,
                    max_force: f64::INFINITY,
                    iterations: 0,
                    generation: self.surrogate.generation(),
                    climbing_image: None,
                };
                (relaxation, None)
            }
        };
        Ok(self.report(TerminalStatus::Exhausted, relaxation, discrepancy, record, start))
    }

    /// Builds the first training set and fits generation 0.
    fn seed(&mut self, path: &PathRepresentation) -> Result<()> {
        if !self.training.is_empty() && self.surrogate.generation().is_some() {
            info!(
                "Resuming from generation {:?} with {} samples, seeding skipped",
                self.surrogate.generation(),
                self.training.len()
            );
            return Ok(());
        }

        self.enter(Phase::Seeding);
        let mut evaluated = policy::seed_indices(path.len(), self.params.seed_images);
        let configs: Vec<Configuration> = evaluated.iter().map(|&i| path.images()[i].clone()).collect();
        info!("Seeding: evaluating {} image(s) with {}", configs.len(), self.reference.name());
        let samples = self.evaluate(&configs)?;
        self.training.extend(samples);

        let attempts = self.params.max_fit_attempts;
        for attempt in 1..=attempts {
            match self.fit() {
                Ok(generation) => {
                    info!("Seeding: surrogate generation {} on {} samples", generation, self.training.len());
                    return Ok(());
                }
                Err(e) => {
                    let remaining: Vec<usize> = (1..path.len() - 1).filter(|i| !evaluated.contains(i)).collect();
                    if attempt == attempts || remaining.is_empty() {
                        return Err(e.into());
                    }
                    warn!(
                        "Seeding fit {}/{} failed ({}), densifying with {} more image(s)",
                        attempt,
                        attempts,
                        e,
                        remaining.len()
                    );
                    let configs: Vec<Configuration> = remaining.iter().map(|&i| path.images()[i].clone()).collect();
                    let samples = self.evaluate(&configs)?;
                    self.training.extend(samples);
                    evaluated.extend(remaining);
                }
            }
        }
        Err(SurrogateError::FitDivergence("no fit attempt made".to_string()).into())
    }

    /// Reference-evaluates in parallel. The first failure that outlived its retries is fatal.
    fn evaluate(&mut self, configs: &[Configuration]) -> Result<Vec<Sample>> {
        if configs.is_empty() {
            return Ok(Vec::new());
        }
        let results = evaluate_batch(&self.reference, configs, &self.params.evaluation);
        self.reference_evaluations += configs.len();
        let samples = results.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    fn fit(&mut self) -> std::result::Result<u64, SurrogateError> {
        let snapshot = self.training.snapshot_filtered(&self.params.dataset);
        self.surrogate.fit(&snapshot)?;
        let generation = self.surrogate.generation().ok_or(SurrogateError::NotFitted)?;
        self.emit(SolverEvent::GenerationFitted {
            generation,
            samples: snapshot.len(),
        });
        Ok(generation)
    }

    /// Retrains after new data. A diverged fit keeps the previous generation and
    /// widens the next validation. Returns whether the fit failed.
    fn retrain(&mut self, state: &mut PolicyState) -> bool {
        match self.fit() {
            Ok(generation) => {
                debug!("Retrained: generation {} on {} samples", generation, self.training.len());
                state.fit_failures = 0;
                false
            }
            Err(e) => {
                state.fit_failures += 1;
                warn!(
                    "Retrain failed ({}); keeping generation {:?}, widening validation",
                    e,
                    self.surrogate.generation()
                );
                self.emit(SolverEvent::Log(format!("Fit diverged: {}", e)));
                true
            }
        }
    }

    fn warn_collapsed(&self, path: &PathRepresentation) {
        let collapsed = path.collapsed_images(self.params.collapse_distance);
        if !collapsed.is_empty() {
            warn!(
                "Images {:?} have interatomic distances below {:.2} Å",
                collapsed, self.params.collapse_distance
            );
        }
    }

    fn entry(
        &self,
        iteration: usize,
        relaxation: &Relaxation,
        discrepancy: Option<Discrepancy>,
        validated_images: Vec<usize>,
        fit_failed: bool,
    ) -> ConvergenceEntry {
        ConvergenceEntry {
            iteration,
            generation: relaxation.generation,
            optimizer_state: relaxation.state,
            optimizer_steps: relaxation.iterations,
            max_force: relaxation.max_force,
            discrepancy,
            validated_images,
            training_set_size: self.training.len(),
            reference_evaluations: self.reference_evaluations,
            fit_failed,
            timestamp: Utc::now(),
        }
    }

    /// Energy of each image: the reference value when the image is in the training set,
    /// the surrogate prediction the path was relaxed under otherwise.
    fn profile(&self, relaxation: &Relaxation) -> (Vec<f64>, Vec<EnergySource>) {
        let tolerance = self.params.dataset.min_distance.max(1e-8);
        relaxation
            .path
            .images()
            .iter()
            .zip(&relaxation.energies)
            .map(|(image, &predicted)| {
                let known = self.training.samples().iter().find(|s| {
                    s.configuration().n_atoms() == image.n_atoms() && s.configuration().distance(image) <= tolerance
                });
                match known {
                    Some(s) => (s.energy(), EnergySource::Reference),
                    None => (predicted, EnergySource::Surrogate),
                }
            })
            .unzip()
    }

    fn report(
        &self,
        status: TerminalStatus,
        relaxation: Relaxation,
        discrepancy: Option<Discrepancy>,
        record: ConvergenceRecord,
        start: Instant,
    ) -> RunReport {
        let (energies, energy_sources) = self.profile(&relaxation);
        let barrier = energies
            .first()
            .map(|&e0| energies.iter().fold(f64::NEG_INFINITY, |m, &e| m.max(e)) - e0);

        self.emit(SolverEvent::Finished(status));
        RunReport {
            run_id: self.run_id,
            status,
            path: relaxation.path,
            energies,
            energy_sources,
            barrier,
            discrepancy,
            optimizer_state: relaxation.state,
            generation: relaxation.generation,
            record,
            training_set_size: self.training.len(),
            reference_evaluations: self.reference_evaluations,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }
}
