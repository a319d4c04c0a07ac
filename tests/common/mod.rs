#![allow(dead_code)]

use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aineb::core::dataset::TrainingSnapshot;
use aineb::core::domain::{Configuration, Sample};
use aineb::core::error::{EvaluationError, Result, SurrogateError};
use aineb::engine::evaluator::ReferenceEvaluator;
use aineb::engine::surface::EnergySurface;
use aineb::engine::surrogate::{Prediction, SurrogateModel};
use nalgebra::{Point3, Vector3};

/// Single configuration of independent atoms (element id 0).
pub fn atoms(positions: &[[f64; 3]]) -> Configuration {
    let points = positions.iter().map(|p| Point3::new(p[0], p[1], p[2])).collect();
    Configuration::new(vec![0; positions.len()], points).unwrap()
}

pub fn atom(x: f64, y: f64, z: f64) -> Configuration {
    atoms(&[[x, y, z]])
}

/// One atom hopping one unit along x, between two minima of [`CosineWell`].
pub fn hop_endpoints() -> (Configuration, Configuration) {
    (atom(0.0, 0.0, 0.0), atom(1.0, 0.0, 0.0))
}

/// Periodic corrugation along x, harmonic across:
/// `E = -A cos(2πx) + k/2 (y² + z²)` per atom. Minima at integer x, saddles at half-integers.
pub struct CosineWell {
    pub amplitude: f64,
    pub stiffness: f64,
}

impl Default for CosineWell {
    fn default() -> Self {
        Self {
            amplitude: 0.5,
            stiffness: 2.0,
        }
    }
}

impl CosineWell {
    pub fn energy_forces(&self, config: &Configuration) -> (f64, Vec<Vector3<f64>>) {
        let mut energy = 0.0;
        let mut forces = Vec::with_capacity(config.n_atoms());
        for p in config.positions() {
            energy += -self.amplitude * (2.0 * PI * p.x).cos() + 0.5 * self.stiffness * (p.y * p.y + p.z * p.z);
            forces.push(Vector3::new(
                -2.0 * PI * self.amplitude * (2.0 * PI * p.x).sin(),
                -self.stiffness * p.y,
                -self.stiffness * p.z,
            ));
        }
        (energy, forces)
    }
}

impl ReferenceEvaluator for CosineWell {
    fn evaluate(&self, configuration: &Configuration) -> std::result::Result<Sample, EvaluationError> {
        let (energy, forces) = self.energy_forces(configuration);
        Sample::new(configuration.clone(), energy, forces, self.name())
    }

    fn name(&self) -> &str {
        "Cosine Well"
    }
}

impl EnergySurface for CosineWell {
    fn evaluate_image(&self, _index: usize, configuration: &Configuration) -> Result<Prediction> {
        let (energy, forces) = self.energy_forces(configuration);
        Ok(Prediction { energy, forces })
    }
}

/// Every evaluation fails like a non-converging SCF.
pub struct FailingEvaluator {
    pub calls: AtomicUsize,
}

impl FailingEvaluator {
    pub fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

impl ReferenceEvaluator for FailingEvaluator {
    fn evaluate(&self, _configuration: &Configuration) -> std::result::Result<Sample, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EvaluationError::Solver("SCF did not converge".to_string()))
    }

    fn name(&self) -> &str {
        "Failing Evaluator"
    }
}

/// Sleeps before delegating, to exercise timeouts.
pub struct SlowEvaluator {
    pub delay: Duration,
    pub inner: CosineWell,
}

impl ReferenceEvaluator for SlowEvaluator {
    fn evaluate(&self, configuration: &Configuration) -> std::result::Result<Sample, EvaluationError> {
        thread::sleep(self.delay);
        self.inner.evaluate(configuration)
    }

    fn name(&self) -> &str {
        "Slow Evaluator"
    }
}

/// Zero energy and zero force everywhere.
pub struct FlatSurface;

impl EnergySurface for FlatSurface {
    fn evaluate_image(&self, _index: usize, configuration: &Configuration) -> Result<Prediction> {
        Ok(Prediction {
            energy: 0.0,
            forces: vec![Vector3::zeros(); configuration.n_atoms()],
        })
    }
}

/// Forces that grow a thousandfold with every evaluation.
pub struct ExplodingSurface {
    pub calls: AtomicUsize,
}

impl EnergySurface for ExplodingSurface {
    fn evaluate_image(&self, _index: usize, configuration: &Configuration) -> Result<Prediction> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let magnitude = 1e3_f64.powi(n as i32);
        Ok(Prediction {
            energy: magnitude,
            forces: vec![Vector3::new(0.0, magnitude, 0.0); configuration.n_atoms()],
        })
    }
}

/// A "surrogate" that answers with the reference evaluator itself, optionally with a
/// constant energy offset. Fits never look at the data; they only advance the generation.
/// With `fits_allowed`, every fit after that many successes diverges.
/// With `exploding_generation`, that generation answers like [`ExplodingSurface`].
pub struct ReferenceSurrogate {
    pub reference: Arc<dyn ReferenceEvaluator>,
    pub energy_offset: f64,
    pub fits_allowed: Option<usize>,
    pub exploding_generation: Option<u64>,
    fits: usize,
    generation: Option<u64>,
    predictions: AtomicUsize,
}

impl ReferenceSurrogate {
    pub fn new(reference: Arc<dyn ReferenceEvaluator>) -> Self {
        Self {
            reference,
            energy_offset: 0.0,
            fits_allowed: None,
            exploding_generation: None,
            fits: 0,
            generation: None,
            predictions: AtomicUsize::new(0),
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.energy_offset = offset;
        self
    }

    pub fn failing_after(mut self, fits: usize) -> Self {
        self.fits_allowed = Some(fits);
        self
    }

    pub fn exploding_in(mut self, generation: u64) -> Self {
        self.exploding_generation = Some(generation);
        self
    }
}

impl SurrogateModel for ReferenceSurrogate {
    fn fit(&mut self, training: &TrainingSnapshot) -> std::result::Result<(), SurrogateError> {
        if training.is_empty() {
            return Err(SurrogateError::EmptyTrainingSet);
        }
        if self.fits_allowed.map_or(false, |n| self.fits >= n) {
            return Err(SurrogateError::FitDivergence("loss exploded".to_string()));
        }
        self.fits += 1;
        self.generation = Some(self.generation.map_or(0, |g| g + 1));
        Ok(())
    }

    fn predict(&self, configuration: &Configuration) -> std::result::Result<Prediction, SurrogateError> {
        if self.generation.is_none() {
            return Err(SurrogateError::NotFitted);
        }
        if self.exploding_generation.is_some() && self.exploding_generation == self.generation {
            let n = self.predictions.fetch_add(1, Ordering::SeqCst);
            let magnitude = 1e3_f64.powi(n as i32);
            return Ok(Prediction {
                energy: magnitude,
                forces: vec![Vector3::new(0.0, magnitude, 0.0); configuration.n_atoms()],
            });
        }
        let sample = self
            .reference
            .evaluate(configuration)
            .map_err(|e| SurrogateError::FitDivergence(e.to_string()))?;
        Ok(Prediction {
            energy: sample.energy() + self.energy_offset,
            forces: sample.forces().to_vec(),
        })
    }

    fn generation(&self) -> Option<u64> {
        self.generation
    }

    fn name(&self) -> &str {
        "Reference Passthrough"
    }
}

/// Samples of `reference` along the straight hop, `n` points from x = 0 to x = 1.
pub fn hop_samples(reference: &dyn ReferenceEvaluator, n: usize, y: f64) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let x = i as f64 / (n - 1) as f64;
            reference.evaluate(&atom(x, y, 0.0)).unwrap()
        })
        .collect()
}
