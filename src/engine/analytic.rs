use nalgebra::Vector3;

use crate::core::domain::{Configuration, Sample};
use crate::core::error::EvaluationError;
use crate::core::spatial;
use crate::engine::evaluator::ReferenceEvaluator;

/// Closed-form Lennard-Jones pair potential, shared by every species pair.
///
/// With a cutoff the pair energy is shifted to zero at `cutoff`.
pub struct LennardJones {
    epsilon: f64,
    sigma: f64,
    cutoff: Option<f64>,
}

impl LennardJones {
    pub fn new(epsilon: f64, sigma: f64) -> Self {
        Self { epsilon, sigma, cutoff: None }
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    fn pair_energy(&self, r: f64) -> f64 {
        let sr6 = (self.sigma / r).powi(6);
        4.0 * self.epsilon * (sr6 * sr6 - sr6)
    }

    /// dE/dr of one pair.
    fn pair_derivative(&self, r: f64) -> f64 {
        let sr6 = (self.sigma / r).powi(6);
        4.0 * self.epsilon * (-12.0 * sr6 * sr6 + 6.0 * sr6) / r
    }
}

impl ReferenceEvaluator for LennardJones {
    fn evaluate(&self, configuration: &Configuration) -> Result<Sample, EvaluationError> {
        let atoms = configuration.positions();
        let lattice = configuration.lattice();
        let n = atoms.len();
        let shift = self.cutoff.map_or(0.0, |rc| self.pair_energy(rc));

        let mut energy = 0.0;
        let mut forces = vec![Vector3::zeros(); n];

        for i in 0..n {
            for j in (i + 1)..n {
                let r_vec = spatial::min_image_delta(&atoms[i], &atoms[j], lattice);
                let r = r_vec.norm();
                if r < 1e-10 {
                    return Err(EvaluationError::Malformed(format!("atoms {} and {} coincide", i, j)));
                }
                if self.cutoff.map_or(false, |rc| r > rc) {
                    continue;
                }
                energy += self.pair_energy(r) - shift;

                let f = r_vec * (self.pair_derivative(r) / r);
                forces[j] -= f;
                forces[i] += f;
            }
        }

        Sample::new(configuration.clone(), energy, forces, self.name())
    }

    fn name(&self) -> &str {
        "Lennard-Jones"
    }
}
