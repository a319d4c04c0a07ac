use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::core::dataset::TrainingSnapshot;
use crate::core::domain::Configuration;
use crate::core::error::SurrogateError;
use crate::core::params::KernelParams;
use crate::core::spatial;
use crate::engine::surrogate::{Prediction, SurrogateModel};

#[derive(Debug, Clone)]
struct Fitted {
    configurations: Vec<Configuration>,
    alpha_energy: Vec<f64>,
    alpha_gradient: Vec<DVector<f64>>,
    mean: f64,
    dof: usize,
}

/// Gradient-enhanced kernel ridge regression with a squared-exponential kernel.
///
/// Energies and forces are fitted jointly: every sample contributes one energy row
/// and `3N` gradient rows, with the kernel's first and second derivatives as the
/// cross-covariances. Predicted forces are the exact negative gradient of the
/// predicted energy, so the model is a consistent energy surface for path relaxation.
#[derive(Debug, Clone)]
pub struct KernelSurrogate {
    params: KernelParams,
    fitted: Option<Fitted>,
    generation: Option<u64>,
}

impl KernelSurrogate {
    pub fn new(params: KernelParams) -> Self {
        Self {
            params,
            fitted: None,
            generation: None,
        }
    }

    /// Rebuilds a model on checkpointed data, continuing from `generation`.
    pub fn restore(
        params: KernelParams,
        training: &TrainingSnapshot,
        generation: u64,
    ) -> Result<Self, SurrogateError> {
        let mut model = Self::new(params);
        model.fitted = Some(model.solve(training)?);
        model.generation = Some(generation);
        Ok(model)
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    fn kernel(&self, d: &DVector<f64>) -> f64 {
        let l2 = self.params.length_scale * self.params.length_scale;
        self.params.signal_variance * (-d.norm_squared() / (2.0 * l2)).exp()
    }

    fn solve(&self, training: &TrainingSnapshot) -> Result<Fitted, SurrogateError> {
        let samples = training.samples();
        let first = samples.first().ok_or(SurrogateError::EmptyTrainingSet)?;
        let dof = first.configuration().dof();

        if let Some(bad) = samples.iter().find(|s| s.configuration().dof() != dof) {
            return Err(SurrogateError::DimensionMismatch {
                expected: dof,
                actual: bad.configuration().dof(),
            });
        }

        let n = samples.len();
        let block = 1 + dof;
        let m = n * block;
        let l2 = self.params.length_scale * self.params.length_scale;
        let mean = samples.iter().map(|s| s.energy()).sum::<f64>() / n as f64;

        let mut k_mat = DMatrix::<f64>::zeros(m, m);
        let mut y = DVector::<f64>::zeros(m);

        for (i, si) in samples.iter().enumerate() {
            let oi = i * block;
            y[oi] = si.energy() - mean;
            for (a, f) in si.forces().iter().flat_map(|v| v.iter()).enumerate() {
                y[oi + 1 + a] = -f;
            }

            for (j, sj) in samples.iter().enumerate() {
                let oj = j * block;
                // d = x_i - x_j
                let d = sj.configuration().delta_flat(si.configuration());
                let k = self.kernel(&d);

                k_mat[(oi, oj)] = k;
                for b in 0..dof {
                    k_mat[(oi, oj + 1 + b)] = k * d[b] / l2;
                    k_mat[(oi + 1 + b, oj)] = -k * d[b] / l2;
                }
                for a in 0..dof {
                    for b in 0..dof {
                        let delta = if a == b { 1.0 / l2 } else { 0.0 };
                        k_mat[(oi + 1 + a, oj + 1 + b)] = k * (delta - d[a] * d[b] / (l2 * l2));
                    }
                }
            }

            k_mat[(oi, oi)] += self.params.energy_noise;
            for a in 0..dof {
                k_mat[(oi + 1 + a, oi + 1 + a)] += self.params.force_noise;
            }
        }

        if k_mat.iter().any(|v| !v.is_finite()) || y.iter().any(|v| !v.is_finite()) {
            return Err(SurrogateError::FitDivergence("non-finite kernel system".to_string()));
        }

        let cholesky = k_mat.cholesky().ok_or_else(|| {
            SurrogateError::FitDivergence("kernel matrix is not positive definite".to_string())
        })?;
        let alpha = cholesky.solve(&y);

        if alpha.iter().any(|v| !v.is_finite()) {
            return Err(SurrogateError::FitDivergence("non-finite regression weights".to_string()));
        }

        let alpha_energy = (0..n).map(|i| alpha[i * block]).collect();
        let alpha_gradient = (0..n)
            .map(|i| alpha.rows(i * block + 1, dof).into_owned())
            .collect();

        Ok(Fitted {
            configurations: samples.iter().map(|s| s.configuration().clone()).collect(),
            alpha_energy,
            alpha_gradient,
            mean,
            dof,
        })
    }
}

impl SurrogateModel for KernelSurrogate {
    fn fit(&mut self, training: &TrainingSnapshot) -> Result<(), SurrogateError> {
        let fitted = self.solve(training)?;
        debug!(
            "Kernel surrogate fitted on {} samples ({} rows)",
            fitted.configurations.len(),
            fitted.configurations.len() * (1 + fitted.dof)
        );
        self.fitted = Some(fitted);
        self.generation = Some(self.generation.map_or(0, |g| g + 1));
        Ok(())
    }

    fn predict(&self, configuration: &Configuration) -> Result<Prediction, SurrogateError> {
        let fitted = self.fitted.as_ref().ok_or(SurrogateError::NotFitted)?;
        if configuration.dof() != fitted.dof {
            return Err(SurrogateError::DimensionMismatch {
                expected: fitted.dof,
                actual: configuration.dof(),
            });
        }

        let l2 = self.params.length_scale * self.params.length_scale;
        let mut energy = fitted.mean;
        let mut gradient = DVector::<f64>::zeros(fitted.dof);

        for ((train, &a_e), a_g) in fitted
            .configurations
            .iter()
            .zip(&fitted.alpha_energy)
            .zip(&fitted.alpha_gradient)
        {
            // d = x* - x_j
            let d = train.delta_flat(configuration);
            let k = self.kernel(&d);
            let d_dot = d.dot(a_g);

            energy += k * a_e + k * d_dot / l2;
            gradient += &d * (-k * a_e / l2 - k * d_dot / (l2 * l2));
            gradient += a_g * (k / l2);
        }

        let mut forces = spatial::unflatten(&(-gradient));
        for (f, &frozen) in forces.iter_mut().zip(configuration.fixed()) {
            if frozen {
                f.fill(0.0);
            }
        }

        Ok(Prediction { energy, forces })
    }

    fn generation(&self) -> Option<u64> {
        self.generation
    }

    fn name(&self) -> &str {
        "Kernel Ridge (gradient-enhanced)"
    }
}
