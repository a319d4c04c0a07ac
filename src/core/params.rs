use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{ConfigurationError, Result};

/// How interior images are generated between the two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationScheme {
    /// Straight-line interpolation of Cartesian coordinates.
    Linear,
    /// Image-dependent pair potential: linear start relaxed towards interpolated pair distances.
    Idpp,
}

/// Path tangent estimate used to project forces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TangentMethod {
    /// Energy-weighted upwind tangent (Henkelman & Jónsson 2000).
    Improved,
    /// Normalised sum of the two unit bond vectors.
    Bisector,
}

/// Acceptance thresholds for surrogate-vs-reference agreement.
/// Energies in eV/atom, forces in eV/Å.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub energy_rmse: f64,
    pub energy_max: f64,
    pub force_rmse: f64,
    pub force_max: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            energy_rmse: 0.001,
            energy_max: 0.002,
            force_rmse: 0.05,
            force_max: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NebParams {
    pub spring_constant: f64, // eV/Å^2
    pub tangent: TangentMethod,
    pub climb: bool,
    /// Target force convergence (eV/Å) of the final stage.
    pub fmax: f64,
    /// Loosest pre-climb tolerance, used while the surrogate is still poor.
    pub fmax_coarse: f64,
    pub steps_coarse: usize,
    pub steps_fine: usize,
    /// Largest per-atom displacement in one step (Å).
    pub max_step: f64,
    /// Initial FIRE time step (unit mass).
    pub time_step: f64,
    /// FIRE time step ceiling.
    pub max_time_step: f64,
    pub divergence_factor: f64,
    pub divergence_patience: usize,
}

impl Default for NebParams {
    fn default() -> Self {
        Self {
            spring_constant: 5.0,
            tangent: TangentMethod::Improved,
            climb: true,
            fmax: 0.05,
            fmax_coarse: 0.5,
            steps_coarse: 200,
            steps_fine: 400,
            max_step: 0.2,
            time_step: 0.1,
            max_time_step: 1.0,
            divergence_factor: 10.0,
            divergence_patience: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdppParams {
    pub fmax: f64,
    pub steps: usize,
    pub max_step: f64,
    pub spring_constant: f64,
}

impl Default for IdppParams {
    fn default() -> Self {
        Self {
            fmax: 0.1,
            steps: 500,
            max_step: 0.1,
            spring_constant: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// Images validated per iteration once the surrogate is roughly right.
    pub min_images: usize,
    /// Extra images added to the next validation after a diverged fit.
    pub widen_step: usize,
    /// Discrepancy / tolerance ratio above which the surrogate counts as coarse.
    pub coarse_ratio: f64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            min_images: 3,
            widen_step: 2,
            coarse_ratio: 10.0,
        }
    }
}

/// Retry and timeout policy for reference evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: usize,
    pub timeout_secs: f64,
}

impl EvaluationPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout_secs: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetParams {
    /// Samples closer than this (largest atom displacement, Å) refresh each other.
    pub min_distance: f64,
    /// Exclude samples with a larger per-atom force from the fit.
    pub image_fmax: Option<f64>,
    /// Exclude samples whose energy is farther than this from the set mean.
    pub image_de: Option<f64>,
}

impl Default for DatasetParams {
    fn default() -> Self {
        Self {
            min_distance: 0.01,
            image_fmax: Some(10.0),
            image_de: None,
        }
    }
}

/// Hyperparameters of the gradient-enhanced kernel surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    pub length_scale: f64,
    pub signal_variance: f64,
    pub energy_noise: f64,
    pub force_noise: f64,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            length_scale: 1.0,
            signal_variance: 1.0,
            energy_noise: 1e-6,
            force_noise: 1e-4,
        }
    }
}

/// Every tunable of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub seed: u64,
    pub threads: usize,

    // Path
    pub n_images: usize, // Interior images
    pub interpolation: InterpolationScheme,
    pub endpoint_tolerance: f64,
    pub collapse_distance: f64,

    // Active learning
    pub seed_images: usize,
    pub max_outer_iterations: usize,
    pub max_fit_attempts: usize,
    pub tolerance: Tolerance,

    pub neb: NebParams,
    pub idpp: IdppParams,
    pub validation: ValidationParams,
    pub evaluation: EvaluationPolicy,
    pub dataset: DatasetParams,
    pub kernel: KernelParams,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            seed: 0,
            threads: 4,
            n_images: 5,
            interpolation: InterpolationScheme::Idpp,
            endpoint_tolerance: 1e-3,
            collapse_distance: 0.5,
            seed_images: 1,
            max_outer_iterations: 50,
            max_fit_attempts: 3,
            tolerance: Tolerance::default(),
            neb: NebParams::default(),
            idpp: IdppParams::default(),
            validation: ValidationParams::default(),
            evaluation: EvaluationPolicy::default(),
            dataset: DatasetParams::default(),
            kernel: KernelParams::default(),
        }
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidParameter { name, reason: reason.to_string() }
}

fn positive(name: &'static str, value: f64) -> std::result::Result<(), ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, &format!("must be positive, got {}", value)))
    }
}

impl Params {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let params: Params = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.threads == 0 {
            return Err(invalid("threads", "must be at least 1"));
        }
        if self.n_images == 0 {
            return Err(invalid("n_images", "need at least one interior image"));
        }
        if self.seed_images > self.n_images {
            return Err(invalid("seed_images", "cannot exceed n_images"));
        }
        if self.max_outer_iterations == 0 {
            return Err(invalid("max_outer_iterations", "must be at least 1"));
        }
        if self.max_fit_attempts == 0 {
            return Err(invalid("max_fit_attempts", "must be at least 1"));
        }
        if !(self.endpoint_tolerance >= 0.0) {
            return Err(invalid("endpoint_tolerance", "must be non-negative"));
        }

        positive("tolerance.energy_rmse", self.tolerance.energy_rmse)?;
        positive("tolerance.energy_max", self.tolerance.energy_max)?;
        positive("tolerance.force_rmse", self.tolerance.force_rmse)?;
        positive("tolerance.force_max", self.tolerance.force_max)?;

        positive("neb.fmax", self.neb.fmax)?;
        positive("neb.fmax_coarse", self.neb.fmax_coarse)?;
        positive("neb.max_step", self.neb.max_step)?;
        positive("neb.time_step", self.neb.time_step)?;
        if !(self.neb.max_time_step >= self.neb.time_step) {
            return Err(invalid("neb.max_time_step", "must not be below neb.time_step"));
        }
        if !(self.neb.spring_constant >= 0.0) {
            return Err(invalid("neb.spring_constant", "must be non-negative"));
        }
        if self.neb.steps_coarse == 0 || self.neb.steps_fine < self.neb.steps_coarse {
            return Err(invalid("neb.steps_fine", "need 0 < steps_coarse <= steps_fine"));
        }
        if !(self.neb.divergence_factor > 1.0) {
            return Err(invalid("neb.divergence_factor", "must exceed 1"));
        }
        if self.neb.divergence_patience == 0 {
            return Err(invalid("neb.divergence_patience", "must be at least 1"));
        }

        positive("idpp.fmax", self.idpp.fmax)?;
        positive("idpp.max_step", self.idpp.max_step)?;

        if self.validation.min_images == 0 {
            return Err(invalid("validation.min_images", "must be at least 1"));
        }
        if !(self.validation.coarse_ratio > 1.0) {
            return Err(invalid("validation.coarse_ratio", "must exceed 1"));
        }

        positive("evaluation.timeout_secs", self.evaluation.timeout_secs)?;
        if !(self.dataset.min_distance >= 0.0) {
            return Err(invalid("dataset.min_distance", "must be non-negative"));
        }

        positive("kernel.length_scale", self.kernel.length_scale)?;
        positive("kernel.signal_variance", self.kernel.signal_variance)?;
        positive("kernel.energy_noise", self.kernel.energy_noise)?;
        positive("kernel.force_noise", self.kernel.force_noise)?;
        Ok(())
    }
}
