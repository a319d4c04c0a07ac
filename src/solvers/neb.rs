use log::{debug, info, warn};
use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::domain::Configuration;
use crate::core::error::{ConfigurationError, Result};
use crate::core::params::{NebParams, TangentMethod};
use crate::core::path::PathRepresentation;
use crate::core::spatial;
use crate::engine::surface::EnergySurface;
use crate::engine::surrogate::Prediction;

// FIRE constants
const FIRE_N_MIN: usize = 5;
const FIRE_F_INC: f64 = 1.1;
const FIRE_F_DEC: f64 = 0.5;
const FIRE_ALPHA_START: f64 = 0.1;
const FIRE_F_ALPHA: f64 = 0.99;
/// Smallest time step, relative to the initial one.
const FIRE_MIN_DT_RATIO: f64 = 1e-2;

/// Lifecycle of one relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerState {
    Initialized,
    Relaxing,
    Converged,
    /// Non-fatal: the best path seen is returned, flagged as unconverged.
    IterationBudgetExhausted,
    /// Fatal to this run only: the surface is not trustworthy along this path.
    Diverged,
}

/// One relaxation stage: plain or climbing-image NEB to a force tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebStage {
    pub climb: bool,
    pub fmax: f64,
    pub max_steps: usize,
}

/// Outcome of a relaxation.
#[derive(Debug, Clone)]
pub struct Relaxation {
    pub state: OptimizerState,
    /// Converged: final path. Budget exhausted: lowest-fmax path seen. Diverged: last stable path.
    pub path: PathRepresentation,
    /// Surface energies of `path`, endpoints included.
    pub energies: Vec<f64>,
    /// Largest per-atom projected force on the interior of `path`.
    pub max_force: f64,
    pub iterations: usize,
    /// Surrogate generation the surface was backed by.
    pub generation: Option<u64>,
    pub climbing_image: Option<usize>,
}

impl Relaxation {
    pub fn is_converged(&self) -> bool {
        self.state == OptimizerState::Converged
    }

    /// Interior image with the highest energy (the transition-state candidate).
    pub fn highest_energy_image(&self) -> Option<usize> {
        highest_interior(&self.energies)
    }
}

fn highest_interior(energies: &[f64]) -> Option<usize> {
    if energies.len() < 3 {
        return None;
    }
    (1..energies.len() - 1).max_by(|&a, &b| energies[a].total_cmp(&energies[b]))
}

/// Snapshot of a path together with what the surface said about it.
#[derive(Clone)]
struct Evaluated {
    path: PathRepresentation,
    energies: Vec<f64>,
    max_force: f64,
}

/// Elastic-band path optimiser.
///
/// Each step evaluates all interior images (in parallel), projects the true force
/// perpendicular to the local tangent and adds a tangential spring force. The band
/// is then advanced by FIRE on the whole set of images: velocities are mixed towards
/// the force while the power `F·v` stays positive, and zeroed with a halved time step
/// when it turns negative. Per-atom displacement is capped at `max_step`.
/// Convergence is judged on the physical (projected) force only.
pub struct ElasticBand {
    params: NebParams,
}

impl ElasticBand {
    pub fn new(params: NebParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NebParams {
        &self.params
    }

    /// Runs stages back to back, each warm-started from the previous result.
    /// Stops early on divergence.
    pub fn relax_stages(
        &self,
        path: PathRepresentation,
        surface: &dyn EnergySurface,
        stages: &[NebStage],
    ) -> Result<Relaxation> {
        let (last_stage, leading) = stages.split_last().ok_or_else(|| ConfigurationError::InvalidParameter {
            name: "stages",
            reason: "at least one relaxation stage is required".to_string(),
        })?;

        let mut current = path;
        let mut iterations = 0;
        for stage in leading {
            let r = self.relax(current, surface, stage)?;
            iterations += r.iterations;
            if r.state == OptimizerState::Diverged {
                return Ok(Relaxation { iterations, ..r });
            }
            current = r.path;
        }

        let r = self.relax(current, surface, last_stage)?;
        Ok(Relaxation {
            iterations: iterations + r.iterations,
            ..r
        })
    }

    pub fn relax(
        &self,
        path: PathRepresentation,
        surface: &dyn EnergySurface,
        stage: &NebStage,
    ) -> Result<Relaxation> {
        let generation = surface.generation();
        let n = path.len();

        let first = surface.evaluate_image(0, path.initial())?;
        let last = surface.evaluate_image(n - 1, path.final_())?;

        if path.n_interior() == 0 {
            return Ok(Relaxation {
                state: OptimizerState::Converged,
                energies: vec![first.energy, last.energy],
                path,
                max_force: 0.0,
                iterations: 0,
                generation,
                climbing_image: None,
            });
        }

        debug!(
            "NEB {:?} -> {:?} ({} images, climb: {})",
            OptimizerState::Initialized,
            OptimizerState::Relaxing,
            n,
            stage.climb
        );

        let mut path = path;
        let mut energies = vec![0.0; n];
        energies[0] = first.energy;
        energies[n - 1] = last.energy;

        let min_dt = self.params.time_step * FIRE_MIN_DT_RATIO;
        let mut dt = self.params.time_step;
        let mut alpha = FIRE_ALPHA_START;
        let mut downhill = 0;
        let mut velocity: Option<Vec<DVector<f64>>> = None;
        let mut best: Option<Evaluated> = None;
        let mut last_stable: Option<Evaluated> = None;
        let mut prev_total: Option<f64> = None;
        let mut prev_delta: Option<f64> = None;
        let mut prev_raw_disp: Option<f64> = None;
        let mut unstable = 0;
        let mut climbing_image = None;

        for step in 1..=stage.max_steps {
            // A. Evaluate interior images
            let predictions: Vec<Prediction> = (1..n - 1)
                .into_par_iter()
                .map(|i| surface.evaluate_image(i, &path.images()[i]))
                .collect::<Result<Vec<_>>>()?;

            let mut true_forces: Vec<DVector<f64>> = Vec::with_capacity(n - 2);
            let mut finite = true;
            for (k, p) in predictions.iter().enumerate() {
                energies[k + 1] = p.energy;
                let mut f = spatial::flatten(&p.forces);
                zero_fixed(&mut f, path.images()[k + 1].fixed());
                finite &= p.energy.is_finite() && f.iter().all(|v| v.is_finite());
                true_forces.push(f);
            }

            if !finite {
                warn!("NEB step {}: non-finite energy or force, path diverged", step);
                return Ok(self.diverged(path, energies, last_stable, step, generation, climbing_image));
            }

            // B. Project forces
            climbing_image = if stage.climb { highest_interior(&energies) } else { None };
            let mut step_forces = Vec::with_capacity(n - 2);
            let mut max_force = 0.0_f64;

            for i in 1..n - 1 {
                let images = path.images();
                let forward = images[i].delta_flat(&images[i + 1]);
                let backward = images[i - 1].delta_flat(&images[i]);
                let tangent = self.tangent(&forward, &backward, energies[i - 1], energies[i], energies[i + 1]);

                let f = &true_forces[i - 1];
                let along = f.dot(&tangent);

                let (physical, total) = if climbing_image == Some(i) {
                    let climbing = f - &tangent * (2.0 * along);
                    (climbing.clone(), climbing)
                } else {
                    let perpendicular = f - &tangent * along;
                    let spring = &tangent * (self.params.spring_constant * (forward.norm() - backward.norm()));
                    let total = &perpendicular + spring;
                    (perpendicular, total)
                };

                max_force = max_force.max(spatial::max_norm_flat(&physical));
                step_forces.push(total);
            }

            let total_energy: f64 = energies[1..n - 1].iter().sum();
            let snapshot = Evaluated {
                path: path.clone(),
                energies: energies.clone(),
                max_force,
            };
            if best.as_ref().map_or(true, |b| max_force < b.max_force) {
                best = Some(snapshot.clone());
            }

            debug!(
                "NEB step {:>4}: fmax {:.4e}, E_path {:.6}, dt {:.3e}",
                step, max_force, total_energy, dt
            );

            // C. Convergence
            if max_force < stage.fmax {
                info!("NEB converged in {} steps (fmax {:.4e} < {:.4e})", step, max_force, stage.fmax);
                return Ok(Relaxation {
                    state: OptimizerState::Converged,
                    path,
                    energies,
                    max_force,
                    iterations: step,
                    generation,
                    climbing_image,
                });
            }

            // D. FIRE velocity update
            let mut v: Vec<DVector<f64>> = match velocity.take() {
                None => step_forces.iter().map(|f| DVector::zeros(f.len())).collect(),
                Some(mut v) => {
                    let power: f64 = v.iter().zip(&step_forces).map(|(v, f)| v.dot(f)).sum();
                    if power > 0.0 {
                        let v_norm = v.iter().map(|v| v.norm_squared()).sum::<f64>().sqrt();
                        let f_norm = step_forces.iter().map(|f| f.norm_squared()).sum::<f64>().sqrt();
                        let mix = if f_norm > 0.0 { alpha * v_norm / f_norm } else { 0.0 };
                        for (vi, fi) in v.iter_mut().zip(&step_forces) {
                            *vi *= 1.0 - alpha;
                            *vi += fi * mix;
                        }
                        downhill += 1;
                        if downhill > FIRE_N_MIN {
                            dt = (dt * FIRE_F_INC).min(self.params.max_time_step);
                            alpha *= FIRE_F_ALPHA;
                        }
                    } else {
                        for vi in v.iter_mut() {
                            vi.fill(0.0);
                        }
                        dt = (dt * FIRE_F_DEC).max(min_dt);
                        alpha = FIRE_ALPHA_START;
                        downhill = 0;
                    }
                    v
                }
            };
            for (vi, fi) in v.iter_mut().zip(&step_forces) {
                *vi += fi * dt;
            }

            // E. Divergence detection
            let raw_disp = v.iter().map(|vi| spatial::max_norm_flat(vi) * dt).fold(0.0, f64::max);
            let delta = prev_total.map(|pt| total_energy - pt);

            let displacement_blowup =
                prev_raw_disp.map_or(false, |p| raw_disp > self.params.divergence_factor * p.max(1e-12));
            let energy_blowup = match (delta, prev_delta) {
                (Some(d), Some(pd)) => d > 0.0 && d > self.params.divergence_factor * pd.abs().max(1e-8),
                _ => false,
            };

            if displacement_blowup || energy_blowup {
                unstable += 1;
                debug!("NEB step {}: unstable ({}/{})", step, unstable, self.params.divergence_patience);
                if unstable >= self.params.divergence_patience {
                    warn!("NEB diverged after {} steps", step);
                    return Ok(self.diverged(path, energies, last_stable, step, generation, climbing_image));
                }
            } else {
                unstable = 0;
                last_stable = Some(snapshot);
            }

            // F. Move interior images
            for (k, vi) in v.iter().enumerate() {
                let mut disp = vi * dt;
                let largest = spatial::max_norm_flat(&disp);
                if largest > self.params.max_step {
                    disp *= self.params.max_step / largest;
                }
                path.perturb(k + 1, &spatial::unflatten(&disp))?;
            }

            prev_total = Some(total_energy);
            prev_delta = delta;
            prev_raw_disp = Some(raw_disp);
            velocity = Some(v);
        }

        let best = best.unwrap_or(Evaluated {
            path,
            energies,
            max_force: f64::INFINITY,
        });
        info!(
            "NEB iteration budget ({}) exhausted, best fmax {:.4e}",
            stage.max_steps, best.max_force
        );
        Ok(Relaxation {
            state: OptimizerState::IterationBudgetExhausted,
            climbing_image: if stage.climb { highest_interior(&best.energies) } else { None },
            path: best.path,
            energies: best.energies,
            max_force: best.max_force,
            iterations: stage.max_steps,
            generation,
        })
    }

    fn diverged(
        &self,
        path: PathRepresentation,
        energies: Vec<f64>,
        last_stable: Option<Evaluated>,
        iterations: usize,
        generation: Option<u64>,
        climbing_image: Option<usize>,
    ) -> Relaxation {
        let stable = last_stable.unwrap_or(Evaluated {
            path,
            energies,
            max_force: f64::INFINITY,
        });
        Relaxation {
            state: OptimizerState::Diverged,
            path: stable.path,
            energies: stable.energies,
            max_force: stable.max_force,
            iterations,
            generation,
            climbing_image,
        }
    }

    /// Unit tangent at an interior image from its bond vectors and neighbour energies.
    fn tangent(&self, forward: &DVector<f64>, backward: &DVector<f64>, e_prev: f64, e: f64, e_next: f64) -> DVector<f64> {
        let improved = match self.params.tangent {
            TangentMethod::Improved => improved_tangent(forward, backward, e_prev, e, e_next),
            TangentMethod::Bisector => None,
        };
        improved
            .or_else(|| bisector_tangent(forward, backward))
            .unwrap_or_else(|| DVector::zeros(forward.len()))
    }
}

fn normalized(v: DVector<f64>) -> Option<DVector<f64>> {
    let norm = v.norm();
    if norm > 1e-12 && norm.is_finite() {
        Some(v / norm)
    } else {
        None
    }
}

/// Energy-weighted upwind tangent.
fn improved_tangent(forward: &DVector<f64>, backward: &DVector<f64>, e_prev: f64, e: f64, e_next: f64) -> Option<DVector<f64>> {
    let raw = if e_next > e && e > e_prev {
        forward.clone()
    } else if e_next < e && e < e_prev {
        backward.clone()
    } else {
        let d_next = (e_next - e).abs();
        let d_prev = (e_prev - e).abs();
        let (dv_max, dv_min) = (d_next.max(d_prev), d_next.min(d_prev));
        if e_next > e_prev {
            forward * dv_max + backward * dv_min
        } else {
            forward * dv_min + backward * dv_max
        }
    };
    normalized(raw)
}

fn bisector_tangent(forward: &DVector<f64>, backward: &DVector<f64>) -> Option<DVector<f64>> {
    let f = normalized(forward.clone());
    let b = normalized(backward.clone());
    match (f, b) {
        (Some(f), Some(b)) => normalized(f + b),
        (Some(f), None) => Some(f),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn zero_fixed(flat: &mut DVector<f64>, fixed: &[bool]) {
    for (atom, &frozen) in fixed.iter().enumerate() {
        if frozen {
            for c in 0..3 {
                flat[3 * atom + c] = 0.0;
            }
        }
    }
}

/// Energies of every image of `path` on `surface` (endpoints included).
pub fn profile_energies(path: &PathRepresentation, surface: &dyn EnergySurface) -> Result<Vec<f64>> {
    path.images()
        .par_iter()
        .enumerate()
        .map(|(i, image): (usize, &Configuration)| Ok(surface.evaluate_image(i, image)?.energy))
        .collect()
}
