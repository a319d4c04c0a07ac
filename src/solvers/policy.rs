use crate::analysis::metrics::Discrepancy;
use crate::core::params::{NebParams, Params};
use crate::solvers::neb::NebStage;

/// Generations after which the schedule counts as mature even without a small discrepancy.
const GENERATION_HORIZON: f64 = 10.0;

/// Everything the adaptive schedule depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolicyState {
    /// 1-based outer iteration.
    pub iteration: usize,
    pub generation: Option<u64>,
    pub last_discrepancy: Option<Discrepancy>,
    /// Consecutive retrains that diverged.
    pub fit_failures: usize,
}

/// Optimizer and validation settings for one outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub neb: NebParams,
    pub stages: Vec<NebStage>,
    pub n_validate: usize,
    /// 0 while the surrogate is coarse, 1 once the discrepancy is within tolerance.
    pub progress: f64,
}

impl PhasePlan {
    pub fn max_steps(&self) -> usize {
        self.stages.iter().map(|s| s.max_steps).sum()
    }
}

/// How far the surrogate is from acceptance, in `[0, 1]`.
///
/// Discrepancy ratios at or above `coarse_ratio` map to 0, ratios at or below 1 map to 1,
/// log-linear in between. Older generations earn up to 0.5 regardless.
fn progress(params: &Params, state: &PolicyState) -> f64 {
    let from_discrepancy = match state.last_discrepancy {
        None => 0.0,
        Some(d) => {
            let ratio = d.ratio(&params.tolerance).max(1.0);
            let coarse = params.validation.coarse_ratio;
            (1.0 - ratio.ln() / coarse.ln()).clamp(0.0, 1.0)
        }
    };
    let from_generation = state
        .generation
        .map_or(0.0, |g| 0.5 * (g as f64 / GENERATION_HORIZON).min(1.0));

    from_discrepancy.max(from_generation)
}

fn is_coarse(params: &Params, state: &PolicyState) -> bool {
    state
        .last_discrepancy
        .map_or(true, |d| d.ratio(&params.tolerance) >= params.validation.coarse_ratio)
}

/// Settings for the next outer iteration.
///
/// Coarse (no discrepancy yet, or far above tolerance): a single non-climbing stage on the
/// short step budget, every interior image validated. Otherwise the budget grows towards
/// `steps_fine`, the step cap shrinks, a climbing stage is appended and only
/// `min_images` (widened after failed fits) are validated. The last stage always targets
/// `neb.fmax`, so any accepted path is converged to the final tolerance.
pub fn plan(params: &Params, n_interior: usize, state: &PolicyState) -> PhasePlan {
    let neb = &params.neb;
    let p = progress(params, state);
    let coarse = is_coarse(params, state);

    let span = neb.steps_fine.saturating_sub(neb.steps_coarse) as f64;
    let max_steps = neb.steps_coarse + (span * p).round() as usize;

    let mut tuned = neb.clone();
    tuned.max_step = neb.max_step * (1.0 - 0.5 * p);

    let stages = if coarse || !neb.climb {
        vec![NebStage {
            climb: false,
            fmax: neb.fmax,
            max_steps,
        }]
    } else {
        let pre_fmax = neb.fmax_coarse + (neb.fmax - neb.fmax_coarse) * p;
        vec![
            NebStage {
                climb: false,
                fmax: pre_fmax.max(neb.fmax),
                max_steps,
            },
            NebStage {
                climb: true,
                fmax: neb.fmax,
                max_steps,
            },
        ]
    };

    let n_validate = if coarse {
        n_interior
    } else {
        params.validation.min_images + state.fit_failures * params.validation.widen_step
    }
    .clamp(1, n_interior.max(1));

    PhasePlan {
        neb: tuned,
        stages,
        n_validate,
        progress: p,
    }
}

/// Interior images to validate: the highest-energy one plus `n - 1` others spread
/// evenly by index. Returned sorted.
pub fn select_validation_images(energies: &[f64], n: usize) -> Vec<usize> {
    if energies.len() < 3 || n == 0 {
        return Vec::new();
    }
    let last = energies.len() - 1;
    let top = match (1..last).max_by(|&a, &b| energies[a].total_cmp(&energies[b])) {
        Some(i) => i,
        None => return Vec::new(),
    };

    let others: Vec<usize> = (1..last).filter(|&i| i != top).collect();
    let extra = (n - 1).min(others.len());

    let mut chosen = vec![top];
    if extra == others.len() {
        chosen.extend(&others);
    } else {
        chosen.extend((0..extra).map(|j| others[(2 * j + 1) * others.len() / (2 * extra)]));
    }
    chosen.sort_unstable();
    chosen.dedup();
    chosen
}

/// Path indices reference-evaluated while seeding: both endpoints and `k` evenly
/// spaced interior images.
pub fn seed_indices(n_total: usize, k: usize) -> Vec<usize> {
    if n_total < 2 {
        return (0..n_total).collect();
    }
    let n_interior = n_total - 2;
    let k = k.min(n_interior);

    let mut indices = vec![0];
    indices.extend((1..=k).map(|j| {
        let idx = (j as f64 * (n_total - 1) as f64 / (k + 1) as f64).round() as usize;
        idx.clamp(1, n_total - 2)
    }));
    indices.push(n_total - 1);
    indices.dedup();
    indices
}
