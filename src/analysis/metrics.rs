use serde::{Deserialize, Serialize};

use crate::core::domain::Sample;
use crate::core::error::SurrogateError;
use crate::core::params::Tolerance;
use crate::engine::surrogate::{Prediction, SurrogateModel};

/// Surrogate-vs-reference error on a set of samples.
///
/// Energies are per atom (eV/atom). `force_rmse` is taken over per-atom residual
/// vector norms and divided by √3 (a per-component RMSE); `force_max` is the largest
/// absolute residual component. Frozen atoms are ignored in the force terms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Discrepancy {
    pub energy_rmse: f64,
    pub energy_max: f64,
    pub force_rmse: f64,
    pub force_max: f64,
}

impl Discrepancy {
    /// Pairs `predictions[i]` with `references[i]`. All zero when there is nothing to compare.
    pub fn between(predictions: &[Prediction], references: &[Sample]) -> Self {
        let mut e_sq = 0.0;
        let mut e_max = 0.0_f64;
        let mut f_sq = 0.0;
        let mut f_max = 0.0_f64;
        let mut n_energy = 0usize;
        let mut n_atoms = 0usize;

        for (p, r) in predictions.iter().zip(references) {
            let config = r.configuration();
            let de = (p.energy - r.energy()) / config.n_atoms().max(1) as f64;
            e_sq += de * de;
            e_max = e_max.max(de.abs());
            n_energy += 1;

            for ((fp, fr), &frozen) in p.forces.iter().zip(r.forces()).zip(config.fixed()) {
                if frozen {
                    continue;
                }
                let df = fp - fr;
                f_sq += df.norm_squared();
                f_max = f_max.max(df.amax());
                n_atoms += 1;
            }
        }

        if n_energy == 0 {
            return Self::default();
        }

        Self {
            energy_rmse: (e_sq / n_energy as f64).sqrt(),
            energy_max: e_max,
            force_rmse: if n_atoms > 0 { (f_sq / n_atoms as f64).sqrt() / 3f64.sqrt() } else { 0.0 },
            force_max: f_max,
        }
    }

    /// Predicts every reference configuration with `model` and compares.
    pub fn of_model(model: &dyn SurrogateModel, references: &[Sample]) -> Result<Self, SurrogateError> {
        let predictions = references
            .iter()
            .map(|s| model.predict(s.configuration()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::between(&predictions, references))
    }

    pub fn within(&self, tolerance: &Tolerance) -> bool {
        self.energy_rmse <= tolerance.energy_rmse
            && self.energy_max <= tolerance.energy_max
            && self.force_rmse <= tolerance.force_rmse
            && self.force_max <= tolerance.force_max
    }

    /// Worst metric relative to its tolerance. At most 1.0 means accepted.
    pub fn ratio(&self, tolerance: &Tolerance) -> f64 {
        [
            self.energy_rmse / tolerance.energy_rmse,
            self.energy_max / tolerance.energy_max,
            self.force_rmse / tolerance.force_rmse,
            self.force_max / tolerance.force_max,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    /// Largest of the energy and force maxima, used when ranking iterations.
    pub fn worst(&self) -> f64 {
        self.energy_max.max(self.force_max)
    }

    /// Component-wise mean, e.g. across cross-validation folds.
    pub fn mean(items: &[Discrepancy]) -> Self {
        if items.is_empty() {
            return Self::default();
        }
        let n = items.len() as f64;
        Self {
            energy_rmse: items.iter().map(|d| d.energy_rmse).sum::<f64>() / n,
            energy_max: items.iter().map(|d| d.energy_max).sum::<f64>() / n,
            force_rmse: items.iter().map(|d| d.force_rmse).sum::<f64>() / n,
            force_max: items.iter().map(|d| d.force_max).sum::<f64>() / n,
        }
    }
}
