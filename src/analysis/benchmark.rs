use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::metrics::Discrepancy;
use crate::core::dataset::TrainingSnapshot;
use crate::core::error::{ConfigurationError, Result};
use crate::engine::surrogate::SurrogateModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub n_train: usize,
    pub n_valid: usize,
    pub train: Discrepancy,
    pub validation: Discrepancy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub model: String,
    pub folds: Vec<FoldResult>,
    /// Folds whose fit diverged; excluded from the means.
    pub failed_folds: usize,
    pub mean_train: Discrepancy,
    pub mean_validation: Discrepancy,
}

/// `k`-fold cross-validation of a surrogate family on a fixed data set.
///
/// `make_model` builds a fresh, unfitted model for every fold.
pub fn cross_validate<F>(snapshot: &TrainingSnapshot, k: usize, seed: u64, make_model: F) -> Result<BenchmarkReport>
where
    F: Fn() -> Box<dyn SurrogateModel>,
{
    if snapshot.len() < 2 {
        return Err(ConfigurationError::InvalidParameter {
            name: "samples",
            reason: format!("cross-validation needs at least 2 samples, got {}", snapshot.len()),
        }
        .into());
    }
    if k < 2 {
        return Err(ConfigurationError::InvalidParameter {
            name: "folds",
            reason: "need at least 2 folds".to_string(),
        }
        .into());
    }

    let mut folds = Vec::new();
    let mut failed_folds = 0;
    let mut model_name = String::new();

    for (fold, (train, valid)) in snapshot.folds(k, seed).into_iter().enumerate() {
        let mut model = make_model();
        model_name = model.name().to_string();

        if let Err(e) = model.fit(&train) {
            warn!("Fold {}: fit failed ({})", fold, e);
            failed_folds += 1;
            continue;
        }

        let result = FoldResult {
            fold,
            n_train: train.len(),
            n_valid: valid.len(),
            train: Discrepancy::of_model(model.as_ref(), train.samples())?,
            validation: Discrepancy::of_model(model.as_ref(), valid.samples())?,
        };
        info!(
            "Fold {}: train E_rmse {:.3e} F_rmse {:.3e} | valid E_rmse {:.3e} F_rmse {:.3e}",
            fold,
            result.train.energy_rmse,
            result.train.force_rmse,
            result.validation.energy_rmse,
            result.validation.force_rmse
        );
        folds.push(result);
    }

    let train: Vec<Discrepancy> = folds.iter().map(|f| f.train).collect();
    let validation: Vec<Discrepancy> = folds.iter().map(|f| f.validation).collect();

    Ok(BenchmarkReport {
        model: model_name,
        mean_train: Discrepancy::mean(&train),
        mean_validation: Discrepancy::mean(&validation),
        folds,
        failed_folds,
    })
}
