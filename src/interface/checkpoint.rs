//! JSON checkpoints of a run's training data.
//!
//! A checkpoint stores every reference sample and the surrogate generation reached,
//! which is all a resumed run needs: the samples seed the next `TrainingSet` and a
//! kernel surrogate is rebuilt on them at the stored generation.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::dataset::TrainingSet;
use crate::core::domain::Sample;
use crate::core::error::{Result, SurrogateError};
use crate::core::params::{DatasetParams, KernelParams};
use crate::engine::kernel::KernelSurrogate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub created: DateTime<Utc>,
    /// Evaluator that produced the samples.
    pub reference: String,
    pub generation: Option<u64>,
    pub samples: Vec<Sample>,
}

impl Checkpoint {
    pub fn new(run_id: Uuid, reference: &str, generation: Option<u64>, training: &TrainingSet) -> Self {
        Self {
            run_id,
            created: Utc::now(),
            reference: reference.to_string(),
            generation,
            samples: training.samples().to_vec(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Checkpoint with {} samples written to {}", self.samples.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&text)?;
        info!(
            "Loaded checkpoint {} ({} samples, generation {:?})",
            checkpoint.run_id,
            checkpoint.samples.len(),
            checkpoint.generation
        );
        Ok(checkpoint)
    }

    /// Kernel surrogate refitted on the stored samples at the stored generation.
    /// `None` if the checkpoint was taken before the first fit.
    pub fn restore_kernel(&self, params: KernelParams, dataset: &DatasetParams) -> Result<Option<KernelSurrogate>> {
        let Some(generation) = self.generation else {
            return Ok(None);
        };
        if self.samples.is_empty() {
            return Err(SurrogateError::EmptyTrainingSet.into());
        }
        let training = TrainingSet::with_samples(dataset.min_distance, self.samples.iter().cloned());
        let model = KernelSurrogate::restore(params, &training.snapshot_filtered(dataset), generation)?;
        Ok(Some(model))
    }
}
