use std::sync::Arc;

use crate::core::domain::Configuration;
use crate::core::error::Result;
use crate::core::params::EvaluationPolicy;
use crate::engine::evaluator::{evaluate_with_policy, ReferenceEvaluator};
use crate::engine::surrogate::{Prediction, SurrogateModel};

/// Energy/force function an elastic band is relaxed on.
///
/// `index` is the image's position on the path, for surfaces that depend on it (IDPP).
pub trait EnergySurface: Sync {
    fn evaluate_image(&self, index: usize, configuration: &Configuration) -> Result<Prediction>;

    /// Surrogate generation backing this surface, if any.
    fn generation(&self) -> Option<u64> {
        None
    }
}

/// Relaxation under the current surrogate generation.
pub struct SurrogateSurface<'a> {
    model: &'a dyn SurrogateModel,
}

impl<'a> SurrogateSurface<'a> {
    pub fn new(model: &'a dyn SurrogateModel) -> Self {
        Self { model }
    }
}

impl EnergySurface for SurrogateSurface<'_> {
    fn evaluate_image(&self, _index: usize, configuration: &Configuration) -> Result<Prediction> {
        Ok(self.model.predict(configuration)?)
    }

    fn generation(&self) -> Option<u64> {
        self.model.generation()
    }
}

/// Relaxation directly under the reference evaluator (retry and timeout policy applied).
pub struct ReferenceSurface {
    evaluator: Arc<dyn ReferenceEvaluator>,
    policy: EvaluationPolicy,
}

impl ReferenceSurface {
    pub fn new(evaluator: Arc<dyn ReferenceEvaluator>, policy: EvaluationPolicy) -> Self {
        Self { evaluator, policy }
    }
}

impl EnergySurface for ReferenceSurface {
    fn evaluate_image(&self, _index: usize, configuration: &Configuration) -> Result<Prediction> {
        let sample = evaluate_with_policy(&self.evaluator, configuration, &self.policy)?;
        Ok(Prediction {
            energy: sample.energy(),
            forces: sample.forces().to_vec(),
        })
    }
}
