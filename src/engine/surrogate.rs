use crate::core::dataset::TrainingSnapshot;
use crate::core::domain::{Configuration, Forces};
use crate::core::error::SurrogateError;

/// Energy (eV) and forces (eV/Å) predicted for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub energy: f64,
    pub forces: Forces,
}

/// A cheap trainable regressor standing in for the reference evaluator.
///
/// Implementations are read-only after `fit`, so `predict` may be called from
/// several threads at once.
pub trait SurrogateModel: Send + Sync {
    /// Blocking fit on a frozen snapshot.
    ///
    /// On success the generation advances (the first fit yields generation 0).
    /// On error the previous parameters and generation must be left untouched,
    /// so the caller can keep using the last good model.
    fn fit(&mut self, training: &TrainingSnapshot) -> Result<(), SurrogateError>;

    /// Never mutates the model; repeated calls without a `fit` return identical results.
    fn predict(&self, configuration: &Configuration) -> Result<Prediction, SurrogateError>;

    /// `None` until the first successful fit.
    fn generation(&self) -> Option<u64>;

    fn name(&self) -> &str;
}
