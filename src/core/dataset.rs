use std::sync::Arc;

use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::core::domain::Sample;
use crate::core::params::DatasetParams;

/// What `TrainingSet::add` did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// A sample within the minimum distance was replaced by the newer one.
    Refreshed { index: usize },
}

/// Accumulating reference data for the surrogate.
///
/// **Invariant**: the set never shrinks. A new sample within `min_distance` of its nearest
/// stored neighbour replaces that neighbour instead of being appended, so repeated visits to
/// one geometry do not pile up. Samples already in the set are not re-checked against each other.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    samples: Vec<Sample>,
    min_distance: f64,
}

impl TrainingSet {
    pub fn new(min_distance: f64) -> Self {
        Self {
            samples: Vec::new(),
            min_distance,
        }
    }

    /// Seeds the set with prior samples (e.g. from a checkpoint).
    pub fn with_samples(min_distance: f64, samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut set = Self::new(min_distance);
        set.extend(samples);
        set
    }

    pub fn add(&mut self, sample: Sample) -> AddOutcome {
        let nearest = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.configuration().n_atoms() == sample.configuration().n_atoms())
            .map(|(i, s)| (i, s.configuration().distance(sample.configuration())))
            .filter(|&(_, d)| d < self.min_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match nearest {
            Some((index, d)) => {
                debug!("Refreshing training sample {} (distance {:.3e})", index, d);
                self.samples[index] = sample;
                AddOutcome::Refreshed { index }
            }
            None => {
                self.samples.push(sample);
                AddOutcome::Inserted
            }
        }
    }

    /// Adds every sample, returning `(inserted, refreshed)` counts.
    pub fn extend(&mut self, samples: impl IntoIterator<Item = Sample>) -> (usize, usize) {
        let mut inserted = 0;
        let mut refreshed = 0;
        for s in samples {
            match self.add(s) {
                AddOutcome::Inserted => inserted += 1,
                AddOutcome::Refreshed { .. } => refreshed += 1,
            }
        }
        (inserted, refreshed)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn min_distance(&self) -> f64 {
        self.min_distance
    }

    /// Immutable view, unaffected by later additions.
    pub fn snapshot(&self) -> TrainingSnapshot {
        TrainingSnapshot::from_samples(self.samples.clone())
    }

    /// Snapshot without outliers (large forces or energies far from the mean).
    /// Falls back to the full set if the filter would remove everything.
    pub fn snapshot_filtered(&self, params: &DatasetParams) -> TrainingSnapshot {
        if self.samples.is_empty() {
            return self.snapshot();
        }
        let mean = self.samples.iter().map(|s| s.energy()).sum::<f64>() / self.samples.len() as f64;

        let kept: Vec<Sample> = self
            .samples
            .iter()
            .filter(|s| params.image_fmax.map_or(true, |limit| s.fmax() <= limit))
            .filter(|s| params.image_de.map_or(true, |limit| (s.energy() - mean).abs() <= limit))
            .cloned()
            .collect();

        if kept.is_empty() {
            warn!("Dataset filter rejected all {} samples; fitting on the full set", self.samples.len());
            return self.snapshot();
        }
        if kept.len() < self.samples.len() {
            debug!("Dataset filter kept {}/{} samples", kept.len(), self.samples.len());
        }
        TrainingSnapshot::from_samples(kept)
    }
}

/// Frozen, cheaply clonable view of training data handed to a surrogate fit.
#[derive(Debug, Clone)]
pub struct TrainingSnapshot {
    samples: Arc<[Sample]>,
}

impl TrainingSnapshot {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples: samples.into() }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `k`-way cross-validation split: `(training, validation)` per fold.
    /// Samples are shuffled with a seeded RNG and dealt round-robin into groups.
    pub fn folds(&self, k: usize, seed: u64) -> Vec<(TrainingSnapshot, TrainingSnapshot)> {
        let k = k.clamp(1, self.samples.len().max(1));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        order.shuffle(&mut rng);

        let groups: Vec<Vec<usize>> = (0..k)
            .map(|g| order.iter().enumerate().filter(|(j, _)| j % k == g).map(|(_, &i)| i).collect())
            .collect();

        (0..k)
            .map(|g| {
                let valid = groups[g].iter().map(|&i| self.samples[i].clone()).collect();
                let train = groups
                    .iter()
                    .enumerate()
                    .filter(|(h, _)| *h != g)
                    .flat_map(|(_, grp)| grp.iter().map(|&i| self.samples[i].clone()))
                    .collect();
                (Self::from_samples(train), Self::from_samples(valid))
            })
            .collect()
    }

    /// `n` resamplings with replacement, each as large as the snapshot.
    pub fn bootstrap(&self, n: usize, seed: u64) -> Vec<TrainingSnapshot> {
        let len = self.samples.len();
        if len == 0 {
            return vec![self.clone(); n];
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let picks = (0..len).map(|_| self.samples[rng.gen_range(0..len)].clone()).collect();
                Self::from_samples(picks)
            })
            .collect()
    }
}
