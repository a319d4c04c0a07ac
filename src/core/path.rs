use log::{debug, warn};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::domain::Configuration;
use crate::core::error::{ConfigurationError, PathError, Result};
use crate::core::params::{IdppParams, InterpolationScheme, NebParams, TangentMethod};
use crate::core::spatial;
use crate::engine::idpp::IdppSurface;
use crate::solvers::neb::{ElasticBand, NebStage, OptimizerState};

const DEFAULT_ENDPOINT_TOLERANCE: f64 = 1e-3;

/// Ordered images of a transition path. The first and last images are the fixed
/// initial and final states; only interior images may move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRepresentation {
    images: Vec<Configuration>,
}

impl PathRepresentation {
    /// Builds `n_images` interior images between the endpoints, `n_images + 2` in total.
    pub fn initialize(
        initial: &Configuration,
        final_: &Configuration,
        n_images: usize,
        scheme: InterpolationScheme,
    ) -> Result<Self> {
        Self::initialize_with(
            initial,
            final_,
            n_images,
            scheme,
            &IdppParams::default(),
            DEFAULT_ENDPOINT_TOLERANCE,
        )
    }

    pub fn initialize_with(
        initial: &Configuration,
        final_: &Configuration,
        n_images: usize,
        scheme: InterpolationScheme,
        idpp: &IdppParams,
        endpoint_tolerance: f64,
    ) -> Result<Self> {
        initial.check_compatible(final_)?;

        let distance = initial.distance(final_);
        if distance <= endpoint_tolerance {
            return Err(ConfigurationError::DegenerateEndpoints {
                distance,
                tolerance: endpoint_tolerance,
            }
            .into());
        }

        let linear = Self::linear(initial, final_, n_images);
        match scheme {
            InterpolationScheme::Linear => Ok(linear),
            InterpolationScheme::Idpp => Ok(Self::relax_idpp(linear, idpp)),
        }
    }

    /// Warm start from an existing sequence of images.
    pub fn from_images(images: Vec<Configuration>) -> std::result::Result<Self, ConfigurationError> {
        if images.len() < 2 {
            return Err(ConfigurationError::EmptyPath(images.len()));
        }
        for image in &images[1..] {
            images[0].check_compatible(image)?;
        }
        Ok(Self { images })
    }

    fn linear(initial: &Configuration, final_: &Configuration, n_images: usize) -> Self {
        let total = n_images + 1;
        let mut images = Vec::with_capacity(n_images + 2);
        images.push(initial.clone());
        for i in 1..=n_images {
            images.push(initial.interpolate(final_, i as f64 / total as f64));
        }
        images.push(final_.clone());
        Self { images }
    }

    fn relax_idpp(linear: Self, idpp: &IdppParams) -> Self {
        if linear.n_interior() == 0 {
            return linear;
        }
        let surface = IdppSurface::new(linear.initial(), linear.final_(), linear.len());
        let band = ElasticBand::new(NebParams {
            spring_constant: idpp.spring_constant,
            tangent: TangentMethod::Improved,
            climb: false,
            max_step: idpp.max_step,
            ..NebParams::default()
        });
        let stage = NebStage {
            climb: false,
            fmax: idpp.fmax,
            max_steps: idpp.steps,
        };

        match band.relax(linear.clone(), &surface, &stage) {
            Ok(relaxation) if relaxation.state != OptimizerState::Diverged => {
                debug!(
                    "IDPP interpolation finished in {} steps ({:?}, fmax {:.3e})",
                    relaxation.iterations, relaxation.state, relaxation.max_force
                );
                relaxation.path
            }
            Ok(_) => {
                warn!("IDPP relaxation diverged, falling back to linear interpolation");
                linear
            }
            Err(e) => {
                warn!("IDPP relaxation failed ({}), falling back to linear interpolation", e);
                linear
            }
        }
    }

    /// Moves one interior image by a per-atom displacement.
    pub fn perturb(&mut self, image_index: usize, displacement: &[Vector3<f64>]) -> std::result::Result<(), PathError> {
        let len = self.images.len();
        if image_index >= len {
            return Err(PathError::IndexOutOfRange { index: image_index, len });
        }
        if image_index == 0 || image_index == len - 1 {
            return Err(PathError::ImmutableEndpoint { index: image_index });
        }
        let image = &self.images[image_index];
        if displacement.len() != image.n_atoms() {
            return Err(PathError::DisplacementLength {
                expected: image.n_atoms(),
                actual: displacement.len(),
            });
        }
        self.images[image_index] = image.displaced(displacement);
        Ok(())
    }

    /// The full ordered sequence, endpoints included.
    pub fn images(&self) -> &[Configuration] {
        &self.images
    }

    pub fn interior(&self) -> &[Configuration] {
        &self.images[1..self.images.len() - 1]
    }

    pub fn initial(&self) -> &Configuration {
        &self.images[0]
    }

    pub fn final_(&self) -> &Configuration {
        &self.images[self.images.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn n_interior(&self) -> usize {
        self.images.len() - 2
    }

    /// Cumulative path length (Å, in the full 3N space) at each image.
    pub fn reaction_coordinates(&self) -> Vec<f64> {
        let mut s = Vec::with_capacity(self.images.len());
        let mut acc = 0.0;
        s.push(acc);
        for pair in self.images.windows(2) {
            acc += pair[0].delta_flat(&pair[1]).norm();
            s.push(acc);
        }
        s
    }

    /// Indices of images with an interatomic distance below `min_distance`.
    pub fn collapsed_images(&self, min_distance: f64) -> Vec<usize> {
        self.images
            .iter()
            .enumerate()
            .filter(|(_, image)| !spatial::check_overlap(image, min_distance))
            .map(|(i, _)| i)
            .collect()
    }
}
