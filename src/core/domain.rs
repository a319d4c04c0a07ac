use nalgebra::{DVector, Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{ConfigurationError, EvaluationError};
use crate::core::spatial;

/// Per-atom force field (eV/Å), same order as the atoms of a `Configuration`.
pub type Forces = Vec<Vector3<f64>>;

// --- Physics Types ---

/// Represents a single chemical element/species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
}

impl Species {
    pub fn new(symbol: &str) -> Self {
        Self { symbol: symbol.to_string() }
    }
}

/// Ordered species table. `Configuration` element ids index into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct System {
    pub species: Vec<Species>,
}

impl System {
    pub fn new(species: Vec<Species>) -> Self {
        Self { species }
    }

    pub fn symbol(&self, element_id: usize) -> Option<&str> {
        self.species.get(element_id).map(|s| s.symbol.as_str())
    }
}

/// Defines the Periodic Boundary Conditions (if any).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub vectors: Matrix3<f64>, // Columns are a, b, c
    pub inverse: Matrix3<f64>, // Precomputed for fractional conversion
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Option<Self> {
        let vectors = Matrix3::from_columns(&[a, b, c]);
        let inverse = vectors.try_inverse()?;
        Some(Self { vectors, inverse })
    }
}

// --- The Core Value ---

/// An immutable set of atomic positions with its species and cell context.
///
/// Two configurations are compared by content with a tolerance (see [`Configuration::distance`]),
/// never bit-for-bit. Fixed atoms never move when a displacement is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    element_ids: Vec<usize>,
    positions: Vec<Point3<f64>>,
    fixed: Vec<bool>,
    lattice: Option<Lattice>,
}

impl Configuration {
    pub fn new(element_ids: Vec<usize>, positions: Vec<Point3<f64>>) -> Result<Self, ConfigurationError> {
        if element_ids.len() != positions.len() {
            return Err(ConfigurationError::AtomCountMismatch {
                expected: element_ids.len(),
                actual: positions.len(),
            });
        }
        if positions.iter().any(|p| p.coords.iter().any(|c| !c.is_finite())) {
            return Err(ConfigurationError::InvalidParameter {
                name: "positions",
                reason: "non-finite coordinate".to_string(),
            });
        }
        let fixed = vec![false; positions.len()];
        Ok(Self { element_ids, positions, fixed, lattice: None })
    }

    /// Marks atoms as frozen (e.g. the bottom layers of a slab).
    pub fn with_fixed(mut self, fixed: Vec<bool>) -> Result<Self, ConfigurationError> {
        if fixed.len() != self.positions.len() {
            return Err(ConfigurationError::AtomCountMismatch {
                expected: self.positions.len(),
                actual: fixed.len(),
            });
        }
        self.fixed = fixed;
        Ok(self)
    }

    pub fn with_lattice(mut self, lattice: Lattice) -> Self {
        self.lattice = Some(lattice);
        self
    }

    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }

    /// Degrees of freedom of the flattened coordinate vector.
    pub fn dof(&self) -> usize {
        3 * self.positions.len()
    }

    pub fn element_ids(&self) -> &[usize] {
        &self.element_ids
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn fixed(&self) -> &[bool] {
        &self.fixed
    }

    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    /// Ensures `other` describes the same atoms in the same order.
    pub fn check_compatible(&self, other: &Configuration) -> Result<(), ConfigurationError> {
        if self.n_atoms() != other.n_atoms() {
            return Err(ConfigurationError::AtomCountMismatch {
                expected: self.n_atoms(),
                actual: other.n_atoms(),
            });
        }
        if let Some(index) = self
            .element_ids
            .iter()
            .zip(&other.element_ids)
            .position(|(a, b)| a != b)
        {
            return Err(ConfigurationError::SpeciesMismatch { index });
        }
        Ok(())
    }

    /// Per-atom displacement from `self` to `other`, minimum-image when periodic.
    pub fn displacement_to(&self, other: &Configuration) -> Vec<Vector3<f64>> {
        let lattice = self.lattice.as_ref();
        self.positions
            .iter()
            .zip(&other.positions)
            .map(|(a, b)| spatial::min_image_delta(a, b, lattice))
            .collect()
    }

    /// Flattened displacement `[dx1, dy1, dz1, dx2, ...]` from `self` to `other`.
    pub fn delta_flat(&self, other: &Configuration) -> DVector<f64> {
        spatial::flatten(&self.displacement_to(other))
    }

    /// Largest single-atom displacement between two configurations.
    pub fn distance(&self, other: &Configuration) -> f64 {
        self.displacement_to(other)
            .iter()
            .map(|d| d.norm())
            .fold(0.0, f64::max)
    }

    pub fn rmsd(&self, other: &Configuration) -> f64 {
        let n = self.n_atoms();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = self.displacement_to(other).iter().map(|d| d.norm_squared()).sum();
        (sum / n as f64).sqrt()
    }

    pub fn approx_eq(&self, other: &Configuration, tolerance: f64) -> bool {
        self.n_atoms() == other.n_atoms() && self.distance(other) <= tolerance
    }

    pub fn to_flat(&self) -> DVector<f64> {
        DVector::from_iterator(self.dof(), self.positions.iter().flat_map(|p| p.coords.iter().copied()))
    }

    /// Returns a copy moved by `displacement`. Fixed atoms stay put.
    pub fn displaced(&self, displacement: &[Vector3<f64>]) -> Configuration {
        let mut next = self.clone();
        for ((pos, d), &frozen) in next.positions.iter_mut().zip(displacement).zip(&self.fixed) {
            if !frozen {
                *pos += d;
            }
        }
        next
    }

    pub fn displaced_flat(&self, displacement: &DVector<f64>) -> Configuration {
        self.displaced(&spatial::unflatten(displacement))
    }

    /// Point at fraction `t` of the straight (minimum-image) segment towards `other`.
    pub fn interpolate(&self, other: &Configuration, t: f64) -> Configuration {
        let delta: Vec<Vector3<f64>> = self.displacement_to(other).into_iter().map(|d| d * t).collect();
        self.displaced(&delta)
    }
}

// --- Reference Data ---

/// One reference data point. Produced only by a reference evaluator; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    id: Uuid,
    configuration: Configuration,
    energy: f64,
    forces: Forces,
    source: String,
}

impl Sample {
    pub fn new(
        configuration: Configuration,
        energy: f64,
        forces: Forces,
        source: &str,
    ) -> Result<Self, EvaluationError> {
        if forces.len() != configuration.n_atoms() {
            return Err(EvaluationError::Malformed(format!(
                "{} force vectors for {} atoms",
                forces.len(),
                configuration.n_atoms()
            )));
        }
        if !energy.is_finite() || forces.iter().any(|f| f.iter().any(|c| !c.is_finite())) {
            return Err(EvaluationError::Malformed("non-finite energy or forces".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            configuration,
            energy,
            forces,
            source: source.to_string(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn forces(&self) -> &[Vector3<f64>] {
        &self.forces
    }

    /// Name of the evaluator that produced this sample.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Largest per-atom force norm.
    pub fn fmax(&self) -> f64 {
        spatial::max_norm(&self.forces)
    }
}
