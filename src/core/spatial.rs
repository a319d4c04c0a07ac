use nalgebra::{DVector, Point3, Vector3};

use crate::core::domain::{Configuration, Lattice};

/// Vector from `p1` to `p2`.
/// If `lattice` is provided, applies Minimum Image Convention (MIC).
#[inline]
pub fn min_image_delta(p1: &Point3<f64>, p2: &Point3<f64>, lattice: Option<&Lattice>) -> Vector3<f64> {
    let d_cart = p2 - p1;
    match lattice {
        Some(lat) => {
            // Periodic: wrap fractional delta to [-0.5, 0.5]
            let mut d_frac = lat.inverse * d_cart;
            d_frac.x -= d_frac.x.round();
            d_frac.y -= d_frac.y.round();
            d_frac.z -= d_frac.z.round();
            lat.vectors * d_frac
        }
        None => d_cart,
    }
}

/// Calculates the squared distance between two points (MIC when periodic).
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, lattice: Option<&Lattice>) -> f64 {
    min_image_delta(p1, p2, lattice).norm_squared()
}

/// Shortest interatomic distance in a configuration, `None` for fewer than two atoms.
pub fn min_pair_distance(config: &Configuration) -> Option<f64> {
    let atoms = config.positions();
    let lattice = config.lattice();
    let mut best: Option<f64> = None;

    for i in 0..atoms.len() {
        for j in (i + 1)..atoms.len() {
            let d_sq = distance_sq(&atoms[i], &atoms[j], lattice);
            best = Some(best.map_or(d_sq, |b| b.min(d_sq)));
        }
    }
    best.map(f64::sqrt)
}

/// Checks a configuration for physical overlaps (hard collisions).
/// Returns `true` if no pair is closer than `min_distance`.
pub fn check_overlap(config: &Configuration, min_distance: f64) -> bool {
    min_pair_distance(config).map_or(true, |d| d >= min_distance)
}

pub fn flatten(vectors: &[Vector3<f64>]) -> DVector<f64> {
    DVector::from_iterator(vectors.len() * 3, vectors.iter().flat_map(|v| v.iter().copied()))
}

pub fn unflatten(flat: &DVector<f64>) -> Vec<Vector3<f64>> {
    flat.as_slice()
        .chunks_exact(3)
        .map(|c| Vector3::new(c[0], c[1], c[2]))
        .collect()
}

/// Largest per-atom vector norm (the usual `fmax` measure for forces).
pub fn max_norm(vectors: &[Vector3<f64>]) -> f64 {
    vectors.iter().map(|v| v.norm()).fold(0.0, f64::max)
}

/// Largest per-atom norm of a flattened vector.
pub fn max_norm_flat(flat: &DVector<f64>) -> f64 {
    flat.as_slice()
        .chunks_exact(3)
        .map(|c| (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt())
        .fold(0.0, f64::max)
}
