//! Closed-form rigid alignment of three corresponding point pairs.

use crate::error::{Error, Result};
use crate::params::RigidTransform;
use crate::types::Point;

/// Spreads below this RMS radius count as coincident points.
const MIN_SPREAD: f64 = 1e-12;

/// Find the similarity transform that maps `moving` onto `reference`.
///
/// The returned transform applies scale and rotation about the origin and
/// then translates, so `result.apply(moving[i]) ≈ reference[i]` and the
/// moving centroid lands exactly on the reference centroid. Scale is the
/// ratio of RMS radii (reference over moving); rotation is
/// `atan2(Σ m×r, Σ m·r)` over the centred sets.
///
/// Fails with [`Error::DegenerateAlignment`] when either set has zero spread.
pub fn align(moving: &[Point; 3], reference: &[Point; 3]) -> Result<RigidTransform> {
    let moving_mean = centroid(moving);
    let reference_mean = centroid(reference);

    let moving_centred = moving.map(|p| p - moving_mean);
    let reference_centred = reference.map(|p| p - reference_mean);

    let moving_spread = rms_radius(&moving_centred);
    let reference_spread = rms_radius(&reference_centred);
    if moving_spread < MIN_SPREAD || reference_spread < MIN_SPREAD {
        return Err(Error::DegenerateAlignment);
    }

    let scale = reference_spread / moving_spread;

    let mut cross = 0.0;
    let mut dot = 0.0;
    for (m, r) in moving_centred.iter().zip(reference_centred.iter()) {
        cross += m.x * r.y - m.y * r.x;
        dot += m.x * r.x + m.y * r.y;
    }
    let rotation = cross.atan2(dot);

    // Rotate and scale the moving centroid, then translate it onto the
    // reference centroid.
    let (sin, cos) = rotation.sin_cos();
    let rotated_mean = Point::new(
        scale * (cos * moving_mean.x - sin * moving_mean.y),
        scale * (sin * moving_mean.x + cos * moving_mean.y),
    );
    let translation = reference_mean - rotated_mean;

    Ok(RigidTransform::new(scale, rotation, translation.x, translation.y))
}

fn centroid(points: &[Point; 3]) -> Point {
    points.iter().fold(Point::zero(), |acc, p| acc + *p) * (1.0 / 3.0)
}

fn rms_radius(points: &[Point; 3]) -> f64 {
    (points.iter().map(Point::norm_squared).sum::<f64>() / 3.0).sqrt()
}
