//! Parameter vector layout and the rigid `(a, b, tx, ty)` encoding.
//!
//! The first four parameters encode a 2D similarity transform as
//! `a = s·cos(θ) − 1`, `b = s·sin(θ)`, `tx`, `ty`. The remaining `K`
//! entries are shape-basis coefficients.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::types::Point;

/// Number of rigid (pose) parameters at the front of every parameter vector.
pub const NUM_RIGID: usize = 4;

/// Values of `a + 1` below this magnitude are treated as zero when
/// recovering rotation, so the recovery never divides by zero.
const RIGID_EPSILON: f64 = 1e-12;

/// Ordered parameters `[a, b, tx, ty, p_1..p_K]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    values: Vec<f64>,
}

impl ParameterVector {
    /// All-zero parameters for a model with `num_modes` shape modes.
    pub fn zeros(num_modes: usize) -> Self {
        Self {
            values: vec![0.0; NUM_RIGID + num_modes],
        }
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        debug_assert!(values.len() >= NUM_RIGID);
        Self { values }
    }

    /// Pose-only parameters: rigid part from `pose`, every shape coefficient zero.
    pub fn from_pose(pose: &RigidTransform, num_modes: usize) -> Self {
        let mut params = Self::zeros(num_modes);
        params.set_rigid(pose);
        params
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn num_modes(&self) -> usize {
        self.values.len() - NUM_RIGID
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn a(&self) -> f64 {
        self.values[0]
    }

    pub fn b(&self) -> f64 {
        self.values[1]
    }

    pub fn translation(&self) -> Point {
        Point::new(self.values[2], self.values[3])
    }

    /// Shape-basis coefficients `p_1..p_K`.
    pub fn shape(&self) -> &[f64] {
        &self.values[NUM_RIGID..]
    }

    pub fn shape_mut(&mut self) -> &mut [f64] {
        &mut self.values[NUM_RIGID..]
    }

    pub fn set_rigid(&mut self, pose: &RigidTransform) {
        let (a, b) = pose.encode();
        self.values[0] = a;
        self.values[1] = b;
        self.values[2] = pose.translate_x;
        self.values[3] = pose.translate_y;
    }

    /// Recover the similarity transform from the rigid parameters.
    pub fn rigid(&self) -> RigidTransform {
        RigidTransform::decode(self.a(), self.b(), self.values[2], self.values[3])
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Damped constant-velocity extrapolation from the two most recent
    /// parameter vectors: `relax·last + (1 − relax)·(2·last − prev)`.
    pub fn extrapolate(prev: &Self, last: &Self, relaxation: f64) -> Self {
        debug_assert_eq!(prev.len(), last.len());
        let values = prev
            .values
            .iter()
            .zip(last.values.iter())
            .map(|(p, l)| relaxation * l + (1.0 - relaxation) * (2.0 * l - p))
            .collect();
        Self { values }
    }
}

impl std::ops::Index<usize> for ParameterVector {
    type Output = f64;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.values[idx]
    }
}

/// A 2D similarity transform: scale and rotation about the origin, then translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub scale: f64,
    /// Rotation in radians, counter-clockwise in image coordinates.
    pub rotation: f64,
    pub translate_x: f64,
    pub translate_y: f64,
}

impl RigidTransform {
    pub const fn new(scale: f64, rotation: f64, translate_x: f64, translate_y: f64) -> Self {
        Self {
            scale,
            rotation,
            translate_x,
            translate_y,
        }
    }

    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Encode scale and rotation as the `(a, b)` parameter pair.
    pub fn encode(&self) -> (f64, f64) {
        (
            self.scale * self.rotation.cos() - 1.0,
            self.scale * self.rotation.sin(),
        )
    }

    /// Recover scale and rotation from an `(a, b)` pair.
    ///
    /// Rotation is folded into `(−π/2, π/2]`; the scale carries the sign
    /// that makes `(scale·cos θ, scale·sin θ) = (a + 1, b)` hold exactly.
    pub fn decode(a: f64, b: f64, translate_x: f64, translate_y: f64) -> Self {
        let c = a + 1.0;
        let rotation = if c.abs() < RIGID_EPSILON {
            FRAC_PI_2
        } else {
            (b / c).atan()
        };
        let magnitude = c.hypot(b);
        let scale = if c < -RIGID_EPSILON || (c.abs() < RIGID_EPSILON && b < 0.0) {
            -magnitude
        } else {
            magnitude
        };
        Self::new(scale, rotation, translate_x, translate_y)
    }

    /// Map a point from the canonical (model) frame into the image.
    pub fn apply(&self, p: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        Point::new(
            self.scale * (cos * p.x - sin * p.y) + self.translate_x,
            self.scale * (sin * p.x + cos * p.y) + self.translate_y,
        )
    }
}
