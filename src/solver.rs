//! Regularized parameter update: statistical prior, linear solve and clipping.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::params::{ParameterVector, NUM_RIGID};
use crate::shape_model::ShapeModel;

/// Nominal variance for modes excluded from the prior.
pub const FREE_MODE_VARIANCE: f64 = 1e7;

/// Precision used for modes with a non-positive eigenvalue; pins them at zero.
const PINNED_MODE_PRECISION: f64 = 1e12;

/// Diagonal Gaussian prior over the parameter vector.
///
/// Rigid entries carry no precision; shape entry `k` carries
/// `1 / eigenValue[k]`, or `1 / FREE_MODE_VARIANCE` for non-regularized modes.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPrior {
    precision: DVector<f64>,
}

impl GaussianPrior {
    pub fn from_model(model: &ShapeModel) -> Self {
        let mut precision = DVector::zeros(model.num_parameters());
        for (k, &ev) in model.eigen_values().iter().enumerate() {
            precision[NUM_RIGID + k] = if model.is_non_regularized(k) {
                1.0 / FREE_MODE_VARIANCE
            } else if ev > 0.0 {
                1.0 / ev
            } else {
                PINNED_MODE_PRECISION
            };
        }
        Self { precision }
    }

    /// Diagonal precision entries.
    pub fn precision(&self) -> &DVector<f64> {
        &self.precision
    }
}

/// Solve `(λ·Λ + JᵀWJ)·Δ = λ·Λ·p − JᵀW·v` for the parameter delta `Δ`.
///
/// `λ` is the annealing bandwidth, `Λ` the prior precision, `v` the stacked
/// per-landmark displacement targets and `W` the optional per-coordinate
/// weights (identity when `None`). The caller applies `p −= Δ`.
pub fn solve_update(
    jacobian: &DMatrix<f64>,
    targets: &DVector<f64>,
    prior: &GaussianPrior,
    bandwidth: f64,
    params: &ParameterVector,
    weights: Option<&DVector<f64>>,
) -> Result<DVector<f64>> {
    let n = params.len();
    debug_assert_eq!(jacobian.ncols(), n);
    debug_assert_eq!(jacobian.nrows(), targets.len());

    let current = DVector::from_column_slice(params.as_slice());
    let scaled_precision = prior.precision() * bandwidth;

    let weighted_jac = match weights {
        Some(w) => {
            let mut wj = jacobian.clone();
            for (mut row, &wi) in wj.row_iter_mut().zip(w.iter()) {
                row *= wi;
            }
            wj
        }
        None => jacobian.clone(),
    };

    let jt = jacobian.transpose();
    let mut lhs = &jt * &weighted_jac;
    for i in 0..n {
        lhs[(i, i)] += scaled_precision[i];
    }

    let weighted_targets = match weights {
        Some(w) => targets.component_mul(w),
        None => targets.clone(),
    };
    let rhs = scaled_precision.component_mul(&current) - &jt * weighted_targets;

    let delta = lhs.lu().solve(&rhs).ok_or(Error::SingularSystem)?;
    if delta.iter().all(|v| v.is_finite()) {
        Ok(delta)
    } else {
        Err(Error::SingularSystem)
    }
}

/// Clamp every shape coefficient into its `±3·sqrt(eigenValue)` box.
///
/// Coefficients outside the box are set to the signed bound; the rest of
/// the vector is left untouched.
pub fn clip_shape(params: &mut ParameterVector, eigen_values: &[f64]) {
    for (p, &ev) in params.shape_mut().iter_mut().zip(eigen_values.iter()) {
        let bound = (3.0 * ev.max(0.0).sqrt()).abs();
        if p.abs() > bound {
            *p = bound.copysign(*p);
        }
    }
}
