//! Variance-annealed fitting of the parameter vector to one frame's responses.

use nalgebra::DVector;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::jacobian::jacobian;
use crate::mean_shift::{mean_shift_displacement, ResponseSurface};
use crate::params::ParameterVector;
use crate::patch::PatchStack;
use crate::shape_model::ShapeModel;
use crate::solver::{clip_shape, solve_update, GaussianPrior};
use crate::types::{Point, Shape};

/// Where each landmark's response grid sits in the image.
///
/// The anchors are fixed for the whole frame, so every annealing step
/// searches the same window.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchGrid {
    pub origins: Vec<Point>,
    pub pixel_scale: f64,
}

impl SearchGrid {
    pub fn from_patches(stack: &PatchStack) -> Self {
        Self {
            origins: (0..stack.len()).map(|i| stack.search_origin(i)).collect(),
            pixel_scale: stack.pixel_scale(),
        }
    }

    /// Grids of side `search_window` centred on `anchors`.
    pub fn centred(anchors: &Shape, search_window: usize, pixel_scale: f64) -> Self {
        let half = (search_window as f64 - 1.0) * pixel_scale / 2.0;
        Self {
            origins: anchors
                .points
                .iter()
                .map(|p| Point::new(p.x - half, p.y - half))
                .collect(),
            pixel_scale,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitSettings<'a> {
    /// Bandwidths, coarse to fine.
    pub variance_schedule: &'a [f64],
    /// Stop once the summed squared landmark movement falls below this.
    pub convergence_limit: f64,
    /// Per-coordinate weights (`2N`), identity when `None`.
    pub weights: Option<&'a DVector<f64>>,
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub positions: Shape,
    /// Annealing steps that ran.
    pub iterations: usize,
    /// The last step moved the landmarks less than the convergence limit.
    pub converged: bool,
    /// A singular update system aborted the fit; parameters were restored.
    pub singular: bool,
}

/// Expand per-landmark weights to per-coordinate weights.
pub fn coordinate_weights(point_weights: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        point_weights.len() * 2,
        point_weights.iter().flat_map(|&w| [w, w]),
    )
}

/// Run the annealing schedule, updating `params` in place.
///
/// Each step rebuilds the Jacobian, takes one mean-shift step per landmark
/// at the step's bandwidth, solves the regularized update and clips the
/// shape coefficients. A singular system restores the parameters the fit
/// started from.
pub fn fit(
    model: &ShapeModel,
    prior: &GaussianPrior,
    params: &mut ParameterVector,
    responses: &[ResponseSurface],
    grid: &SearchGrid,
    settings: &FitSettings<'_>,
) -> Result<FitOutcome> {
    let num_landmarks = model.num_landmarks();
    if responses.len() != num_landmarks || grid.origins.len() != num_landmarks {
        return Err(Error::Scorer(format!(
            "{} responses and {} search grids for {} landmarks",
            responses.len(),
            grid.origins.len(),
            num_landmarks
        )));
    }

    let start = params.clone();
    let mut positions = model.positions(params, true);
    let mut outcome = FitOutcome {
        positions: positions.clone(),
        iterations: 0,
        converged: false,
        singular: false,
    };

    for &bandwidth in settings.variance_schedule {
        let jac = jacobian(model, params);

        let mut targets = DVector::zeros(2 * num_landmarks);
        for (i, response) in responses.iter().enumerate() {
            let current = positions[i];
            let mode = mean_shift_displacement(response, current, grid.origins[i], bandwidth, grid.pixel_scale);
            targets[2 * i] = mode.x - current.x;
            targets[2 * i + 1] = mode.y - current.y;
        }

        let delta = match solve_update(&jac, &targets, prior, bandwidth, params, settings.weights) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("Skipping update for this frame: {}", e);
                *params = start;
                outcome.positions = model.positions(params, true);
                outcome.singular = true;
                return Ok(outcome);
            }
        };

        for (p, d) in params.as_mut_slice().iter_mut().zip(delta.iter()) {
            *p -= d;
        }
        clip_shape(params, model.eigen_values());

        let updated = model.positions(params, true);
        let movement = updated.squared_displacement(&positions);
        positions = updated;
        outcome.iterations += 1;
        trace!(bandwidth, movement, "annealing step");

        if movement < settings.convergence_limit {
            outcome.converged = true;
            break;
        }
    }

    outcome.positions = positions;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape_model::tests::triangle_model;

    const SCHEDULE: [f64; 3] = [10.0, 5.0, 1.0];

    fn settings() -> FitSettings<'static> {
        FitSettings {
            variance_schedule: &SCHEDULE,
            convergence_limit: 0.01,
            weights: None,
        }
    }

    fn square_model() -> ShapeModel {
        ShapeModel::new(
            vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(0.0, 10.0),
                Point::new(10.0, 10.0),
            ],
            &vec![vec![]; 8],
            vec![],
            vec![],
        )
        .unwrap()
    }

    /// One sharp peak per landmark at `truth`, on grids anchored at `anchors`.
    fn peaked_responses(truth: &Shape, grid: &SearchGrid, size: usize) -> Vec<ResponseSurface> {
        truth
            .points
            .iter()
            .zip(&grid.origins)
            .map(|(t, o)| {
                let mut surface = ResponseSurface::zeros(size);
                let col = ((t.x - o.x) / grid.pixel_scale).round() as usize;
                let row = ((t.y - o.y) / grid.pixel_scale).round() as usize;
                surface.set(row, col, 1.0);
                surface
            })
            .collect()
    }

    #[test]
    fn recovers_translation_from_peaks() {
        let model = square_model();
        let prior = GaussianPrior::from_model(&model);

        let mut params = ParameterVector::from_values(vec![0.0, 0.0, 20.0, 20.0]);
        let truth = model.positions(&ParameterVector::from_values(vec![0.0, 0.0, 23.0, 17.0]), true);
        let grid = SearchGrid::centred(&model.positions(&params, true), 11, 1.0);
        let responses = peaked_responses(&truth, &grid, 11);

        let outcome = fit(&model, &prior, &mut params, &responses, &grid, &settings()).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 2);
        assert!((params[2] - 23.0).abs() < 1e-9);
        assert!((params[3] - 17.0).abs() < 1e-9);
        assert!(outcome.positions.squared_displacement(&truth) < 1e-12);
    }

    #[test]
    fn zero_responses_leave_parameters() {
        let model = square_model();
        let prior = GaussianPrior::from_model(&model);
        let mut params = ParameterVector::from_values(vec![0.1, 0.0, 5.0, 5.0]);
        let before = params.clone();
        let grid = SearchGrid::centred(&model.positions(&params, true), 5, 1.0);
        let responses = vec![ResponseSurface::zeros(5); 4];

        let outcome = fit(&model, &prior, &mut params, &responses, &grid, &settings()).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 1);
        for j in 0..4 {
            assert!((params[j] - before[j]).abs() < 1e-12);
        }
    }

    #[test]
    fn coefficients_stay_inside_three_sigma() {
        let model = triangle_model();
        let prior = GaussianPrior::from_model(&model);
        let mut params = ParameterVector::from_values(vec![9.0, 0.0, 50.0, 50.0, 0.0, 0.0]);

        // pull the apex far up and the base points apart
        let anchors = model.positions(&params, true);
        let grid = SearchGrid::centred(&anchors, 21, 1.0);
        let mut truth = anchors.clone();
        truth[0].x -= 10.0;
        truth[1].x += 10.0;
        truth[2].y -= 10.0;
        let responses = peaked_responses(&truth, &grid, 21);

        fit(&model, &prior, &mut params, &responses, &grid, &settings()).unwrap();
        for (p, ev) in params.shape().iter().zip(model.eigen_values()) {
            assert!(p.abs() <= 3.0 * ev.sqrt() + 1e-9, "{} exceeds bound for {}", p, ev);
        }
    }

    #[test]
    fn singular_system_restores_parameters() {
        let model = ShapeModel::new(
            vec![Point::new(0.0, 0.0), Point::new(0.0, 0.0)],
            &[vec![], vec![], vec![], vec![]],
            vec![],
            vec![],
        )
        .unwrap();
        let prior = GaussianPrior::from_model(&model);
        let mut params = ParameterVector::from_values(vec![0.0, 0.0, 3.0, 4.0]);
        let before = params.clone();
        let grid = SearchGrid::centred(&model.positions(&params, true), 3, 1.0);
        let mut response = ResponseSurface::zeros(3);
        response.set(0, 0, 1.0);

        let outcome = fit(&model, &prior, &mut params, &[response.clone(), response], &grid, &settings()).unwrap();
        assert!(outcome.singular);
        assert_eq!(params, before);
    }

    #[test]
    fn mismatched_responses_are_rejected() {
        let model = square_model();
        let prior = GaussianPrior::from_model(&model);
        let mut params = ParameterVector::zeros(0);
        let grid = SearchGrid::centred(&model.positions(&params, true), 3, 1.0);
        let result = fit(&model, &prior, &mut params, &[], &grid, &settings());
        assert!(result.is_err());
    }

    #[test]
    fn weights_expand_per_coordinate() {
        let w = coordinate_weights(&[1.0, 0.5]);
        assert_eq!(w.as_slice(), &[1.0, 1.0, 0.5, 0.5]);
    }
}
