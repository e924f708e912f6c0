use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::params::ParameterVector;
use crate::types::{BoundingBox, Point, Shape};

/// Point distribution model: mean shape plus a linear PCA basis.
///
/// Rows of the basis are the interleaved `x, y` coordinates of the
/// landmarks; column `k` is mode `k`. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ShapeModel {
    mean_shape: Vec<Point>,
    eigen_vectors: DMatrix<f64>,
    eigen_values: Vec<f64>,
    non_regularized: Vec<usize>,
}

impl ShapeModel {
    /// Build a shape model, checking that every dimension agrees.
    ///
    /// `eigen_vectors` holds `2N` rows of `K` values each.
    pub fn new(
        mean_shape: Vec<Point>,
        eigen_vectors: &[Vec<f64>],
        eigen_values: Vec<f64>,
        non_regularized: Vec<usize>,
    ) -> Result<Self> {
        let num_landmarks = mean_shape.len();
        let num_modes = eigen_values.len();

        if num_landmarks == 0 {
            return Err(Error::InvalidModel("Mean shape has no landmarks".into()));
        }
        if eigen_vectors.len() != num_landmarks * 2 {
            return Err(Error::InvalidModel(format!(
                "Shape basis has {} rows, expected {}",
                eigen_vectors.len(),
                num_landmarks * 2
            )));
        }
        if num_modes > num_landmarks * 2 {
            return Err(Error::InvalidModel(format!(
                "{} shape modes exceed {} coordinates",
                num_modes,
                num_landmarks * 2
            )));
        }
        if let Some(row) = eigen_vectors.iter().position(|r| r.len() < num_modes) {
            return Err(Error::InvalidModel(format!(
                "Shape basis row {} has fewer than {} modes",
                row, num_modes
            )));
        }
        if let Some(&k) = non_regularized.iter().find(|&&k| k >= num_modes) {
            return Err(Error::InvalidModel(format!(
                "Non-regularized mode {} out of range for {} modes",
                k, num_modes
            )));
        }

        let basis = DMatrix::from_fn(num_landmarks * 2, num_modes, |r, c| eigen_vectors[r][c]);

        Ok(Self {
            mean_shape,
            eigen_vectors: basis,
            eigen_values,
            non_regularized,
        })
    }

    pub fn num_landmarks(&self) -> usize {
        self.mean_shape.len()
    }

    pub fn num_modes(&self) -> usize {
        self.eigen_values.len()
    }

    /// Length of a parameter vector for this model.
    pub fn num_parameters(&self) -> usize {
        crate::params::NUM_RIGID + self.num_modes()
    }

    pub fn mean_shape(&self) -> &[Point] {
        &self.mean_shape
    }

    pub fn eigen_vectors(&self) -> &DMatrix<f64> {
        &self.eigen_vectors
    }

    pub fn eigen_values(&self) -> &[f64] {
        &self.eigen_values
    }

    /// Whether mode `k` is excluded from the statistical prior.
    pub fn is_non_regularized(&self, k: usize) -> bool {
        self.non_regularized.contains(&k)
    }

    /// Axis-aligned extent of the mean shape.
    pub fn mean_extent(&self) -> BoundingBox {
        // `new` rejects empty mean shapes.
        BoundingBox::enclosing(&self.mean_shape).unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0))
    }

    /// Landmark `i` in shape space: mean plus the weighted basis columns.
    pub fn shape_point(&self, i: usize, coefficients: &[f64]) -> Point {
        let mut p = self.mean_shape[i];
        for (k, &c) in coefficients.iter().enumerate() {
            p.x += self.eigen_vectors[(2 * i, k)] * c;
            p.y += self.eigen_vectors[(2 * i + 1, k)] * c;
        }
        p
    }

    /// Landmark positions for `params`.
    ///
    /// With `apply_rigid` the similarity transform is added as a delta to
    /// the shape-space point: `x' = a·x − b·y + tx + x`,
    /// `y' = a·y + b·x + ty + y`. Otherwise the shape-space points are
    /// returned unchanged.
    pub fn positions(&self, params: &ParameterVector, apply_rigid: bool) -> Shape {
        let coefficients = params.shape();
        let (a, b) = (params.a(), params.b());
        let t = params.translation();

        let mut shape = Shape::with_capacity(self.num_landmarks());
        for i in 0..self.num_landmarks() {
            let p = self.shape_point(i, coefficients);
            if apply_rigid {
                shape.points.push(Point::new(
                    a * p.x - b * p.y + t.x + p.x,
                    a * p.y + b * p.x + t.y + p.y,
                ));
            } else {
                shape.points.push(p);
            }
        }
        shape
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::RigidTransform;

    /// Three landmarks, two modes: mode 0 stretches along x, mode 1 moves landmark 2 in y.
    pub(crate) fn triangle_model() -> ShapeModel {
        ShapeModel::new(
            vec![
                Point::new(-1.0, 0.0),
                Point::new(1.0, 0.0),
                Point::new(0.0, 2.0),
            ],
            &[
                vec![-0.5, 0.0],
                vec![0.0, 0.0],
                vec![0.5, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 1.0],
            ],
            vec![4.0, 1.0],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn zero_parameters_give_mean_shape() {
        let model = triangle_model();
        let params = ParameterVector::zeros(2);
        let shape = model.positions(&params, true);
        assert_eq!(shape.points, model.mean_shape());
    }

    #[test]
    fn positions_are_pure() {
        let model = triangle_model();
        let params = ParameterVector::from_values(vec![0.2, -0.1, 3.0, 4.0, 0.7, -1.3]);
        let first = model.positions(&params, true);
        let _ = model.positions(&ParameterVector::zeros(2), false);
        let second = model.positions(&params, true);
        assert_eq!(first, second);
    }

    #[test]
    fn shape_coefficients_move_landmarks() {
        let model = triangle_model();
        let params = ParameterVector::from_values(vec![0.0, 0.0, 0.0, 0.0, 2.0, 0.5]);
        let shape = model.positions(&params, false);
        assert!((shape[0].x - (-2.0)).abs() < 1e-12);
        assert!((shape[1].x - 2.0).abs() < 1e-12);
        assert!((shape[2].y - 2.5).abs() < 1e-12);
    }

    #[test]
    fn rigid_part_matches_similarity_transform() {
        let model = triangle_model();
        let pose = RigidTransform::new(1.5, 0.6, -4.0, 9.0);
        let params = ParameterVector::from_pose(&pose, 2);
        let shape = model.positions(&params, true);
        for (p, m) in shape.points.iter().zip(model.mean_shape()) {
            assert!((*p - pose.apply(*m)).norm() < 1e-12);
        }
    }

    #[test]
    fn rejects_mismatched_basis() {
        let err = ShapeModel::new(
            vec![Point::new(0.0, 0.0)],
            &[vec![1.0]],
            vec![1.0],
            vec![],
        );
        assert!(err.is_err());

        let err = ShapeModel::new(
            vec![Point::new(0.0, 0.0)],
            &[vec![1.0], vec![0.0]],
            vec![1.0],
            vec![3],
        );
        assert!(err.is_err());
    }

    #[test]
    fn mean_extent_covers_every_landmark() {
        let model = triangle_model();
        let extent = model.mean_extent();
        assert_eq!(extent, BoundingBox::new(-1.0, 0.0, 2.0, 2.0));
    }
}
