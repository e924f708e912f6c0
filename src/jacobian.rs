use nalgebra::DMatrix;

use crate::params::{ParameterVector, NUM_RIGID};
use crate::shape_model::ShapeModel;

/// Partial derivatives of every landmark position with respect to every parameter.
///
/// Returns a `2N × (4 + K)` matrix; rows `2i` and `2i + 1` belong to the x
/// and y coordinate of landmark `i`. The forward transform is affine in each
/// parameter block, so the derivatives are exact at `params`.
pub fn jacobian(model: &ShapeModel, params: &ParameterVector) -> DMatrix<f64> {
    let num_landmarks = model.num_landmarks();
    let num_modes = model.num_modes();
    let basis = model.eigen_vectors();
    let (a, b) = (params.a(), params.b());

    let mut jac = DMatrix::zeros(2 * num_landmarks, NUM_RIGID + num_modes);

    for i in 0..num_landmarks {
        let (rx, ry) = (2 * i, 2 * i + 1);
        let p = model.shape_point(i, params.shape());

        // d/da
        jac[(rx, 0)] = p.x;
        jac[(ry, 0)] = p.y;
        // d/db
        jac[(rx, 1)] = -p.y;
        jac[(ry, 1)] = p.x;
        // d/dtx, d/dty
        jac[(rx, 2)] = 1.0;
        jac[(ry, 3)] = 1.0;

        for k in 0..num_modes {
            let ex = basis[(rx, k)];
            let ey = basis[(ry, k)];
            jac[(rx, NUM_RIGID + k)] = a * ex - b * ey + ex;
            jac[(ry, NUM_RIGID + k)] = a * ey + b * ex + ey;
        }
    }

    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape_model::tests::triangle_model;

    #[test]
    fn dimensions() {
        let model = triangle_model();
        let jac = jacobian(&model, &ParameterVector::zeros(2));
        assert_eq!(jac.nrows(), 6);
        assert_eq!(jac.ncols(), 6);
    }

    #[test]
    fn matches_finite_differences() {
        let model = triangle_model();
        let params = ParameterVector::from_values(vec![0.3, -0.2, 5.0, -1.0, 0.4, 0.9]);
        let jac = jacobian(&model, &params);

        let h = 1e-6;
        for col in 0..params.len() {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus.as_mut_slice()[col] += h;
            minus.as_mut_slice()[col] -= h;

            let fp = model.positions(&plus, true).to_flat_vec();
            let fm = model.positions(&minus, true).to_flat_vec();
            for row in 0..fp.len() {
                let numeric = (fp[row] - fm[row]) / (2.0 * h);
                assert!(
                    (numeric - jac[(row, col)]).abs() < 1e-6,
                    "row {} col {}: {} vs {}",
                    row,
                    col,
                    numeric,
                    jac[(row, col)]
                );
            }
        }
    }
}
