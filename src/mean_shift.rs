//! Kernel-density mode estimate over one landmark's response surface.

use crate::types::Point;

/// Square grid of non-negative appearance scores, row-major.
///
/// Cell `(k, l)` is row `k`, column `l`; higher scores mean a more
/// plausible appearance match at that offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSurface {
    size: usize,
    values: Vec<f64>,
}

impl ResponseSurface {
    pub fn new(size: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), size * size);
        Self { size, values }
    }

    pub fn zeros(size: usize) -> Self {
        Self::new(size, vec![0.0; size * size])
    }

    /// Side length of the grid.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.size + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.values[row * self.size + col] = value;
    }

    /// Raise every score to `exponent` to sharpen peaks.
    pub fn sharpen(&mut self, exponent: f64) {
        for v in &mut self.values {
            *v = v.powf(exponent);
        }
    }
}

/// One weighted-centroid step toward the local response mode.
///
/// Cell `(k, l)` sits at `origin + (l, k)·pixel_scale` in the image. Its
/// weight is `response[k, l] · exp(−0.5·‖current − p‖² / (bandwidth·pixel_scale))`
/// and the result is the weighted centroid of the cell positions. An
/// all-zero (or underflowing) weight sum returns `current` unchanged.
pub fn mean_shift_displacement(
    response: &ResponseSurface,
    current: Point,
    origin: Point,
    bandwidth: f64,
    pixel_scale: f64,
) -> Point {
    let size = response.size();
    let denom = bandwidth * pixel_scale;

    let mut weight_sum = 0.0;
    let mut weighted = Point::zero();

    for k in 0..size {
        let py = origin.y + k as f64 * pixel_scale;
        for l in 0..size {
            let px = origin.x + l as f64 * pixel_scale;
            let dx = current.x - px;
            let dy = current.y - py;
            let weight = response.get(k, l) * (-0.5 * (dx * dx + dy * dy) / denom).exp();

            weight_sum += weight;
            weighted.x += weight * px;
            weighted.y += weight * py;
        }
    }

    if weight_sum > 0.0 && weight_sum.is_finite() {
        weighted * (1.0 / weight_sum)
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_response_does_not_move() {
        let response = ResponseSurface::zeros(11);
        let current = Point::new(40.0, 52.5);
        let origin = Point::new(35.0, 47.5);

        let target = mean_shift_displacement(&response, current, origin, 10.0, 1.0);
        assert_eq!(target, current);
        assert!(!target.x.is_nan() && !target.y.is_nan());
    }

    #[test]
    fn single_peak_pulls_to_peak() {
        let mut response = ResponseSurface::zeros(11);
        response.set(2, 7, 1.0);
        let origin = Point::new(100.0, 200.0);
        let current = Point::new(105.0, 205.0);

        let target = mean_shift_displacement(&response, current, origin, 5.0, 2.0);
        assert!((target.x - 114.0).abs() < 1e-12);
        assert!((target.y - 204.0).abs() < 1e-12);
    }

    #[test]
    fn symmetric_peaks_balance() {
        let mut response = ResponseSurface::zeros(5);
        response.set(2, 0, 1.0);
        response.set(2, 4, 1.0);
        let origin = Point::new(0.0, 0.0);
        let current = Point::new(2.0, 2.0);

        let target = mean_shift_displacement(&response, current, origin, 1.0, 1.0);
        assert!((target.x - 2.0).abs() < 1e-12);
        assert!((target.y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn kernel_prefers_peaks_near_current_estimate() {
        let mut response = ResponseSurface::zeros(11);
        response.set(5, 1, 1.0);
        response.set(5, 9, 1.0);
        let origin = Point::new(0.0, 0.0);
        let current = Point::new(8.0, 5.0);

        let narrow = mean_shift_displacement(&response, current, origin, 1.0, 1.0);
        let wide = mean_shift_displacement(&response, current, origin, 100.0, 1.0);
        assert!(narrow.x > wide.x);
        assert!(narrow.x > 8.5);
    }

    #[test]
    fn sharpen_raises_to_exponent() {
        let mut response = ResponseSurface::new(2, vec![0.5, 1.0, 0.0, 0.25]);
        response.sharpen(2.0);
        assert_eq!(response.values(), &[0.25, 1.0, 0.0, 0.0625]);
    }
}
