//! Tracking-quality check: a logistic classifier on a rectified face crop.

use crate::frame::{ImageAccess, Rectifier};
use crate::history::BoundedHistory;
use crate::model::ScoringModel;
use crate::params::RigidTransform;
use crate::patch::{logistic, standardize};
use crate::shape_model::ShapeModel;
use crate::types::{BoundingBox, Point};

/// Scores averaged before the check can fail.
pub const QUALITY_HISTORY: usize = 5;

/// Crop of the face in canonical coordinates, derived from the mean-shape
/// extent: trimmed at the sides, extended upward.
pub fn quality_region(extent: &BoundingBox) -> BoundingBox {
    let (w, h) = (extent.width, extent.height);
    BoundingBox::new(
        extent.x + w / 4.5,
        extent.y - h / 12.0,
        w - 2.0 * w / 4.5,
        h - h / 12.0,
    )
}

pub struct QualityScorer {
    coef: Vec<f64>,
    bias: f64,
    cols: usize,
    rows: usize,
    region: BoundingBox,
    threshold: f64,
    scores: BoundedHistory<f64>,
}

impl QualityScorer {
    pub fn new(scoring: &ScoringModel, shape: &ShapeModel, threshold: f64) -> Self {
        Self {
            coef: scoring.coef.clone(),
            bias: scoring.bias,
            cols: scoring.size[0],
            rows: scoring.size[1],
            region: quality_region(&shape.mean_extent()),
            threshold,
            scores: BoundedHistory::new(QUALITY_HISTORY),
        }
    }

    /// Classifier output for a row-major crop, or `None` for an all-black crop.
    pub fn score_crop(&self, pixels: &[f64]) -> Option<f64> {
        if pixels.iter().all(|&p| p <= 0.0) {
            return None;
        }
        let mut features: Vec<f64> = pixels.iter().map(|p| (1.0 + p).ln()).collect();
        standardize(&mut features);
        let dot: f64 = features.iter().zip(&self.coef).map(|(f, w)| f * w).sum();
        Some(logistic(dot + self.bias))
    }

    /// Resample the crop under `pose` and score it.
    pub fn score_frame<I: ImageAccess + ?Sized>(&self, image: &I, pose: RigidTransform) -> Option<f64> {
        let step = Point::new(
            self.region.width / self.cols as f64,
            self.region.height / self.rows as f64,
        );
        let pixels = Rectifier::new(image, pose).grid(
            Point::new(self.region.x, self.region.y),
            step,
            self.cols,
            self.rows,
        );
        self.score_crop(&pixels)
    }

    /// Score the frame, record it and report whether tracking still holds.
    ///
    /// Fails only once `QUALITY_HISTORY` scores exist and their mean is
    /// below the threshold.
    pub fn check<I: ImageAccess + ?Sized>(&mut self, image: &I, pose: RigidTransform) -> bool {
        if let Some(score) = self.score_frame(image, pose) {
            self.scores.push(score);
        }
        self.mean_score().map_or(true, |mean| mean >= self.threshold)
    }

    /// Mean of the last `QUALITY_HISTORY` scores once that many exist.
    pub fn mean_score(&self) -> Option<f64> {
        if !self.scores.is_full() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }

    pub fn num_scores(&self) -> usize {
        self.scores.len()
    }

    pub fn reset(&mut self) {
        self.scores.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::GrayImage;

    fn square_shape() -> ShapeModel {
        ShapeModel::new(
            vec![
                Point::new(0.0, 0.0),
                Point::new(18.0, 0.0),
                Point::new(0.0, 24.0),
                Point::new(18.0, 24.0),
            ],
            &vec![vec![]; 8],
            vec![],
            vec![],
        )
        .unwrap()
    }

    fn scorer(bias: f64) -> QualityScorer {
        let scoring = ScoringModel {
            size: [20, 22],
            coef: vec![0.0; 20 * 22],
            bias,
        };
        QualityScorer::new(&scoring, &square_shape(), 0.5)
    }

    fn textured_frame() -> GrayImage {
        GrayImage::from_fn(64, 64, |x, y| ((x * 7 + y * 3) % 200 + 20) as u8)
    }

    #[test]
    fn crop_geometry() {
        let region = quality_region(&BoundingBox::new(0.0, 0.0, 18.0, 24.0));
        assert!((region.x - 4.0).abs() < 1e-12);
        assert!((region.y + 2.0).abs() < 1e-12);
        assert!((region.width - 10.0).abs() < 1e-12);
        assert!((region.height - 22.0).abs() < 1e-12);
    }

    #[test]
    fn low_scores_fail_after_full_history() {
        let mut quality = scorer(-5.0);
        let frame = textured_frame();
        let pose = RigidTransform::new(1.0, 0.0, 20.0, 20.0);

        for _ in 0..QUALITY_HISTORY - 1 {
            assert!(quality.check(&frame, pose));
        }
        assert!(!quality.check(&frame, pose));
        assert!(quality.mean_score().unwrap() < 0.01);
    }

    #[test]
    fn confident_scores_pass() {
        let mut quality = scorer(5.0);
        let frame = textured_frame();
        let pose = RigidTransform::new(1.0, 0.0, 20.0, 20.0);
        for _ in 0..10 {
            assert!(quality.check(&frame, pose));
        }
        assert_eq!(quality.num_scores(), QUALITY_HISTORY);
    }

    #[test]
    fn black_crop_is_skipped() {
        let mut quality = scorer(-5.0);
        let frame = GrayImage::from_fn(64, 64, |_, _| 0);
        for _ in 0..10 {
            assert!(quality.check(&frame, RigidTransform::identity()));
        }
        assert_eq!(quality.num_scores(), 0);
    }

    #[test]
    fn score_uses_standardized_log_intensity() {
        let scoring = ScoringModel {
            size: [2, 1],
            coef: vec![-1.0, 1.0],
            bias: 0.0,
        };
        let quality = QualityScorer::new(&scoring, &square_shape(), 0.5);

        // standardized log values are (−1, 1), so the dot product is 2
        let score = quality.score_crop(&[10.0, 100.0]).unwrap();
        assert!((score - logistic(2.0)).abs() < 1e-12);

        // flat crop: zero variance gives zero features
        let flat = quality.score_crop(&[50.0, 50.0]).unwrap();
        assert!((flat - 0.5).abs() < 1e-12);
    }

    #[test]
    fn reset_clears_scores() {
        let mut quality = scorer(-5.0);
        let frame = textured_frame();
        quality.check(&frame, RigidTransform::identity());
        quality.reset();
        assert_eq!(quality.num_scores(), 0);
    }
}
