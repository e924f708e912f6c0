//! # clm-tracker
//!
//! Pure Rust face tracking with constrained local models.
//!
//! This crate provides:
//! - **Shape Model**: mean shape plus a PCA basis, with a 2D similarity pose
//! - **Patch Scoring**: per-landmark SVM or correlation-filter responses
//! - **Fitting**: regularized landmark mean-shift with variance annealing
//! - **Session**: bootstrap from a face detection, frame-to-frame tracking,
//!   tracking-loss detection and recovery
//!
//! ## Algorithm Overview
//!
//! 1. Detect the face once and align the mean shape onto it
//! 2. For each frame:
//!    - Predict the pose from the last two frames (constant velocity)
//!    - Sample an upright patch around every predicted landmark
//!    - Score each patch into a response surface
//!    - For each bandwidth of the annealing schedule, take one mean-shift
//!      step per landmark and solve for the parameter update under the
//!      shape prior, clipping shape coefficients to three sigma
//! 3. Every few frames score the face crop and reset when tracking is lost
//!
//! ## Quick Start
//!
//! ```rust
//! use clm_tracker::{
//!     ClmModelBuilder, FrameSequence, GrayImage, Point, ResponseKind, Tracker, TrackerConfig,
//! };
//!
//! let model = ClmModelBuilder::new()
//!     .mean_shape(vec![
//!         Point::new(0.0, 0.0),
//!         Point::new(20.0, 0.0),
//!         Point::new(10.0, 20.0),
//!     ])
//!     .filters(ResponseKind::Raw, 5, vec![vec![0.04; 25]; 3], vec![0.0; 3])
//!     .build()
//!     .unwrap();
//!
//! let config = TrackerConfig {
//!     background_detection: false,
//!     ..TrackerConfig::default()
//! };
//! let mut tracker = Tracker::new(config);
//! tracker.initialize(model).unwrap();
//!
//! let frame = GrayImage::from_fn(320, 240, |x, y| ((x + y) % 256) as u8);
//! let face = clm_tracker::BoundingBox::new(100.0, 60.0, 80.0, 100.0);
//! assert!(tracker.start(Box::new(FrameSequence::new(vec![frame])), Some(face)));
//!
//! while tracker.is_running() {
//!     tracker.run_frame();
//! }
//! if let Some(shape) = tracker.current_positions() {
//!     println!("Tracked {} landmarks", shape.num_landmarks());
//! }
//! ```
//!
//! ## Custom Image Types
//!
//! Implement the [`ImageAccess`] trait to sample your own image types:
//!
//! ```rust
//! use clm_tracker::ImageAccess;
//!
//! struct MyImage { /* ... */ }
//!
//! impl ImageAccess for MyImage {
//!     fn get_pixel(&self, x: i32, y: i32) -> u8 {
//!         // Return grayscale intensity at (x, y)
//!         // Return 0 for out-of-bounds
//!         0
//!     }
//!     fn width(&self) -> u32 { 640 }
//!     fn height(&self) -> u32 { 480 }
//! }
//! ```

mod config;
mod detector;
mod error;
pub mod fitting;
mod frame;
mod history;
pub mod jacobian;
pub mod mean_shift;
mod model;
mod params;
mod patch;
pub mod procrustes;
mod quality;
mod shape_model;
pub mod solver;
mod tracker;
mod types;

pub use config::TrackerConfig;
pub use detector::{
    AnchorLocator, AnchorRegions, DetectionWorker, FaceBootstrap, PoseDetector, RegionDetector,
    RustfaceDetector,
};
pub use error::{Error, Result};
pub use fitting::{FitOutcome, FitSettings, SearchGrid};
pub use frame::{sample_bilinear, FrameSequence, FrameSource, GrayImage, ImageAccess, Rectifier};
pub use history::{convergence_measure, BoundedHistory, PARAMETER_HISTORY, POSITION_HISTORY};
pub use mean_shift::{mean_shift_displacement, ResponseSurface};
pub use model::{
    ClmModel, ClmModelBuilder, FilterSet, Hints, PatchModel, PatchType, ResponseKind, ScoringModel,
    ShapeModelData,
};
pub use params::{ParameterVector, RigidTransform, NUM_RIGID};
pub use patch::{
    lbp_map, scorer_for_model, sobel_map, CorrelationPatchScorer, Patch, PatchScorer, PatchStack,
    ResponseMode, SvmPatchScorer,
};
pub use quality::{quality_region, QualityScorer, QUALITY_HISTORY};
pub use shape_model::ShapeModel;
pub use solver::GaussianPrior;
pub use tracker::{Detection, FrameOutcome, Tracker, TrackingState};
pub use types::{BoundingBox, Point, Shape};
