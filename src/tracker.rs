//! The tracking session: bootstrap, per-frame fitting and loss recovery.

use std::time::{Duration, Instant};

use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::detector::{DetectionWorker, FaceBootstrap, PoseDetector};
use crate::error::{Error, Result};
use crate::fitting::{self, coordinate_weights, FitSettings, SearchGrid};
use crate::frame::{FrameSource, GrayImage};
use crate::history::{convergence_measure, BoundedHistory, PARAMETER_HISTORY, POSITION_HISTORY};
use crate::model::ClmModel;
use crate::params::{ParameterVector, RigidTransform};
use crate::patch::{scorer_for_model, PatchScorer, PatchStack};
use crate::quality::{QualityScorer, QUALITY_HISTORY};
use crate::shape_model::ShapeModel;
use crate::solver::GaussianPrior;
use crate::types::{BoundingBox, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// No model loaded.
    Uninitialized,
    /// Waiting for a detection to bootstrap from.
    Seeking,
    Tracking,
    /// The quality check failed on the last frame; the next frame seeks again.
    Lost,
}

/// Result of one tracking step.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No pose yet; detection is pending or failed.
    Seeking,
    Tracked { positions: Shape, converged: bool },
    /// The frame could not be fitted; the previous estimate is kept.
    Skipped,
    /// The quality check failed and the session was reset.
    Lost,
}

/// How bootstrap detection runs.
pub enum Detection {
    /// Blocking call on the tracking thread.
    Inline(Box<dyn PoseDetector>),
    /// Polled from a worker thread.
    Background(DetectionWorker),
}

struct Engine {
    model: ClmModel,
    shape: ShapeModel,
    prior: GaussianPrior,
    scorer: Box<dyn PatchScorer>,
    quality: Option<QualityScorer>,
    weights: Option<DVector<f64>>,
}

/// One face-tracking session.
///
/// # Usage
///
/// ```ignore
/// let mut tracker = Tracker::new(TrackerConfig::default());
/// tracker.initialize(ClmModel::from_json_path("model.json")?)?;
/// tracker.start(Box::new(frames), None);
/// while tracker.is_running() {
///     tracker.run_frame();
///     if let Some(shape) = tracker.current_positions() {
///         println!("{:?}", shape.points);
///     }
/// }
/// ```
pub struct Tracker {
    config: TrackerConfig,
    engine: Option<Engine>,
    detection: Option<Detection>,
    state: TrackingState,
    source: Option<Box<dyn FrameSource>>,
    bbox: Option<BoundingBox>,
    running: bool,
    params: Option<ParameterVector>,
    positions: Option<Shape>,
    param_history: BoundedHistory<ParameterVector>,
    position_history: BoundedHistory<Shape>,
    frame_count: usize,
    converged: bool,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            engine: None,
            detection: None,
            state: TrackingState::Uninitialized,
            source: None,
            bbox: None,
            running: false,
            params: None,
            positions: None,
            param_history: BoundedHistory::new(PARAMETER_HISTORY),
            position_history: BoundedHistory::new(POSITION_HISTORY),
            frame_count: 0,
            converged: false,
        }
    }

    /// Load the model and build the CPU patch scorer for it.
    ///
    /// A second call is a no-op.
    pub fn initialize(&mut self, model: ClmModel) -> Result<()> {
        if self.engine.is_some() {
            debug!("Tracker already initialized");
            return Ok(());
        }
        let scorer = scorer_for_model(&model, &self.config.response_kinds, self.config.response_mode)?;
        self.initialize_with_scorer(model, scorer)
    }

    /// Load the model with a caller-supplied patch scorer.
    ///
    /// A second call is a no-op.
    pub fn initialize_with_scorer(&mut self, model: ClmModel, scorer: Box<dyn PatchScorer>) -> Result<()> {
        if self.engine.is_some() {
            debug!("Tracker already initialized");
            return Ok(());
        }
        self.config.validate()?;
        model.validate()?;

        let shape = model.shape_model()?;
        let weights = match &self.config.point_weights {
            Some(w) if w.len() != shape.num_landmarks() => {
                return Err(Error::InvalidConfig(format!(
                    "{} point weights for {} landmarks",
                    w.len(),
                    shape.num_landmarks()
                )));
            }
            Some(w) => Some(coordinate_weights(w)),
            None => None,
        };
        let quality = model
            .scoring
            .as_ref()
            .map(|s| QualityScorer::new(s, &shape, self.config.score_threshold));

        if self.detection.is_none() {
            self.detection = Some(if self.config.background_detection {
                let bootstrap_model = model.clone();
                Detection::Background(DetectionWorker::spawn(move || FaceBootstrap::new(&bootstrap_model)))
            } else {
                Detection::Inline(Box::new(FaceBootstrap::new(&model)?))
            });
        }

        info!(
            landmarks = shape.num_landmarks(),
            modes = shape.num_modes(),
            quality_check = quality.is_some(),
            "Tracker initialized"
        );

        self.engine = Some(Engine {
            prior: GaussianPrior::from_model(&shape),
            shape,
            model,
            scorer,
            quality,
            weights,
        });
        self.state = TrackingState::Seeking;
        Ok(())
    }

    /// Replace the bootstrap detector.
    pub fn set_detection(&mut self, detection: Detection) {
        self.detection = Some(detection);
    }

    /// Replace the patch scorer of an initialized tracker.
    pub fn set_patch_scorer(&mut self, scorer: Box<dyn PatchScorer>) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(Error::NotInitialized)?;
        engine.scorer = scorer;
        Ok(())
    }

    /// Begin tracking frames from `source`. Returns `false` when no model
    /// has been loaded.
    pub fn start(&mut self, source: Box<dyn FrameSource>, bbox: Option<BoundingBox>) -> bool {
        if self.engine.is_none() {
            warn!("{}", Error::NotInitialized);
            return false;
        }
        self.reset_tracking();
        self.source = Some(source);
        self.bbox = bbox;
        self.running = true;
        true
    }

    /// Stop scheduling further steps. A step in progress is not interrupted.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Landmark positions of the last fitted frame.
    pub fn current_positions(&self) -> Option<&Shape> {
        self.positions.as_ref()
    }

    pub fn current_parameters(&self) -> Option<&ParameterVector> {
        self.params.as_ref()
    }

    /// Whether the position history has settled.
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Time-boxed driver: fetch one frame and run fitting steps on it until
    /// the frame budget or the step limit is reached.
    ///
    /// Stops early when a step does not produce positions. Returns the last
    /// step's outcome, or `None` when not running or the source is
    /// exhausted.
    pub fn run_frame(&mut self) -> Option<FrameOutcome> {
        if !self.running {
            return None;
        }
        let Some(frame) = self.source.as_mut().and_then(|s| s.next_frame()) else {
            info!("Frame source exhausted");
            self.running = false;
            return None;
        };

        let budget = Duration::from_millis(self.config.frame_budget_ms);
        let started = Instant::now();
        let mut last = None;

        for _ in 0..self.config.max_iterations_per_frame.max(1) {
            let outcome = match self.track(&frame) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Tracking stopped: {}", e);
                    self.running = false;
                    return None;
                }
            };
            let tracked = matches!(outcome, FrameOutcome::Tracked { .. });
            last = Some(outcome);

            if !tracked {
                break;
            }
            if self.config.stop_on_convergence && self.converged {
                info!("Tracking converged, stopping");
                self.stop();
                break;
            }
            if started.elapsed() >= budget {
                break;
            }
        }
        last
    }

    /// One tracking step on `frame`.
    ///
    /// Only a missing model is an error; detection failures, skipped
    /// updates and tracking loss are reported as outcomes.
    pub fn track(&mut self, frame: &GrayImage) -> Result<FrameOutcome> {
        if self.engine.is_none() {
            return Err(Error::NotInitialized);
        }

        if self.params.is_none() {
            let Some(pose) = self.bootstrap(frame) else {
                self.state = TrackingState::Seeking;
                return Ok(FrameOutcome::Seeking);
            };
            self.begin_tracking(pose);
        }

        let engine = self.engine.as_mut().ok_or(Error::NotInitialized)?;
        let Some(current) = self.params.as_ref() else {
            return Ok(FrameOutcome::Seeking);
        };

        let mut params = match (self.param_history.get(0), self.param_history.get(1)) {
            (Some(prev), Some(last)) if self.config.constant_velocity => {
                ParameterVector::extrapolate(prev, last, self.config.relaxation)
            }
            _ => current.clone(),
        };

        let patch_model = &engine.model.patch_model;
        let stack = PatchStack::extract(
            frame,
            &engine.shape,
            &params,
            patch_model.patch_type,
            engine.model.patch_size(),
            self.config.search_window,
        );

        self.frame_count += 1;
        if let Some(quality) = engine.quality.as_mut() {
            if self.frame_count % self.config.quality_check_interval == 0 && !quality.check(frame, params.rigid()) {
                info!(
                    mean_score = quality.mean_score(),
                    "Tracking lost, seeking a new face"
                );
                self.reset_tracking();
                self.state = TrackingState::Lost;
                return Ok(FrameOutcome::Lost);
            }
        }

        let mut responses = match engine.scorer.score(&stack) {
            Ok(responses) => responses,
            Err(e) => {
                warn!("Patch scoring failed: {}", e);
                return Ok(FrameOutcome::Skipped);
            }
        };
        if self.config.sharpen_response > 0.0 {
            for response in &mut responses {
                response.sharpen(self.config.sharpen_response);
            }
        }

        let settings = FitSettings {
            variance_schedule: &self.config.variance_schedule,
            convergence_limit: self.config.convergence_limit,
            weights: engine.weights.as_ref(),
        };
        let grid = SearchGrid::from_patches(&stack);
        let fit = match fitting::fit(&engine.shape, &engine.prior, &mut params, &responses, &grid, &settings) {
            Ok(fit) if !fit.singular => fit,
            Ok(_) => return Ok(FrameOutcome::Skipped),
            Err(e) => {
                warn!("Fit failed: {}", e);
                return Ok(FrameOutcome::Skipped);
            }
        };

        self.param_history.push(params.clone());
        self.position_history.push(fit.positions.clone());

        let enough_scores = engine
            .quality
            .as_ref()
            .map_or(true, |q| q.num_scores() >= QUALITY_HISTORY);
        let measure = convergence_measure(&self.position_history);
        self.converged = enough_scores && measure.is_some_and(|m| m < self.config.convergence_threshold);

        debug!(
            frame = self.frame_count,
            iterations = fit.iterations,
            inner_converged = fit.converged,
            converged = self.converged,
            "Fitted frame"
        );

        self.params = Some(params);
        self.positions = Some(fit.positions.clone());
        self.state = TrackingState::Tracking;

        Ok(FrameOutcome::Tracked {
            positions: fit.positions,
            converged: self.converged,
        })
    }

    fn bootstrap(&mut self, frame: &GrayImage) -> Option<RigidTransform> {
        let bbox = self.bbox;
        match self.detection.as_mut()? {
            Detection::Inline(detector) => match detector.detect_initial_pose(frame, bbox) {
                Ok(pose) => Some(pose),
                Err(e) => {
                    debug!("Detection failed, retrying next frame: {}", e);
                    None
                }
            },
            Detection::Background(worker) => {
                match worker.poll() {
                    Some(Ok(pose)) => return Some(pose),
                    Some(Err(e)) => debug!("Detection failed, retrying: {}", e),
                    None => {}
                }
                if !worker.is_busy() {
                    worker.request(frame, bbox);
                }
                None
            }
        }
    }

    fn begin_tracking(&mut self, pose: RigidTransform) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        let params = ParameterVector::from_pose(&pose, engine.shape.num_modes());
        info!(
            scale = pose.scale,
            rotation = pose.rotation,
            x = pose.translate_x,
            y = pose.translate_y,
            "Face found, tracking"
        );
        self.positions = Some(engine.shape.positions(&params, true));
        self.params = Some(params);
        self.param_history.clear();
        self.position_history.clear();
        self.state = TrackingState::Tracking;
    }

    /// Forget the current face: parameters, positions and every history.
    fn reset_tracking(&mut self) {
        self.params = None;
        self.positions = None;
        self.param_history.clear();
        self.position_history.clear();
        self.frame_count = 0;
        self.converged = false;
        if let Some(engine) = self.engine.as_mut() {
            if let Some(quality) = engine.quality.as_mut() {
                quality.reset();
            }
        }
        if self.state != TrackingState::Uninitialized {
            self.state = TrackingState::Seeking;
        }
    }
}
