//! Bootstrap: turn a face detection into an initial pose.
//!
//! A `PoseDetector` produces the rigid transform that places the mean shape
//! on the face. `FaceBootstrap` is the standard one: it finds a face box
//! (given, or via a `RegionDetector`), optionally refines it with anchor
//! points from an `AnchorLocator` and aligns the model's anchor hints onto
//! them. `DetectionWorker` runs any pose detector on its own thread so the
//! frame loop never waits on detection.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use rustface::ImageData;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{GrayImage, ImageAccess};
use crate::model::ClmModel;
use crate::params::RigidTransform;
use crate::procrustes;
use crate::types::{BoundingBox, Point};

/// Produces the initial pose for a frame.
pub trait PoseDetector {
    fn detect_initial_pose(&mut self, frame: &GrayImage, bbox: Option<BoundingBox>) -> Result<RigidTransform>;
}

/// Finds the face region in a frame.
pub trait RegionDetector {
    fn find_face(&mut self, frame: &GrayImage) -> Option<BoundingBox>;
}

/// Locates `[left eye, right eye, nose]` inside their search regions.
pub trait AnchorLocator {
    fn locate(&mut self, frame: &GrayImage, regions: &AnchorRegions) -> Option<[Point; 3]>;
}

/// Search windows for the anchor features of a detected face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorRegions {
    pub left_eye: BoundingBox,
    pub right_eye: BoundingBox,
    pub nose: BoundingBox,
}

impl AnchorRegions {
    pub fn from_face(face: &BoundingBox) -> Self {
        let square = |cx: f64, cy: f64, side: f64| BoundingBox::new(cx - side / 2.0, cy - side / 2.0, side, side);
        let (x, y, w, h) = (face.x, face.y, face.width, face.height);
        let eye = 0.6 * w;
        Self {
            left_eye: square(x + w / 4.0, y + 2.0 * h / 5.0, eye),
            right_eye: square(x + 3.0 * w / 4.0, y + 2.0 * h / 5.0, eye),
            nose: square(x + w / 2.0, y + 5.0 * h / 8.0, 0.45 * w),
        }
    }
}

/// Face box to pose, with optional anchor refinement.
pub struct FaceBootstrap {
    regions: Option<Box<dyn RegionDetector>>,
    anchors: Option<Box<dyn AnchorLocator>>,
    hints: Option<[Point; 3]>,
    mean_extent: BoundingBox,
}

impl FaceBootstrap {
    pub fn new(model: &ClmModel) -> Result<Self> {
        let mean_extent = model.shape_model()?.mean_extent();
        Ok(Self {
            regions: None,
            anchors: None,
            hints: model.hints.map(|h| h.anchors()),
            mean_extent,
        })
    }

    pub fn with_region_detector(mut self, detector: Box<dyn RegionDetector>) -> Self {
        self.regions = Some(detector);
        self
    }

    pub fn with_anchor_locator(mut self, locator: Box<dyn AnchorLocator>) -> Self {
        self.anchors = Some(locator);
        self
    }

    /// Place the mean shape in the face box without anchors.
    pub fn fallback_pose(&self, face: &BoundingBox) -> RigidTransform {
        let extent = &self.mean_extent;
        let scale = if extent.height > 0.0 {
            face.width / extent.height
        } else {
            1.0
        };
        RigidTransform::new(
            scale,
            0.0,
            face.x - extent.x * scale + 0.1 * face.width,
            face.y - extent.y * scale + 0.25 * face.height,
        )
    }
}

impl PoseDetector for FaceBootstrap {
    fn detect_initial_pose(&mut self, frame: &GrayImage, bbox: Option<BoundingBox>) -> Result<RigidTransform> {
        let face = match bbox {
            Some(face) => face,
            None => self
                .regions
                .as_mut()
                .and_then(|d| d.find_face(frame))
                .ok_or_else(|| Error::DetectionFailed("No face found".into()))?,
        };

        if let (Some(locator), Some(hints)) = (self.anchors.as_mut(), self.hints.as_ref()) {
            if let Some(found) = locator.locate(frame, &AnchorRegions::from_face(&face)) {
                debug!(?found, "anchors located");
                return procrustes::align(hints, &found);
            }
            debug!("Anchors not found, using face box placement");
        }

        Ok(self.fallback_pose(&face))
    }
}

/// `RegionDetector` backed by the SeetaFace cascade in `rustface`.
pub struct RustfaceDetector {
    detector: Box<dyn rustface::Detector>,
}

impl RustfaceDetector {
    pub fn from_path(path: &str, min_face_size: u32) -> Result<Self> {
        let mut detector = rustface::create_detector(path)
            .map_err(|e| Error::DetectionFailed(format!("Failed to load face detector: {}", e)))?;
        detector.set_min_face_size(min_face_size);
        detector.set_score_thresh(2.0);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);
        Ok(Self { detector })
    }
}

impl RegionDetector for RustfaceDetector {
    fn find_face(&mut self, frame: &GrayImage) -> Option<BoundingBox> {
        let image = ImageData::new(frame.as_raw(), frame.width(), frame.height());
        let faces = self.detector.detect(&image);
        debug!("Found {} face(s)", faces.len());

        faces
            .iter()
            .max_by(|a, b| a.score().total_cmp(&b.score()))
            .map(|face| {
                let bbox = face.bbox();
                BoundingBox::new(
                    bbox.x() as f64,
                    bbox.y() as f64,
                    bbox.width() as f64,
                    bbox.height() as f64,
                )
            })
    }
}

struct DetectionRequest {
    frame: GrayImage,
    bbox: Option<BoundingBox>,
}

/// A pose detector running on a dedicated thread.
///
/// The detector is built on the worker thread by `factory`, so it need not
/// be `Send`. At most one request is outstanding; results are collected by
/// polling.
pub struct DetectionWorker {
    requests: Sender<DetectionRequest>,
    results: Receiver<Result<RigidTransform>>,
    in_flight: bool,
    _handle: thread::JoinHandle<()>,
}

impl DetectionWorker {
    pub fn spawn<F, D>(factory: F) -> Self
    where
        F: FnOnce() -> Result<D> + Send + 'static,
        D: PoseDetector + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel::<DetectionRequest>();
        let (result_tx, result_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let mut detector = match factory() {
                Ok(detector) => Some(detector),
                Err(e) => {
                    warn!("Detector failed to start: {}", e);
                    None
                }
            };

            while let Ok(request) = request_rx.recv() {
                let result = match detector.as_mut() {
                    Some(d) => d.detect_initial_pose(&request.frame, request.bbox),
                    None => Err(Error::DetectionFailed("Detector unavailable".into())),
                };
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Self {
            requests: request_tx,
            results: result_rx,
            in_flight: false,
            _handle: handle,
        }
    }

    /// Submit a frame. Returns `false` while a previous request is pending.
    pub fn request(&mut self, frame: &GrayImage, bbox: Option<BoundingBox>) -> bool {
        if self.in_flight {
            return false;
        }
        let request = DetectionRequest {
            frame: frame.clone(),
            bbox,
        };
        if self.requests.send(request).is_err() {
            warn!("Detection worker has stopped");
            return false;
        }
        self.in_flight = true;
        true
    }

    /// The finished result, if the pending request has completed.
    pub fn poll(&mut self) -> Option<Result<RigidTransform>> {
        match self.results.try_recv() {
            Ok(result) => {
                self.in_flight = false;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                if self.in_flight {
                    self.in_flight = false;
                    Some(Err(Error::DetectionFailed("Detection worker has stopped".into())))
                } else {
                    None
                }
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClmModelBuilder, Hints};
    use std::time::{Duration, Instant};

    fn model() -> ClmModel {
        ClmModelBuilder::new()
            .mean_shape(vec![
                Point::new(2.0, 4.0),
                Point::new(12.0, 4.0),
                Point::new(7.0, 14.0),
            ])
            .hints(Hints {
                left_eye: [4.0, 6.0],
                right_eye: [10.0, 6.0],
                nose: [7.0, 10.0],
            })
            .build()
            .unwrap()
    }

    fn frame() -> GrayImage {
        GrayImage::from_fn(8, 8, |_, _| 128)
    }

    struct ScriptedRegion(Option<BoundingBox>);

    impl RegionDetector for ScriptedRegion {
        fn find_face(&mut self, _frame: &GrayImage) -> Option<BoundingBox> {
            self.0
        }
    }

    struct ScriptedAnchors(RigidTransform);

    impl AnchorLocator for ScriptedAnchors {
        fn locate(&mut self, _frame: &GrayImage, _regions: &AnchorRegions) -> Option<[Point; 3]> {
            let hints = model().hints.unwrap().anchors();
            Some(hints.map(|p| self.0.apply(p)))
        }
    }

    struct FixedPose(RigidTransform);

    impl PoseDetector for FixedPose {
        fn detect_initial_pose(&mut self, _frame: &GrayImage, _bbox: Option<BoundingBox>) -> Result<RigidTransform> {
            Ok(self.0)
        }
    }

    #[test]
    fn anchor_regions_geometry() {
        let regions = AnchorRegions::from_face(&BoundingBox::new(100.0, 50.0, 80.0, 96.0));
        assert!((regions.nose.center() - Point::new(140.0, 110.0)).norm() < 1e-9);
        assert!((regions.nose.width - 36.0).abs() < 1e-12);
        assert!((regions.left_eye.center() - Point::new(120.0, 88.4)).norm() < 1e-9);
        assert!((regions.right_eye.center() - Point::new(160.0, 88.4)).norm() < 1e-9);
        assert!((regions.left_eye.width - 48.0).abs() < 1e-12);
    }

    #[test]
    fn fallback_places_mean_shape_in_box() {
        let bootstrap = FaceBootstrap::new(&model()).unwrap();
        // mean extent: x 2..12, y 4..14, height 10
        let pose = bootstrap.fallback_pose(&BoundingBox::new(100.0, 200.0, 50.0, 60.0));
        assert!((pose.scale - 5.0).abs() < 1e-12);
        assert_eq!(pose.rotation, 0.0);
        assert!((pose.translate_x - (100.0 - 10.0 + 5.0)).abs() < 1e-12);
        assert!((pose.translate_y - (200.0 - 20.0 + 15.0)).abs() < 1e-12);
    }

    #[test]
    fn explicit_box_skips_region_detector() {
        let mut bootstrap = FaceBootstrap::new(&model())
            .unwrap()
            .with_region_detector(Box::new(ScriptedRegion(None)));
        let face = BoundingBox::new(10.0, 10.0, 40.0, 40.0);
        let pose = bootstrap.detect_initial_pose(&frame(), Some(face)).unwrap();
        assert_eq!(pose, bootstrap.fallback_pose(&face));
    }

    #[test]
    fn no_face_is_a_detection_failure() {
        let mut bootstrap = FaceBootstrap::new(&model())
            .unwrap()
            .with_region_detector(Box::new(ScriptedRegion(None)));
        assert!(matches!(
            bootstrap.detect_initial_pose(&frame(), None),
            Err(Error::DetectionFailed(_))
        ));

        let mut bare = FaceBootstrap::new(&model()).unwrap();
        assert!(bare.detect_initial_pose(&frame(), None).is_err());
    }

    #[test]
    fn anchors_are_aligned_onto_hints() {
        let truth = RigidTransform::new(3.0, 0.2, 40.0, -5.0);
        let mut bootstrap = FaceBootstrap::new(&model())
            .unwrap()
            .with_region_detector(Box::new(ScriptedRegion(Some(BoundingBox::new(0.0, 0.0, 50.0, 50.0)))))
            .with_anchor_locator(Box::new(ScriptedAnchors(truth)));

        let pose = bootstrap.detect_initial_pose(&frame(), None).unwrap();
        assert!((pose.scale - 3.0).abs() < 1e-9);
        assert!((pose.rotation - 0.2).abs() < 1e-9);
        assert!((pose.translate_x - 40.0).abs() < 1e-9);
        assert!((pose.translate_y + 5.0).abs() < 1e-9);
    }

    fn wait_for(worker: &mut DetectionWorker) -> Result<RigidTransform> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = worker.poll() {
                return result;
            }
            assert!(Instant::now() < deadline, "worker did not answer");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn worker_allows_one_request_in_flight() {
        let pose = RigidTransform::new(2.0, 0.0, 1.0, 1.0);
        let mut worker = DetectionWorker::spawn(move || Ok(FixedPose(pose)));

        assert!(worker.request(&frame(), None));
        assert!(worker.is_busy());
        assert!(!worker.request(&frame(), None));

        assert_eq!(wait_for(&mut worker).unwrap(), pose);
        assert!(!worker.is_busy());
        assert!(worker.request(&frame(), None));
        assert!(wait_for(&mut worker).is_ok());
    }

    #[test]
    fn worker_reports_factory_failure() {
        let mut worker = DetectionWorker::spawn(|| -> Result<FixedPose> {
            Err(Error::DetectionFailed("no model".into()))
        });
        assert!(worker.request(&frame(), None));
        assert!(matches!(wait_for(&mut worker), Err(Error::DetectionFailed(_))));
    }
}
