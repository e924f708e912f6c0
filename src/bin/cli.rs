//! CLI application for tracking face landmarks across a sequence of frames.
//!
//! Usage:
//!   clm-track --model model.json --frames frames/ --bbox 120,80,160,160
//!   clm-track --model model.json --frames frames/ --detector seeta_fd_frontal_v1.0.bin --json
//!   clm-track --model model.bin.bz2 --frames frames/ --config tracker.toml -o track.json

use clap::Parser;
use clm_tracker::{
    BoundingBox, ClmModel, Detection, DetectionWorker, FaceBootstrap, FrameOutcome, FrameSource,
    GrayImage, RustfaceDetector, Tracker, TrackerConfig,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "clm-track")]
#[command(author, version, about = "Track face landmarks through a sequence of frames", long_about = None)]
struct Args {
    /// Model file (.json, or binary .bin / .bin.bz2)
    #[arg(long)]
    model: PathBuf,

    /// Directory of frames, tracked in file-name order
    #[arg(long)]
    frames: PathBuf,

    /// Tracker config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Face box in the first frame as x,y,w,h
    #[arg(long, value_parser = parse_bbox)]
    bbox: Option<BoundingBox>,

    /// SeetaFace detector model for finding the face
    #[arg(long)]
    detector: Option<PathBuf>,

    /// Minimum face size for detection
    #[arg(long, default_value = "20")]
    min_face_size: u32,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Output {
    model: String,
    frames_tracked: usize,
    frames: Vec<FrameOutput>,
}

#[derive(Serialize)]
struct FrameOutput {
    /// Frame index (0-based)
    index: usize,
    file: String,
    status: &'static str,
    converged: bool,
    landmarks: Option<Vec<[f64; 2]>>,
}

/// Frames loaded lazily from image files.
struct ImageFiles {
    paths: VecDeque<PathBuf>,
    current: Option<PathBuf>,
}

impl ImageFiles {
    fn open(dir: &Path) -> std::io::Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        Ok(Self {
            paths: paths.into(),
            current: None,
        })
    }
}

impl FrameSource for ImageFiles {
    fn next_frame(&mut self) -> Option<GrayImage> {
        while let Some(path) = self.paths.pop_front() {
            match image::open(&path) {
                Ok(img) => {
                    self.current = Some(path);
                    return Some(GrayImage::from(img.to_luma8()));
                }
                Err(e) => warn!("Skipping {:?}: {}", path, e),
            }
        }
        None
    }
}

/// Shares the file name of the frame being tracked with the report loop.
struct SharedFiles(std::rc::Rc<std::cell::RefCell<ImageFiles>>);

impl FrameSource for SharedFiles {
    fn next_frame(&mut self) -> Option<GrayImage> {
        self.0.borrow_mut().next_frame()
    }
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("Invalid number {:?}: {}", v, e)))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        &[x, y, w, h] if w > 0.0 && h > 0.0 => Ok(BoundingBox::new(x, y, w, h)),
        _ => Err("Expected x,y,w,h with positive width and height".to_string()),
    }
}

fn load_model(path: &Path) -> clm_tracker::Result<ClmModel> {
    if path.extension().is_some_and(|ext| ext == "json") {
        ClmModel::from_json_path(path)
    } else {
        ClmModel::load(path)
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };

    info!("Loading model from {:?}...", args.model);
    let model = load_model(&args.model)?;

    let mut tracker = Tracker::new(config.clone());

    if let Some(detector_path) = &args.detector {
        let detector_path = detector_path.to_str().ok_or("Invalid detector path")?.to_string();
        let min_face_size = args.min_face_size;
        let bootstrap_model = model.clone();
        let build = move || -> clm_tracker::Result<FaceBootstrap> {
            let regions = RustfaceDetector::from_path(&detector_path, min_face_size)?;
            Ok(FaceBootstrap::new(&bootstrap_model)?.with_region_detector(Box::new(regions)))
        };
        let detection = if config.background_detection {
            Detection::Background(DetectionWorker::spawn(build))
        } else {
            Detection::Inline(Box::new(build()?))
        };
        tracker.set_detection(detection);
    } else if args.bbox.is_none() {
        warn!("Neither --bbox nor --detector given; the face cannot be found");
    }

    tracker.initialize(model)?;

    let files = std::rc::Rc::new(std::cell::RefCell::new(ImageFiles::open(&args.frames)?));
    info!("Tracking {} frame(s)", files.borrow().paths.len());
    if !tracker.start(Box::new(SharedFiles(files.clone())), args.bbox) {
        return Err("Tracker failed to start".into());
    }

    let mut frames = Vec::new();
    while tracker.is_running() {
        let Some(outcome) = tracker.run_frame() else {
            break;
        };
        let file = files
            .borrow()
            .current
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let (status, converged, landmarks) = match outcome {
            FrameOutcome::Tracked { positions, converged } => (
                "tracked",
                converged,
                Some(positions.points.iter().map(|p| [p.x, p.y]).collect()),
            ),
            FrameOutcome::Seeking => ("seeking", false, None),
            FrameOutcome::Skipped => (
                "skipped",
                false,
                tracker
                    .current_positions()
                    .map(|s| s.points.iter().map(|p| [p.x, p.y]).collect()),
            ),
            FrameOutcome::Lost => ("lost", false, None),
        };

        frames.push(FrameOutput {
            index: frames.len(),
            file,
            status,
            converged,
            landmarks,
        });
    }

    let output = Output {
        model: args.model.display().to_string(),
        frames_tracked: frames.iter().filter(|f| f.status == "tracked").count(),
        frames,
    };

    let output_str = if args.json {
        serde_json::to_string_pretty(&output)?
    } else {
        format_human_readable(&output)
    };

    if let Some(ref path) = args.output {
        std::fs::write(path, &output_str)?;
        info!("Output written to {:?}", path);
    } else {
        println!("{}", output_str);
    }

    Ok(())
}

fn format_human_readable(output: &Output) -> String {
    let mut s = String::new();

    s.push_str(&format!("Model: {}\n", output.model));
    s.push_str(&format!(
        "Frames tracked: {} of {}\n",
        output.frames_tracked,
        output.frames.len()
    ));

    for frame in &output.frames {
        s.push_str(&format!("\n--- Frame {} ({}) ---\n", frame.index, frame.file));
        s.push_str(&format!("Status: {}", frame.status));
        if frame.converged {
            s.push_str(" (converged)");
        }
        s.push('\n');
        if let Some(landmarks) = &frame.landmarks {
            for (i, p) in landmarks.iter().enumerate() {
                s.push_str(&format!("  {:>3}: ({:.1}, {:.1})\n", i, p[0], p[1]));
            }
        }
    }

    s
}
