use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::ResponseKind;
use crate::patch::ResponseMode;

/// Tracker tuning. Every field is optional in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Side of the response grid searched around each landmark.
    #[serde(default = "default_search_window")]
    pub search_window: usize,
    /// Mean quality score below which tracking counts as lost.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default)]
    pub stop_on_convergence: bool,
    /// Exponent applied to every response; 0 disables sharpening.
    #[serde(default)]
    pub sharpen_response: f64,
    #[serde(default = "default_max_iterations_per_frame")]
    pub max_iterations_per_frame: usize,
    /// Wall-clock budget of one driver tick.
    #[serde(default = "default_frame_budget_ms")]
    pub frame_budget_ms: u64,
    #[serde(default = "default_true")]
    pub constant_velocity: bool,
    #[serde(default = "default_relaxation")]
    pub relaxation: f64,
    /// Annealing bandwidths, coarse to fine.
    #[serde(default = "default_variance_schedule")]
    pub variance_schedule: Vec<f64>,
    /// Inner-loop early stop on summed squared landmark movement.
    #[serde(default = "default_convergence_limit")]
    pub convergence_limit: f64,
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Frames between tracking-quality checks.
    #[serde(default = "default_quality_check_interval")]
    pub quality_check_interval: usize,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default = "default_response_kinds")]
    pub response_kinds: Vec<ResponseKind>,
    /// Per-landmark weights for the update solve, indexed by landmark.
    #[serde(default)]
    pub point_weights: Option<Vec<f64>>,
    /// Run face detection on a worker thread.
    #[serde(default = "default_true")]
    pub background_detection: bool,
}

fn default_search_window() -> usize { 11 }
fn default_score_threshold() -> f64 { 0.5 }
fn default_max_iterations_per_frame() -> usize { 3 }
fn default_frame_budget_ms() -> u64 { 16 }
fn default_true() -> bool { true }
fn default_relaxation() -> f64 { 0.1 }
fn default_variance_schedule() -> Vec<f64> { vec![10.0, 5.0, 1.0] }
fn default_convergence_limit() -> f64 { 0.01 }
fn default_convergence_threshold() -> f64 { 0.5 }
fn default_quality_check_interval() -> usize { 10 }
fn default_response_kinds() -> Vec<ResponseKind> { vec![ResponseKind::Raw] }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            search_window: default_search_window(),
            score_threshold: default_score_threshold(),
            stop_on_convergence: false,
            sharpen_response: 0.0,
            max_iterations_per_frame: default_max_iterations_per_frame(),
            frame_budget_ms: default_frame_budget_ms(),
            constant_velocity: true,
            relaxation: default_relaxation(),
            variance_schedule: default_variance_schedule(),
            convergence_limit: default_convergence_limit(),
            convergence_threshold: default_convergence_threshold(),
            quality_check_interval: default_quality_check_interval(),
            response_mode: ResponseMode::default(),
            response_kinds: default_response_kinds(),
            point_weights: None,
            background_detection: true,
        }
    }
}

impl TrackerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TrackerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search_window == 0 || self.search_window % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "search_window must be odd, got {}",
                self.search_window
            )));
        }
        if self.variance_schedule.is_empty() || self.variance_schedule.iter().any(|&v| v <= 0.0) {
            return Err(Error::InvalidConfig(
                "variance_schedule must hold positive bandwidths".into(),
            ));
        }
        if self.quality_check_interval == 0 {
            return Err(Error::InvalidConfig("quality_check_interval must be at least 1".into()));
        }
        if self.response_kinds.is_empty() {
            return Err(Error::InvalidConfig("response_kinds must not be empty".into()));
        }
        Ok(())
    }
}
