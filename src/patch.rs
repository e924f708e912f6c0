//! Patch extraction around predicted landmarks and appearance scoring.
//!
//! Patches are sampled in the canonical frame: the rigid part of the
//! parameter vector is undone while sampling, so filters always see an
//! upright face at model scale.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{ImageAccess, Rectifier};
use crate::mean_shift::ResponseSurface;
use crate::model::{ClmModel, PatchType, ResponseKind};
use crate::params::ParameterVector;
use crate::shape_model::ShapeModel;
use crate::types::Point;

impl PatchType {
    /// Side length of the patch a scorer needs for one landmark.
    pub fn span(&self, patch_size: usize, search_window: usize) -> usize {
        match self {
            PatchType::Svm => patch_size + search_window - 1,
            PatchType::Correlation => search_window,
        }
    }
}

/// How multiple SVM feature maps combine into one response per landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Only the first configured kind.
    #[default]
    Single,
    /// One kind per call, rotating.
    Cycle,
    /// Per-cell mean over every kind.
    Blend,
}

/// One landmark's patch.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Row-major `span × span` intensities.
    pub pixels: Vec<f64>,
    /// Image position the patch is centred on.
    pub center: Point,
}

/// Patches for every landmark of one frame plus the geometry needed to
/// map response cells back into the image.
#[derive(Debug, Clone)]
pub struct PatchStack {
    patch_type: PatchType,
    span: usize,
    search_window: usize,
    pixel_scale: f64,
    patches: Vec<Patch>,
}

impl PatchStack {
    /// Sample one patch per landmark at the positions implied by `params`.
    pub fn extract<I: ImageAccess + ?Sized>(
        image: &I,
        model: &ShapeModel,
        params: &ParameterVector,
        patch_type: PatchType,
        patch_size: usize,
        search_window: usize,
    ) -> Self {
        let span = patch_type.span(patch_size, search_window);
        let rigid = params.rigid();
        let rectifier = Rectifier::new(image, rigid);

        let half = (span as f64 - 1.0) / 2.0;
        let canonical = model.positions(params, false);
        let placed = model.positions(params, true);

        let patches = canonical
            .points
            .iter()
            .zip(placed.points.iter())
            .map(|(c, &center)| Patch {
                pixels: rectifier.grid(Point::new(c.x - half, c.y - half), Point::new(1.0, 1.0), span, span),
                center,
            })
            .collect();

        Self {
            patch_type,
            span,
            search_window,
            pixel_scale: rigid.scale.abs(),
            patches,
        }
    }

    /// Assemble a stack from already-sampled patches.
    pub fn from_patches(
        patch_type: PatchType,
        span: usize,
        search_window: usize,
        pixel_scale: f64,
        patches: Vec<Patch>,
    ) -> Self {
        Self {
            patch_type,
            span,
            search_window,
            pixel_scale,
            patches,
        }
    }

    pub fn patch_type(&self) -> PatchType {
        self.patch_type
    }

    pub fn span(&self) -> usize {
        self.span
    }

    pub fn search_window(&self) -> usize {
        self.search_window
    }

    /// Image pixels per canonical unit.
    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Image position of response cell `(0, 0)` for landmark `i`.
    pub fn search_origin(&self, i: usize) -> Point {
        let half = (self.search_window as f64 - 1.0) * self.pixel_scale / 2.0;
        let c = self.patches[i].center;
        Point::new(c.x - half, c.y - half)
    }
}

/// Turns patches into one response surface per landmark.
///
/// Implementations may keep internal state (GPU buffers, a cycling
/// counter); one scorer belongs to one tracker.
pub trait PatchScorer {
    fn score(&mut self, patches: &PatchStack) -> Result<Vec<ResponseSurface>>;
}

/// Pick the CPU scorer matching the model's patch type.
pub fn scorer_for_model(
    model: &ClmModel,
    kinds: &[ResponseKind],
    mode: ResponseMode,
) -> Result<Box<dyn PatchScorer>> {
    match model.patch_model.patch_type {
        PatchType::Svm => Ok(Box::new(SvmPatchScorer::from_model(model, kinds, mode)?)),
        PatchType::Correlation => Ok(Box::new(CorrelationPatchScorer::from_model(model)?)),
    }
}

pub(crate) fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Rescale to `[0, 1]`; a constant input becomes all ones.
pub(crate) fn normalize_unit_range(values: &mut [f64]) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    for v in values.iter_mut() {
        *v = if range > 0.0 { (*v - min) / range } else { 1.0 };
    }
}

/// Zero mean, unit variance. A constant input becomes all zeros.
pub(crate) fn standardize(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let sd = var.sqrt();
    for v in values.iter_mut() {
        *v = if sd > 0.0 { (*v - mean) / sd } else { 0.0 };
    }
}

fn clamped(pixels: &[f64], span: usize, row: isize, col: isize) -> f64 {
    let last = span as isize - 1;
    let r = row.clamp(0, last) as usize;
    let c = col.clamp(0, last) as usize;
    pixels[r * span + c]
}

/// Sobel gradient magnitude; borders replicate the edge pixel.
pub fn sobel_map(pixels: &[f64], span: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(pixels.len());
    for row in 0..span as isize {
        for col in 0..span as isize {
            let at = |dr: isize, dc: isize| clamped(pixels, span, row + dr, col + dc);
            let dx = (at(1, -1) + 2.0 * at(0, -1) + at(-1, -1) - at(1, 1) - 2.0 * at(0, 1) - at(-1, 1)) / 4.0;
            let dy = (at(-1, -1) + 2.0 * at(-1, 0) + at(-1, 1) - at(1, -1) - 2.0 * at(1, 0) - at(1, 1)) / 4.0;
            out.push((dx * dx + dy * dy).sqrt());
        }
    }
    out
}

/// 8-neighbour local binary pattern codes; a bit is set when the
/// neighbour is at least as bright as the centre.
pub fn lbp_map(pixels: &[f64], span: usize) -> Vec<f64> {
    // (row offset, col offset, bit)
    const NEIGHBOURS: [(isize, isize, u8); 8] = [
        (0, 1, 1),
        (-1, 1, 2),
        (-1, 0, 4),
        (-1, -1, 8),
        (0, -1, 16),
        (1, -1, 32),
        (1, 0, 64),
        (1, 1, 128),
    ];

    let mut out = Vec::with_capacity(pixels.len());
    for row in 0..span as isize {
        for col in 0..span as isize {
            let mid = clamped(pixels, span, row, col);
            let code = NEIGHBOURS
                .iter()
                .filter(|(dr, dc, _)| clamped(pixels, span, row + dr, col + dc) >= mid)
                .fold(0u8, |acc, &(_, _, bit)| acc | bit);
            out.push(code as f64);
        }
    }
    out
}

struct FilterBank {
    kind: ResponseKind,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

/// CPU scorer for linear SVM patch filters.
pub struct SvmPatchScorer {
    patch_size: usize,
    banks: Vec<FilterBank>,
    mode: ResponseMode,
    tick: usize,
}

impl SvmPatchScorer {
    /// Collect the filters for `kinds` from the model.
    pub fn from_model(model: &ClmModel, kinds: &[ResponseKind], mode: ResponseMode) -> Result<Self> {
        if kinds.is_empty() {
            return Err(Error::Scorer("No response kinds configured".into()));
        }

        let patch = &model.patch_model;
        let banks = kinds
            .iter()
            .map(|&kind| {
                let weights = patch
                    .weights
                    .get(kind)
                    .ok_or_else(|| Error::Scorer(format!("Model has no {:?} filters", kind)))?;
                let bias = patch
                    .bias
                    .get(kind)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; weights.len()]);
                Ok(FilterBank {
                    kind,
                    weights: weights.clone(),
                    bias,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_size: model.patch_size(),
            banks,
            mode,
            tick: 0,
        })
    }

    pub fn kinds(&self) -> Vec<ResponseKind> {
        self.banks.iter().map(|b| b.kind).collect()
    }

    fn score_bank(&self, bank: &FilterBank, stack: &PatchStack) -> Result<Vec<ResponseSurface>> {
        if bank.weights.len() != stack.len() {
            return Err(Error::Scorer(format!(
                "{} patches for {} filters",
                stack.len(),
                bank.weights.len()
            )));
        }
        let span = stack.span();
        let size = self.patch_size;
        if span < size {
            return Err(Error::Scorer(format!(
                "Patch span {} smaller than filter size {}",
                span, size
            )));
        }
        let grid = span - size + 1;

        let mut surfaces = Vec::with_capacity(stack.len());
        for (i, patch) in stack.patches().iter().enumerate() {
            let features = match bank.kind {
                ResponseKind::Raw => patch.pixels.clone(),
                ResponseKind::Sobel => sobel_map(&patch.pixels, span),
                ResponseKind::Lbp => lbp_map(&patch.pixels, span),
            };
            let filter = &bank.weights[i];
            let bias = bank.bias.get(i).copied().unwrap_or(0.0);

            let mut values = Vec::with_capacity(grid * grid);
            for k in 0..grid {
                for l in 0..grid {
                    let mut dot = 0.0;
                    let mut weight_sum = 0.0;
                    let mut min = f64::INFINITY;
                    let mut max = f64::NEG_INFINITY;
                    for u in 0..size {
                        for v in 0..size {
                            let p = features[(k + u) * span + l + v];
                            let w = filter[u * size + v];
                            dot += p * w;
                            weight_sum += w;
                            min = min.min(p);
                            max = max.max(p);
                        }
                    }
                    let range = max - min;
                    let response = if range > 0.0 {
                        (dot - min * weight_sum) / range
                    } else {
                        0.0
                    };
                    // 1 / (1 + (1 − r) / (r·e^bias)) with r = logistic(response)
                    values.push(logistic(response + bias));
                }
            }
            normalize_unit_range(&mut values);
            surfaces.push(ResponseSurface::new(grid, values));
        }
        Ok(surfaces)
    }
}

impl PatchScorer for SvmPatchScorer {
    fn score(&mut self, patches: &PatchStack) -> Result<Vec<ResponseSurface>> {
        match self.mode {
            ResponseMode::Single => self.score_bank(&self.banks[0], patches),
            ResponseMode::Cycle => {
                let bank = &self.banks[self.tick % self.banks.len()];
                let surfaces = self.score_bank(bank, patches)?;
                self.tick = self.tick.wrapping_add(1);
                Ok(surfaces)
            }
            ResponseMode::Blend => {
                let mut blended = self.score_bank(&self.banks[0], patches)?;
                for bank in &self.banks[1..] {
                    let next = self.score_bank(bank, patches)?;
                    for (acc, surface) in blended.iter_mut().zip(next) {
                        for (a, v) in acc.values_mut().iter_mut().zip(surface.values()) {
                            *a += v;
                        }
                    }
                }
                let n = self.banks.len() as f64;
                for surface in &mut blended {
                    surface.values_mut().iter_mut().for_each(|v| *v /= n);
                }
                Ok(blended)
            }
        }
    }
}

/// CPU scorer for correlation filters: the patch is log-scaled and
/// standardized, then cross-correlated with the filter centred on every
/// cell (zero padded).
pub struct CorrelationPatchScorer {
    patch_size: usize,
    filters: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl CorrelationPatchScorer {
    pub fn from_model(model: &ClmModel) -> Result<Self> {
        let patch = &model.patch_model;
        let filters = patch
            .weights
            .raw
            .clone()
            .ok_or_else(|| Error::Scorer("Model has no correlation filters".into()))?;
        let bias = patch.bias.raw.clone().unwrap_or_else(|| vec![0.0; filters.len()]);
        Ok(Self {
            patch_size: model.patch_size(),
            filters,
            bias,
        })
    }
}

impl PatchScorer for CorrelationPatchScorer {
    fn score(&mut self, stack: &PatchStack) -> Result<Vec<ResponseSurface>> {
        if self.filters.len() != stack.len() {
            return Err(Error::Scorer(format!(
                "{} patches for {} filters",
                stack.len(),
                self.filters.len()
            )));
        }
        let span = stack.span() as isize;
        let size = self.patch_size as isize;
        let half = (size - 1) / 2;

        let mut surfaces = Vec::with_capacity(stack.len());
        for (i, patch) in stack.patches().iter().enumerate() {
            let mut pixels: Vec<f64> = patch.pixels.iter().map(|p| (1.0 + p).ln()).collect();
            standardize(&mut pixels);

            let filter = &self.filters[i];
            let bias = self.bias.get(i).copied().unwrap_or(0.0);
            let mut values = Vec::with_capacity((span * span) as usize);
            for k in 0..span {
                for l in 0..span {
                    let mut sum = bias;
                    for u in 0..size {
                        let r = k + u - half;
                        if r < 0 || r >= span {
                            continue;
                        }
                        for v in 0..size {
                            let c = l + v - half;
                            if c < 0 || c >= span {
                                continue;
                            }
                            sum += filter[(u * size + v) as usize] * pixels[(r * span + c) as usize];
                        }
                    }
                    values.push(sum);
                }
            }
            normalize_unit_range(&mut values);
            surfaces.push(ResponseSurface::new(span as usize, values));
        }
        Ok(surfaces)
    }
}
