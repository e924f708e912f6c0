use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shape_model::ShapeModel;
use crate::types::Point;

/// A trained constrained local model.
///
/// The JSON layout (camelCase keys) matches the model files the tracker
/// has always shipped with:
///
/// ```json
/// { "shapeModel": {...}, "patchModel": {...}, "scoring": {...}, "hints": {...} }
/// ```
///
/// # Usage
///
/// ```ignore
/// let model = ClmModel::from_json_path("pca_20_svm.json")?;
/// let shape = model.shape_model()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClmModel {
    pub shape_model: ShapeModelData,
    pub patch_model: PatchModel,
    /// Linear classifier for the tracking-quality check.
    #[serde(default)]
    pub scoring: Option<ScoringModel>,
    /// Anchor positions (eyes and nose) in mean-shape coordinates.
    #[serde(default)]
    pub hints: Option<Hints>,
}

/// Serialized point distribution model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeModelData {
    /// `N` landmarks as `[x, y]`.
    pub mean_shape: Vec<[f64; 2]>,
    /// `2N` rows of `K` basis values, interleaved x/y.
    pub eigen_vectors: Vec<Vec<f64>>,
    pub eigen_values: Vec<f64>,
    pub num_evalues: usize,
    /// Modes left out of the statistical prior.
    #[serde(default)]
    pub non_regularized_vectors: Vec<usize>,
}

/// Which appearance model produced the patch weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    /// Linear SVM filters scored over a `patchSize + searchWindow − 1` patch.
    #[serde(rename = "SVM")]
    Svm,
    /// Correlation filters scored over a `searchWindow` patch.
    #[serde(rename = "CORR", alias = "MOSSE")]
    Correlation,
}

/// Feature map a set of SVM filters was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Raw,
    Sobel,
    Lbp,
}

/// Per-feature-map filters, one row-major `patchSize²` filter per landmark.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSet<T> {
    #[serde(default)]
    pub raw: Option<T>,
    #[serde(default)]
    pub sobel: Option<T>,
    #[serde(default)]
    pub lbp: Option<T>,
}

impl<T> FilterSet<T> {
    pub fn get(&self, kind: ResponseKind) -> Option<&T> {
        match kind {
            ResponseKind::Raw => self.raw.as_ref(),
            ResponseKind::Sobel => self.sobel.as_ref(),
            ResponseKind::Lbp => self.lbp.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchModel {
    pub patch_type: PatchType,
    pub num_patches: usize,
    /// Filter size `[width, height]`; filters are square.
    pub patch_size: [usize; 2],
    /// Working canvas size `[width, height]` in model units.
    #[serde(default)]
    pub canvas_size: [usize; 2],
    #[serde(default)]
    pub weights: FilterSet<Vec<Vec<f64>>>,
    #[serde(default)]
    pub bias: FilterSet<Vec<f64>>,
}

/// Logistic classifier scoring a rectified crop of the face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringModel {
    /// Crop size `[width, height]`.
    pub size: [usize; 2],
    pub coef: Vec<f64>,
    pub bias: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hints {
    pub left_eye: [f64; 2],
    pub right_eye: [f64; 2],
    pub nose: [f64; 2],
}

impl Hints {
    /// Anchors in `[left eye, right eye, nose]` order.
    pub fn anchors(&self) -> [Point; 3] {
        [
            Point::from(self.left_eye),
            Point::from(self.right_eye),
            Point::from(self.nose),
        ]
    }
}

impl ClmModel {
    /// Load a model from the JSON layout.
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = serde_json::from_reader(reader)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    /// Load a model from a binary file, bzip2-decoding `.bz2` files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);

        let mut bytes = Vec::new();
        if path.extension().is_some_and(|ext| ext == "bz2") {
            BzDecoder::new(reader).read_to_end(&mut bytes)?;
        } else {
            let mut reader = reader;
            reader.read_to_end(&mut bytes)?;
        }

        let model: Self = bincode::deserialize(&bytes)?;
        model.validate()?;
        Ok(model)
    }

    /// Save the model to a binary file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let bytes = bincode::serialize(self)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    pub fn num_landmarks(&self) -> usize {
        self.shape_model.mean_shape.len()
    }

    pub fn num_modes(&self) -> usize {
        self.shape_model.num_evalues
    }

    /// Filter side length.
    pub fn patch_size(&self) -> usize {
        self.patch_model.patch_size[0]
    }

    /// Build the runtime shape model.
    pub fn shape_model(&self) -> Result<ShapeModel> {
        let data = &self.shape_model;
        let eigen_values = data.eigen_values.get(..data.num_evalues).ok_or_else(|| {
            Error::InvalidModel(format!(
                "numEvalues {} exceeds {} eigenvalues",
                data.num_evalues,
                data.eigen_values.len()
            ))
        })?;
        ShapeModel::new(
            data.mean_shape.iter().copied().map(Point::from).collect(),
            &data.eigen_vectors,
            eigen_values.to_vec(),
            data.non_regularized_vectors.clone(),
        )
    }

    /// Check cross-section consistency of the model.
    pub fn validate(&self) -> Result<()> {
        let shape = &self.shape_model;
        let patch = &self.patch_model;

        if patch.num_patches != shape.mean_shape.len() {
            return Err(Error::InvalidModel(format!(
                "{} patches for {} landmarks",
                patch.num_patches,
                shape.mean_shape.len()
            )));
        }

        let [w, h] = patch.patch_size;
        if w != h || w % 2 == 0 {
            return Err(Error::InvalidModel(format!(
                "Filters must be square with odd size, got {}x{}",
                w, h
            )));
        }

        for kind in [ResponseKind::Raw, ResponseKind::Sobel, ResponseKind::Lbp] {
            let Some(filters) = patch.weights.get(kind) else {
                continue;
            };
            if filters.len() != patch.num_patches || filters.iter().any(|f| f.len() != w * h) {
                return Err(Error::InvalidModel(format!(
                    "{:?} filters must be {} vectors of {} weights",
                    kind,
                    patch.num_patches,
                    w * h
                )));
            }
            if let Some(bias) = patch.bias.get(kind) {
                if bias.len() != patch.num_patches {
                    return Err(Error::InvalidModel(format!(
                        "{:?} bias must have {} entries",
                        kind, patch.num_patches
                    )));
                }
            }
        }

        if let Some(scoring) = &self.scoring {
            if scoring.coef.len() != scoring.size[0] * scoring.size[1] {
                return Err(Error::InvalidModel(format!(
                    "Scoring weights hold {} values for a {}x{} crop",
                    scoring.coef.len(),
                    scoring.size[0],
                    scoring.size[1]
                )));
            }
        }

        self.shape_model().map(|_| ())
    }
}

/// Builder for assembling a model in code.
pub struct ClmModelBuilder {
    mean_shape: Option<Vec<Point>>,
    eigen_vectors: Vec<Vec<f64>>,
    eigen_values: Vec<f64>,
    non_regularized: Vec<usize>,
    patch_type: PatchType,
    patch_size: usize,
    weights: FilterSet<Vec<Vec<f64>>>,
    bias: FilterSet<Vec<f64>>,
    scoring: Option<ScoringModel>,
    hints: Option<Hints>,
}

impl ClmModelBuilder {
    pub fn new() -> Self {
        Self {
            mean_shape: None,
            eigen_vectors: Vec::new(),
            eigen_values: Vec::new(),
            non_regularized: Vec::new(),
            patch_type: PatchType::Svm,
            patch_size: 1,
            weights: FilterSet::default(),
            bias: FilterSet::default(),
            scoring: None,
            hints: None,
        }
    }

    /// Set the mean shape.
    pub fn mean_shape(mut self, shape: Vec<Point>) -> Self {
        self.mean_shape = Some(shape);
        self
    }

    /// Add a shape mode: `2N` interleaved basis values and its variance.
    pub fn add_mode(mut self, basis: Vec<f64>, eigen_value: f64) -> Self {
        if self.eigen_vectors.len() < basis.len() {
            self.eigen_vectors.resize(basis.len(), Vec::new());
        }
        for (row, value) in self.eigen_vectors.iter_mut().zip(basis) {
            row.push(value);
        }
        self.eigen_values.push(eigen_value);
        self
    }

    /// Exclude mode `k` from the statistical prior.
    pub fn non_regularized(mut self, k: usize) -> Self {
        self.non_regularized.push(k);
        self
    }

    pub fn patch_type(mut self, patch_type: PatchType) -> Self {
        self.patch_type = patch_type;
        self
    }

    /// Set SVM filters and biases for one feature map.
    pub fn filters(mut self, kind: ResponseKind, size: usize, weights: Vec<Vec<f64>>, bias: Vec<f64>) -> Self {
        self.patch_size = size;
        match kind {
            ResponseKind::Raw => {
                self.weights.raw = Some(weights);
                self.bias.raw = Some(bias);
            }
            ResponseKind::Sobel => {
                self.weights.sobel = Some(weights);
                self.bias.sobel = Some(bias);
            }
            ResponseKind::Lbp => {
                self.weights.lbp = Some(weights);
                self.bias.lbp = Some(bias);
            }
        }
        self
    }

    /// Filter side length when no filters are attached.
    pub fn patch_size(mut self, size: usize) -> Self {
        self.patch_size = size;
        self
    }

    pub fn scoring(mut self, scoring: ScoringModel) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn hints(mut self, hints: Hints) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Build and validate the model.
    pub fn build(self) -> Result<ClmModel> {
        let mean_shape = self
            .mean_shape
            .ok_or_else(|| Error::InvalidModel("Missing mean shape".into()))?;
        let num_landmarks = mean_shape.len();

        let eigen_vectors = if self.eigen_vectors.is_empty() {
            vec![Vec::new(); num_landmarks * 2]
        } else {
            self.eigen_vectors
        };

        let model = ClmModel {
            shape_model: ShapeModelData {
                mean_shape: mean_shape.iter().map(|p| [p.x, p.y]).collect(),
                eigen_vectors,
                num_evalues: self.eigen_values.len(),
                eigen_values: self.eigen_values,
                non_regularized_vectors: self.non_regularized,
            },
            patch_model: PatchModel {
                patch_type: self.patch_type,
                num_patches: num_landmarks,
                patch_size: [self.patch_size, self.patch_size],
                canvas_size: [0, 0],
                weights: self.weights,
                bias: self.bias,
            },
            scoring: self.scoring,
            hints: self.hints,
        };
        model.validate()?;
        Ok(model)
    }
}

impl Default for ClmModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_model() -> ClmModel {
        ClmModelBuilder::new()
            .mean_shape(vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(0.0, 10.0),
                Point::new(10.0, 10.0),
            ])
            .add_mode(vec![1.0, 0.0, -1.0, 0.0, 1.0, 0.0, -1.0, 0.0], 2.0)
            .filters(
                ResponseKind::Raw,
                3,
                vec![vec![0.1; 9]; 4],
                vec![0.0; 4],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn builder_produces_consistent_model() {
        let model = square_model();
        assert_eq!(model.num_landmarks(), 4);
        assert_eq!(model.num_modes(), 1);
        assert_eq!(model.patch_size(), 3);

        let shape = model.shape_model().unwrap();
        assert_eq!(shape.num_parameters(), 5);
    }

    #[test]
    fn builder_requires_mean_shape() {
        assert!(ClmModelBuilder::new().build().is_err());
    }

    #[test]
    fn rejects_even_filters() {
        let result = ClmModelBuilder::new()
            .mean_shape(vec![Point::new(0.0, 0.0)])
            .filters(ResponseKind::Raw, 4, vec![vec![0.0; 16]], vec![0.0])
            .build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));
    }

    #[test]
    fn parses_json_layout() {
        let json = r#"{
            "shapeModel": {
                "meanShape": [[0, 0], [4, 0], [2, 3]],
                "eigenVectors": [[1, 0], [0, 0], [0, 1], [0, 0], [0, 0], [0, 0]],
                "eigenValues": [3.0, 1.5],
                "numEvalues": 2,
                "numPtsPerSample": 3,
                "nonRegularizedVectors": [1]
            },
            "patchModel": {
                "patchType": "MOSSE",
                "numPatches": 3,
                "patchSize": [5, 5],
                "canvasSize": [40, 40]
            },
            "scoring": { "size": [2, 1], "coef": [0.5, -0.5], "bias": 0.1 },
            "hints": { "leftEye": [1, 1], "rightEye": [3, 1], "nose": [2, 2] },
            "path": { "normal": [], "vertices": [] }
        }"#;

        let model = ClmModel::from_json_str(json).unwrap();
        assert_eq!(model.patch_model.patch_type, PatchType::Correlation);
        assert_eq!(model.num_modes(), 2);
        assert_eq!(model.shape_model.non_regularized_vectors, vec![1]);
        assert_eq!(model.hints.unwrap().anchors()[2], Point::new(2.0, 2.0));

        let shape = model.shape_model().unwrap();
        assert!(shape.is_non_regularized(1));
        assert!(!shape.is_non_regularized(0));
    }

    #[test]
    fn save_and_load_model() {
        let model = square_model();

        let temp_path = std::env::temp_dir().join("clm_tracker_test_model.bin");
        model.save(&temp_path).unwrap();

        let loaded = ClmModel::load(&temp_path).unwrap();
        assert_eq!(loaded.num_landmarks(), model.num_landmarks());
        assert_eq!(loaded.shape_model.eigen_values, model.shape_model.eigen_values);

        std::fs::remove_file(temp_path).ok();
    }

    #[test]
    fn loads_bzip2_compressed_model() {
        use bzip2::write::BzEncoder;
        use bzip2::Compression;

        let model = square_model();
        let bytes = bincode::serialize(&model).unwrap();

        let temp_path = std::env::temp_dir().join("clm_tracker_test_model.bin.bz2");
        let file = File::create(&temp_path).unwrap();
        let mut encoder = BzEncoder::new(file, Compression::default());
        encoder.write_all(&bytes).unwrap();
        encoder.finish().unwrap();

        let loaded = ClmModel::load(&temp_path).unwrap();
        assert_eq!(loaded.num_landmarks(), 4);

        std::fs::remove_file(temp_path).ok();
    }
}
