use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model deserialization error: {0}")]
    Deserialization(#[from] bincode::Error),

    #[error("Model JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Tracker must be initialized with a model before it can start")]
    NotInitialized,

    #[error("Degenerate alignment: point set has zero spread")]
    DegenerateAlignment,

    #[error("Face detection failed: {0}")]
    DetectionFailed(String),

    #[error("Patch scorer error: {0}")]
    Scorer(String),

    #[error("Parameter update system is singular")]
    SingularSystem,
}

pub type Result<T> = std::result::Result<T, Error>;
