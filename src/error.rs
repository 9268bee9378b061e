use thiserror::Error;

/// Error taxonomy for the calibration pipeline.
///
/// `Input` failures abort the run before any evaluation is scheduled.
/// `Evaluator` failures abort the current generation stage; the orchestrator
/// still persists whatever run metadata has accumulated. Threshold
/// non-satisfaction is never an error and has no variant here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input error: {0}")]
    Input(String),

    #[error("evaluator error: {0}")]
    Evaluator(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
