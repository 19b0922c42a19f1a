//! Error types for the engine.
//!
//! The source C++ implementation split errors along two axes: configuration
//! failures threw exceptions that became a non-OK gRPC status, while runtime
//! pipeline failures were recorded as a `(reason, message)` pair and reported
//! inside an OK-status summary (spec §7). `FactoryError` below is the first
//! half of that split; the second half needs no type of its own because
//! `Pipeline::termination_reason`/`termination_message` already carry it
//! straight into `CallSession::write_summary`.

use tonic::Status;

/// Errors raised while validating a request or building a pipeline, prior to
/// `Pipeline::start`. These always surface as a non-OK gRPC status.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("request ID not set")]
    MissingRequestId,

    #[error("config message not sent")]
    MissingConfig,

    #[error("must specify either pipeline name or specs")]
    NoPipelineSource,

    #[error("dynamic pipelines in requests are disabled")]
    DynamicPipelinesDisabled,

    #[error("pipeline name '{0}' not defined")]
    UnknownPipelineName(String),

    #[error("requested rate {requested} exceeds allowed max rate {max}")]
    RateExceedsMax { requested: f64, max: f64 },

    #[error("requested length limit {requested} exceeds allowed max {max}")]
    LengthLimitExceedsMax { requested: u64, max: u64 },

    #[error("requested start tolerance bytes {requested} exceeds allowed max {max}")]
    StartToleranceExceedsMax { requested: u64, max: u64 },

    #[error("requested read timeout {requested} exceeds allowed max {max}")]
    ReadTimeoutExceedsMax { requested: u64, max: u64 },

    #[error("requested pipeline output buffer {requested} exceeds allowed max {max}")]
    OutputBufferExceedsMax { requested: u64, max: u64 },

    #[error("cannot create pipeline: {0}")]
    PipelineConstruction(#[from] anyhow::Error),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

impl From<&FactoryError> for Status {
    fn from(err: &FactoryError) -> Status {
        match err {
            FactoryError::MissingRequestId => Status::failed_precondition(err.to_string()),
            FactoryError::MissingConfig | FactoryError::UnexpectedMessage(_) => {
                Status::failed_precondition(err.to_string())
            }
            _ => Status::invalid_argument(err.to_string()),
        }
    }
}

impl From<FactoryError> for Status {
    fn from(err: FactoryError) -> Status {
        Status::from(&err)
    }
}
