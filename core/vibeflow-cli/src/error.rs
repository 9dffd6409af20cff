use thiserror::Error;
use vibeflow_core::FlowError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("No active session. Run `vf start` first.")]
    NoActiveSession,

    #[error(transparent)]
    Flow(FlowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl From<FlowError> for CliError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::NoActiveSession { .. } => CliError::NoActiveSession,
            other => CliError::Flow(other),
        }
    }
}
