use crate::model::ModelError;
use crate::tools::ToolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    /// The model kept asking for tools past the configured cap.
    #[error("could not complete the request within {rounds} rounds")]
    RoundLimit { rounds: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
