use std::io;

/// Errors that stop the node from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid node configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;
