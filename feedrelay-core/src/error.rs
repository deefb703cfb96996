use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
