use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShapeError>;

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}
