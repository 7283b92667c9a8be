#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("corruption error {0}")]
    CorruptionError(String),

    #[error("store {0} is not mounted")]
    StoreNotFound(String),

    #[error("invalid operation error {0}")]
    InvalidOperation(&'static str),

    #[error("invalid proof error {0}")]
    InvalidProofError(String),

    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("tree error {0}")]
    TreeError(#[from] iavl::Error),

    #[error("storage error {0}")]
    StorageError(#[from] std::io::Error),
}
