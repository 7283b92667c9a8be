#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A decoded record failed its layout check, or a recomputed hash did not
    /// match an expected value. Indicates on-disk data integrity loss; fatal
    /// for the affected operation.
    #[error("corruption error {0}")]
    CorruptionError(String),

    #[error("version {0} not found")]
    VersionNotFound(crate::Version),

    /// The distinguished end-of-stream condition of an export. Never
    /// conflated with an I/O or corruption error.
    #[error("export done")]
    ExportDone,

    #[error("invalid operation error {0}")]
    InvalidOperation(&'static str),

    #[error("invalid proof error {0}")]
    InvalidProofError(String),

    #[error("proof creation error {0}")]
    ProofCreationError(String),

    #[error("storage error {0}")]
    StorageError(#[from] std::io::Error),
}
