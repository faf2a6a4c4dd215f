//! Caster error types

/// NTRIP caster error types
#[derive(Debug, thiserror::Error)]
pub enum CasterError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Parse(String),

    #[error("authentication failed")]
    Auth,

    #[error("mount point name already in use")]
    NameInUse,

    #[error("mount point not found")]
    NotFound,

    #[error("no positioned mount point available for auto-selection")]
    NoCandidate,

    #[error("auto mount requested without a client position")]
    MissingPosition,
}
