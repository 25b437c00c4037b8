//! Error types.

use std::io;

use crate::halo::ElementKind;
use crate::Pid;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Process count and splitting scheme can't produce a valid tree.
    #[error("infeasible partitioning: {0}")]
    InfeasibleBuild(String),
    /// A balance action would break disjointness, completeness or alignment.
    /// Aborts a single commit round, never the process.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error("element type mismatch: expected {expected:?} ({expected_size} bytes), got {found:?} ({found_size} bytes)")]
    TypeMismatch {
        expected: ElementKind,
        expected_size: u32,
        found: ElementKind,
        found_size: u32,
    },
    /// Participants disagree on the shape of the partitioning or diverged in
    /// the sequence of collectives.
    #[error("topology mismatch: {0}")]
    TopologyMismatch(String),
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("point out of bounds: {0}")]
    OutOfBounds(String),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("no such process: {0}")]
    NoSuchProcess(Pid),

    #[error("communication failure: {0}")]
    CommError(String),
    #[error("io error: {0}")]
    IoError(String),

    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),
    #[cfg(feature = "yaml")]
    #[error("yaml deserialization error: {0}")]
    YamlDeserError(#[from] serde_yaml::Error),
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether the error only aborts the current round. Every other error is
    /// fatal to the participant.
    pub fn is_round_local(&self) -> bool {
        match self {
            Error::InvalidPartition(_) => true,
            _ => false,
        }
    }
}
