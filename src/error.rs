//! Error types for oaax-ipc.

use std::fmt;

use thiserror::Error;

use crate::engine::runtime::RuntimeError;
use crate::ipc::pipe::PipeError;
use crate::ipc::serialization::CodecError;
use crate::ipc::shm::RegionError;

/// How the daemon loop treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Creating or opening session resources failed. Fatal.
    Setup,
    /// The current cycle is abandoned; the loop continues.
    Protocol,
    /// An inference entry point reported failure; the cycle still completes.
    Capability,
    /// Growing or destroying the region failed. Fatal for the write path.
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Protocol => "protocol",
            Self::Capability => "capability",
            Self::Resource => "resource",
        };
        f.write_str(name)
    }
}

/// oaax-ipc error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Pipe signal channel error
    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    /// Shared region error
    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    /// Tensor batch codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Inference runtime error
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Too many unconsumed requests for too long
    #[error("Request not sent after {waits} waits for outstanding responses")]
    Backpressure { waits: u32 },

    /// Session used before the handshake completed
    #[error("IPC session not connected")]
    NotConnected,

    /// Peer did not answer in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Signal handler installation error
    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    /// JSON configuration error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pipe(PipeError::Create { .. } | PipeError::Open { .. }) => ErrorKind::Setup,
            Self::Pipe(_) => ErrorKind::Protocol,
            Self::Region(RegionError::Key { .. } | RegionError::Create { .. }) => ErrorKind::Setup,
            Self::Region(RegionError::Grow { .. } | RegionError::Destroy { .. }) => {
                ErrorKind::Resource
            }
            Self::Region(_) => ErrorKind::Protocol,
            Self::Codec(_) => ErrorKind::Protocol,
            Self::Runtime(RuntimeError::Status { .. }) => ErrorKind::Capability,
            Self::Runtime(_) => ErrorKind::Setup,
            Self::Backpressure { .. } => ErrorKind::Protocol,
            Self::NotConnected
            | Self::Timeout(_)
            | Self::Signal(_)
            | Self::Json(_)
            | Self::Io(_) => ErrorKind::Setup,
        }
    }

    /// Whether the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Setup | ErrorKind::Resource)
    }
}

/// Result type alias for oaax-ipc operations.
pub type Result<T> = std::result::Result<T, Error>;
