//! oaax-ipc - shared-memory tensor bridge between a client and an inference daemon.

mod defaults;
pub mod error;

pub mod engine;
pub mod ipc;
pub mod tensor;

pub use error::{Error, ErrorKind, Result};

pub use ipc::client::{ClientSession, RequestSender, ResponseReceiver, SessionConfig, SessionParams};
pub use ipc::{endpoints, pipe, shm};
pub use ipc::pipe::{PipeError, PipeReader, PipeWriter};
pub use ipc::serialization::{
    decode_request, decode_response, encode_request, encode_response, CodecError,
};
pub use ipc::shm::{RegionError, RegionId, RegionKey, RegionState, SharedRegion};

pub use engine::{
    CancellationToken, Daemon, DaemonConfig, DynamicRuntime, InferenceRuntime, LoopState,
    RuntimeArgs, RuntimeError, SessionStats,
};

pub use tensor::{DataType, Tensor, TensorBatch};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
