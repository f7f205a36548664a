//! Daemon side: the inference runtime and the loop that serves it.
//!
//! This module provides:
//! - The runtime capability trait and its arguments (`runtime`)
//! - A runtime loaded from a shared library (`ffi`)
//! - The request/response loop (`daemon`)
//! - Cooperative shutdown (`signals`)

pub mod daemon;
pub mod ffi;
pub mod runtime;
pub mod signals;

pub use daemon::{Daemon, DaemonConfig, LoopState, SessionStats};
pub use ffi::DynamicRuntime;
pub use runtime::{InferenceRuntime, RuntimeArgs, RuntimeError};
pub use signals::CancellationToken;
