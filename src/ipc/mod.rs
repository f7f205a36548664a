//! Shared-memory IPC between a client and the inference daemon.
//!
//! A session is one SysV shared-memory region holding a single message at a
//! time, plus two FIFOs whose single-byte writes tell the peer that the
//! region is ready for it.

pub mod client;
pub mod endpoints;
pub mod pipe;
pub mod serialization;
pub mod shm;
