//! Protocol constants and default tuning values.

use std::time::Duration;

/// Bytes reserved at the start of a region for the payload length.
pub const HEADER_BYTES: usize = 4;

/// Longest a blocking wait on the inbound pipe lasts before re-checking shutdown.
pub const WAIT_TIMEOUT_SECS: u64 = 1;

/// How long a peer waits for the other end of a pipe to show up.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Largest single tensor blob accepted by the request decoder (100 MiB).
pub const MAX_BIN_LEN: u32 = 100 * 1024 * 1024;

/// Longest accepted output-format string in a request.
pub const MAX_OUTPUT_FORMAT_LEN: u32 = 100;

/// Output-format string written into requests. Ignored by the daemon.
pub const OUTPUT_FORMAT: &str = "json";

/// Initial region capacity created by a client session (10 MiB).
pub const REGION_SIZE: usize = 10 * 1024 * 1024;

/// Project discriminant fed to `ftok` alongside the key path.
pub const DISCRIMINANT: i32 = 1;

/// Requests a client may have outstanding before `send` waits.
pub const MAX_IN_FLIGHT: usize = 1;

/// Sleep between in-flight checks while a sender is held back.
pub const BACKPRESSURE_POLL_MS: u64 = 100;

/// Consecutive held-back polls before `send` gives up.
pub const MAX_CONSECUTIVE_WAITS: u32 = 1000;

/// Payload byte written for a wake-up signal. Advisory only.
pub const SIGNAL_BYTE: u8 = b'a';

/// Payload byte used during the session handshake.
pub const HANDSHAKE_BYTE: u8 = 0;

pub fn wait_timeout() -> Duration {
    Duration::from_secs(WAIT_TIMEOUT_SECS)
}

pub fn backpressure_poll() -> Duration {
    Duration::from_millis(BACKPRESSURE_POLL_MS)
}

pub fn connect_timeout() -> Duration {
    Duration::from_secs(CONNECT_TIMEOUT_SECS)
}
