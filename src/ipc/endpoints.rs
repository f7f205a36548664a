//! Default filesystem locations for the session's pipes and region key.
//!
//! Both peers must agree on these paths. A client normally creates them and
//! hands the names to the daemon on its command line.

use std::path::PathBuf;

pub const ENGINE_PIPE_NAME: &str = "engine_pipe";
pub const MODULE_PIPE_NAME: &str = "module_pipe";
pub const REGION_KEY_NAME: &str = "region.key";

/// Get the IPC root directory for pipe files and the region key file.
///
/// Uses a stable, user-specific cache directory so that sessions do not
/// litter system-wide locations like /tmp.
pub fn ipc_root() -> PathBuf {
    // OAAX_IPC_ROOT overrides the location for containers and tests.
    if let Ok(root) = std::env::var("OAAX_IPC_ROOT") {
        return PathBuf::from(root);
    }

    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("oaax")
        .join("ipc")
}

/// Pipe carrying client → daemon wake-ups.
pub fn engine_pipe_path() -> PathBuf {
    ipc_root().join(ENGINE_PIPE_NAME)
}

/// Pipe carrying daemon → client wake-ups.
pub fn module_pipe_path() -> PathBuf {
    ipc_root().join(MODULE_PIPE_NAME)
}

/// Path whose inode, together with the discriminant, derives the region key.
///
/// Must exist for the lifetime of the session.
pub fn region_key_path() -> PathBuf {
    ipc_root().join(REGION_KEY_NAME)
}
