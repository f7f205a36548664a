use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "oaax-daemon",
    version,
    about = "Serve tensor inference requests over shared memory"
)]
pub struct Cli {
    /// Shared library implementing the runtime entry points
    pub library: PathBuf,

    /// Model file handed to the runtime
    pub model: PathBuf,

    /// Pipe the client signals requests on
    pub engine_pipe: PathBuf,

    /// Pipe this daemon signals responses on
    pub module_pipe: PathBuf,

    /// Current id of the shared-memory region
    #[arg(allow_negative_numbers = true)]
    pub shm_id: i32,

    /// Key of the shared-memory region
    #[arg(allow_negative_numbers = true)]
    pub shm_key: i32,

    /// Log filter (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, env = "OAAX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Runtime initialization argument, repeatable
    #[arg(long = "runtime-arg", value_name = "KEY=VALUE")]
    pub runtime_args: Vec<String>,

    /// JSON object of runtime initialization arguments
    #[arg(long, value_name = "FILE")]
    pub runtime_config: Option<PathBuf>,

    /// Seconds between shutdown checks while waiting for a request
    #[arg(long, default_value_t = 1)]
    pub wait_timeout: u64,

    /// Seconds to wait for the client to open its end of the module pipe
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Skip the connection handshake (the client sends requests right away)
    #[arg(long)]
    pub no_handshake: bool,
}
