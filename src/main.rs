mod cli;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use oaax_ipc::engine::signals;
use oaax_ipc::{
    CancellationToken, Daemon, DaemonConfig, DynamicRuntime, InferenceRuntime, RegionId,
    RegionKey, RuntimeArgs, SessionStats, SharedRegion,
};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(stats) => {
            log::info!("Exiting after {}", stats);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{} error: {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

fn runtime_args(cli: &cli::Cli) -> oaax_ipc::Result<RuntimeArgs> {
    let mut args = match &cli.runtime_config {
        Some(path) => RuntimeArgs::from_json_file(path)?,
        None => RuntimeArgs::new(),
    };
    for pair in &cli.runtime_args {
        let (key, value) = RuntimeArgs::parse_pair(pair)?;
        args.push(key, value);
    }
    Ok(args)
}

fn run(cli: cli::Cli) -> oaax_ipc::Result<SessionStats> {
    let token = CancellationToken::new();
    signals::install_termination_handler(&token)?;

    let args = runtime_args(&cli)?;
    let mut runtime = DynamicRuntime::load(&cli.library)?;
    runtime.start(&args, &cli.model)?;

    let region = SharedRegion::open(RegionKey(cli.shm_key), RegionId(cli.shm_id));
    let config = DaemonConfig {
        wait_timeout: Duration::from_secs(cli.wait_timeout.max(1)),
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        handshake: !cli.no_handshake,
    };

    let daemon = Daemon::new(
        runtime,
        &cli.engine_pipe,
        &cli.module_pipe,
        region,
        token,
        config,
    )?;
    daemon.run()
}
