//! Cooperative shutdown of the daemon loop.

use std::time::{Duration, Instant};

use oaax_ipc::{
    CancellationToken, ClientSession, Daemon, DaemonConfig, Error, LoopState, PipeError,
    SessionConfig, SharedRegion, TensorBatch,
};

use crate::fixture::{f32_tensor, ScriptedRuntime, Session, WAIT_TIMEOUT};

/// Cancelling while the loop waits ends it within one wait interval and
/// closes both pipes.
#[test]
fn test_shutdown_while_waiting() {
    let runtime = ScriptedRuntime::new(|_| TensorBatch::default());
    let mut session = Session::start(1024, runtime);
    std::thread::sleep(WAIT_TIMEOUT);

    let started = Instant::now();
    let stats = session.stop();
    let elapsed = started.elapsed();
    assert!(
        elapsed < WAIT_TIMEOUT * 3,
        "daemon took {:?} to stop",
        elapsed
    );
    assert_eq!(stats.cycles, 0);

    // The module pipe writer is gone: the client sees end-of-channel.
    let result = session.receiver.receive(Duration::from_secs(1));
    assert!(
        matches!(result, Err(Error::Pipe(PipeError::EndOfChannel))),
        "expected end of channel, got {:?}",
        result.map(|batch| batch.map(|b| b.count()))
    );
    assert!(session.log.lock().unwrap().destroyed);
}

/// A signal that arrives once shutdown has been requested is not served.
#[test]
fn test_signal_after_cancel_is_ignored() {
    let runtime = ScriptedRuntime::new(|_| TensorBatch::default());
    let mut session = Session::start(1024, runtime);

    session.token.cancel();
    // The daemon may already have closed its end; the outcome of the send
    // does not matter, only that nothing gets processed.
    let _ = session
        .sender
        .send(TensorBatch::new(vec![f32_tensor(None, vec![1], 0.0)]));

    let stats = session.stop();
    assert_eq!(stats.cycles, 0);
    assert_eq!(stats.dropped, 0);
    let log = session.log.lock().unwrap();
    assert!(log.inputs.is_empty(), "no inference after cancellation");
    assert_eq!(log.cleanups, 0);
}

/// Shutdown is honored while still waiting for the client to connect.
#[test]
fn test_shutdown_before_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let client = ClientSession::create(SessionConfig {
        region_size: 64,
        ..SessionConfig::in_dir(dir.path())
    })
    .unwrap();
    let params = client.params();
    let token = CancellationToken::new();

    let daemon = Daemon::new(
        ScriptedRuntime::new(|_| TensorBatch::default()),
        &params.engine_pipe,
        &params.module_pipe,
        SharedRegion::open(params.region_key, params.region_id),
        token.clone(),
        DaemonConfig {
            wait_timeout: WAIT_TIMEOUT,
            ..DaemonConfig::default()
        },
    )
    .unwrap();
    assert_eq!(daemon.state(), LoopState::WaitSignal);

    let handle = std::thread::spawn(move || daemon.run());
    std::thread::sleep(WAIT_TIMEOUT * 2);

    let started = Instant::now();
    token.cancel();
    let stats = handle.join().unwrap().unwrap();
    assert!(started.elapsed() < WAIT_TIMEOUT * 3);
    assert_eq!(stats, Default::default());
}
