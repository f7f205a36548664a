use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use oaax_ipc::{
    CancellationToken, ClientSession, DataType, Daemon, DaemonConfig, InferenceRuntime,
    RequestSender, ResponseReceiver, RuntimeArgs, RuntimeError, SessionConfig, SessionParams,
    SessionStats, SharedRegion, Tensor, TensorBatch,
};

pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_millis(100);
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the scripted runtime saw during a session.
#[derive(Debug, Default)]
pub(crate) struct RuntimeLog {
    pub(crate) inputs: Vec<TensorBatch>,
    pub(crate) cleanups: usize,
    pub(crate) destroyed: bool,
}

type Respond = Box<dyn FnMut(&TensorBatch) -> TensorBatch + Send>;

/// Runtime whose outputs come from a closure.
pub(crate) struct ScriptedRuntime {
    respond: Respond,
    fail_inference: bool,
    log: Arc<Mutex<RuntimeLog>>,
}

impl ScriptedRuntime {
    pub(crate) fn new(respond: impl FnMut(&TensorBatch) -> TensorBatch + Send + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            fail_inference: false,
            log: Arc::default(),
        }
    }

    /// Report failure from every inference call, after producing output.
    pub(crate) fn failing(mut self) -> Self {
        self.fail_inference = true;
        self
    }

    pub(crate) fn log(&self) -> Arc<Mutex<RuntimeLog>> {
        Arc::clone(&self.log)
    }
}

impl InferenceRuntime for ScriptedRuntime {
    fn initialize(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn initialize_with_args(&mut self, _args: &RuntimeArgs) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn load_model(&mut self, _path: &Path) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn run_inference(
        &mut self,
        input: TensorBatch,
        output: &mut TensorBatch,
    ) -> Result<(), RuntimeError> {
        *output = (self.respond)(&input);
        self.log.lock().unwrap().inputs.push(input);
        if self.fail_inference {
            return Err(RuntimeError::Status {
                entry: "runtime_inference_execution",
                code: 1,
                message: self.error_message(),
            });
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), RuntimeError> {
        self.log.lock().unwrap().cleanups += 1;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), RuntimeError> {
        self.log.lock().unwrap().destroyed = true;
        Ok(())
    }

    fn error_message(&self) -> String {
        "scripted failure".to_string()
    }

    fn version(&self) -> String {
        "0.0.0".to_string()
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

/// A connected client plus a daemon loop running on its own thread.
pub(crate) struct Session {
    pub(crate) sender: RequestSender,
    pub(crate) receiver: ResponseReceiver,
    pub(crate) token: CancellationToken,
    pub(crate) log: Arc<Mutex<RuntimeLog>>,
    pub(crate) params: SessionParams,
    pub(crate) config: SessionConfig,
    daemon: Option<JoinHandle<oaax_ipc::Result<SessionStats>>>,
    _dir: tempfile::TempDir,
}

impl Session {
    pub(crate) fn start(region_size: usize, runtime: ScriptedRuntime) -> Self {
        Self::start_with(runtime, |config| config.region_size = region_size)
    }

    pub(crate) fn start_with(
        runtime: ScriptedRuntime,
        configure: impl FnOnce(&mut SessionConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::in_dir(dir.path());
        configure(&mut config);

        let mut client = ClientSession::create(config.clone()).expect("client session");
        let params = client.params();
        let log = runtime.log();
        let token = CancellationToken::new();

        let daemon = Daemon::new(
            runtime,
            &params.engine_pipe,
            &params.module_pipe,
            SharedRegion::open(params.region_key, params.region_id),
            token.clone(),
            DaemonConfig {
                wait_timeout: WAIT_TIMEOUT,
                connect_timeout: Duration::from_secs(2),
                handshake: true,
            },
        )
        .expect("daemon");
        let handle = thread::Builder::new()
            .name("oaax-daemon".to_string())
            .spawn(move || daemon.run())
            .unwrap();

        client.connect(Duration::from_secs(5)).expect("handshake");
        let (sender, receiver) = client.split().unwrap();

        Self {
            sender,
            receiver,
            token,
            log,
            params,
            config,
            daemon: Some(handle),
            _dir: dir,
        }
    }

    pub(crate) fn round_trip(&mut self, batch: TensorBatch) -> TensorBatch {
        self.sender.send(batch).expect("send request");
        self.receiver
            .receive_until(Instant::now() + RESPONSE_TIMEOUT)
            .expect("receive response")
    }

    /// Cancel the daemon and wait for it to exit.
    pub(crate) fn stop(&mut self) -> SessionStats {
        self.token.cancel();
        let handle = self.daemon.take().expect("daemon already stopped");
        handle
            .join()
            .expect("daemon thread panicked")
            .expect("daemon loop failed")
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.daemon.take() {
            self.token.cancel();
            let _ = handle.join();
        }
    }
}

pub(crate) fn f32_tensor(name: Option<&str>, shape: Vec<u64>, start: f32) -> Tensor {
    let count: u64 = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|i| start + i as f32).collect();
    Tensor::from_f32(name, shape, &values)
}

pub(crate) fn i64_tensor(name: &str, values: &[i64]) -> Tensor {
    Tensor::new(
        Some(name.to_string()),
        DataType::Int64,
        vec![values.len() as u64],
        values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    )
}
