//! The daemon loop: wait for a signal, serve one request, signal back.
//!
//! ```text
//! WAIT_SIGNAL -> READ_REGION -> DECODE -> INFER -> ENCODE -> WRITE_REGION -> SIGNAL_READY
//!      ^                                                                        |
//!      +------------------------------------------------------------------------+
//! WAIT_SIGNAL -> INTERRUPTED
//! ```
//!
//! Read, decode and inference failures abandon the cycle and the loop keeps
//! going. A failure while writing the response region ends the session.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::defaults;
use crate::engine::runtime::InferenceRuntime;
use crate::engine::signals::CancellationToken;
use crate::error::Result;
use crate::ipc::pipe::{PipeError, PipeReader, PipeWriter};
use crate::ipc::serialization::{decode_request, encode_response};
use crate::ipc::shm::SharedRegion;
use crate::tensor::TensorBatch;

/// Tuning for a daemon session.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bound on each inbound wait; also the shutdown polling interval.
    pub wait_timeout: Duration,
    /// How long to wait for the client's read end when opening the outbound pipe.
    pub connect_timeout: Duration,
    /// Expect the one-byte connection handshake before the first request.
    pub handshake: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            wait_timeout: defaults::wait_timeout(),
            connect_timeout: defaults::connect_timeout(),
            handshake: true,
        }
    }
}

/// Position of the daemon in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitSignal,
    ReadRegion,
    Decode,
    Infer,
    Encode,
    WriteRegion,
    SignalReady,
    Interrupted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WaitSignal => "WAIT_SIGNAL",
            Self::ReadRegion => "READ_REGION",
            Self::Decode => "DECODE",
            Self::Infer => "INFER",
            Self::Encode => "ENCODE",
            Self::WriteRegion => "WRITE_REGION",
            Self::SignalReady => "SIGNAL_READY",
            Self::Interrupted => "INTERRUPTED",
        };
        f.write_str(name)
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Cycles that ended with a ready signal.
    pub cycles: u64,
    /// Requests abandoned before a response was signalled.
    pub dropped: u64,
    /// Cycles whose inference entry point reported failure.
    pub inference_failures: u64,
    /// Times the region was reallocated for a larger response.
    pub grows: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cycles, {} dropped, {} inference failures, {} grows",
            self.cycles, self.dropped, self.inference_failures, self.grows
        )
    }
}

fn advance(state: &mut LoopState, next: LoopState) {
    log::trace!("{} -> {}", state, next);
    *state = next;
}

/// Send `byte`, reopening the writer once if the client's reader went away.
///
/// Waiting for a reader ends early once `token` is cancelled.
fn send_byte(
    outbound: &mut Option<PipeWriter>,
    path: &Path,
    timeout: Duration,
    token: &CancellationToken,
    byte: u8,
) -> std::result::Result<(), PipeError> {
    let reopen = || PipeWriter::open_while(path, timeout, || !token.is_cancelled());
    let mut writer = match outbound.take() {
        Some(writer) => writer,
        None => reopen()?,
    };

    match writer.send(byte) {
        Ok(()) => {
            *outbound = Some(writer);
            Ok(())
        }
        Err(PipeError::Send(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
            log::debug!("Reader of {:?} went away; reopening", path);
            drop(writer);
            let mut writer = reopen()?;
            writer.send(byte)?;
            *outbound = Some(writer);
            Ok(())
        }
        Err(e) => {
            *outbound = Some(writer);
            Err(e)
        }
    }
}

/// One daemon session bound to a client's pipes and region.
pub struct Daemon<R: InferenceRuntime> {
    runtime: R,
    region: SharedRegion,
    inbound: PipeReader,
    outbound: Option<PipeWriter>,
    module_pipe: PathBuf,
    token: CancellationToken,
    config: DaemonConfig,
    stats: SessionStats,
    state: LoopState,
}

impl<R: InferenceRuntime> Daemon<R> {
    /// Open the inbound pipe. The outbound pipe is opened once the client
    /// has announced itself, since opening a FIFO for writing needs a reader.
    pub fn new(
        runtime: R,
        engine_pipe: &Path,
        module_pipe: &Path,
        region: SharedRegion,
        token: CancellationToken,
        config: DaemonConfig,
    ) -> Result<Self> {
        let inbound = PipeReader::open(engine_pipe)?;
        log::debug!(
            "Daemon bound to {:?} / {:?}, region key {}",
            engine_pipe,
            module_pipe,
            region.key()
        );

        Ok(Self {
            runtime,
            region,
            inbound,
            outbound: None,
            module_pipe: module_pipe.to_path_buf(),
            token,
            config,
            stats: SessionStats::default(),
            state: LoopState::WaitSignal,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Serve requests until cancelled or a fatal error occurs.
    ///
    /// Pipes are closed and the runtime destroyed on every exit path.
    pub fn run(mut self) -> Result<SessionStats> {
        let result = self.serve();
        if let Err(ref e) = result {
            log::error!("Daemon loop stopped in {} ({} error): {}", self.state, e.kind(), e);
        }
        let stats = self.shutdown();
        result.map(|()| stats)
    }

    fn serve(&mut self) -> Result<()> {
        if self.config.handshake {
            log::info!("Waiting for client on {:?}", self.inbound.path());
            if self.wait_signal()?.is_none() {
                advance(&mut self.state, LoopState::Interrupted);
                return Ok(());
            }
            let replied = send_byte(
                &mut self.outbound,
                &self.module_pipe,
                self.config.connect_timeout,
                &self.token,
                defaults::HANDSHAKE_BYTE,
            );
            match replied {
                Ok(()) => log::info!("Client connected"),
                Err(_) if self.token.is_cancelled() => {
                    advance(&mut self.state, LoopState::Interrupted);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let token = &self.token;
            self.outbound = Some(PipeWriter::open_while(
                &self.module_pipe,
                self.config.connect_timeout,
                || !token.is_cancelled(),
            )?);
        }

        loop {
            advance(&mut self.state, LoopState::WaitSignal);
            if self.wait_signal()?.is_none() {
                advance(&mut self.state, LoopState::Interrupted);
                return Ok(());
            }
            if let Err(e) = self.cycle() {
                if e.is_fatal() {
                    return Err(e);
                }
                log::warn!("Dropping request in {} ({} error): {}", self.state, e.kind(), e);
                self.stats.dropped += 1;
            }
        }
    }

    /// Block until a byte arrives. `None` once cancellation is requested; a
    /// byte that shows up after the request is left unprocessed.
    fn wait_signal(&mut self) -> Result<Option<u8>> {
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }

            let received = match self.inbound.timed_read(self.config.wait_timeout) {
                Ok(received) => received,
                Err(PipeError::EndOfChannel) => {
                    log::debug!("Client closed {:?}; reopening", self.inbound.path());
                    self.inbound.reopen()?;
                    None
                }
                Err(e) => return Err(e.into()),
            };

            if self.token.is_cancelled() {
                return Ok(None);
            }
            if received.is_some() {
                return Ok(received);
            }
        }
    }

    fn cycle(&mut self) -> Result<()> {
        let Self {
            runtime,
            region,
            outbound,
            module_pipe,
            token,
            config,
            stats,
            state,
            ..
        } = self;

        advance(state, LoopState::ReadRegion);
        let attachment = region.read()?;

        advance(state, LoopState::Decode);
        let input = decode_request(attachment.payload()?)?;
        log::debug!("Decoded {} input tensors", input.count());

        advance(state, LoopState::Infer);
        let mut output = TensorBatch::default();
        if let Err(e) = runtime.run_inference(input, &mut output) {
            log::warn!("Inference failed: {}", e);
            stats.inference_failures += 1;
        }

        advance(state, LoopState::Encode);
        let encoded = encode_response(&output);
        drop(output);
        if let Err(e) = runtime.cleanup() {
            log::warn!("Runtime cleanup failed: {}", e);
        }
        let encoded = encoded?;

        advance(state, LoopState::WriteRegion);
        if encoded.len() > attachment.capacity() {
            let capacity = attachment.capacity();
            attachment.close()?;
            log::debug!(
                "Response of {} bytes exceeds capacity {}; growing region",
                encoded.len(),
                capacity
            );
            region.grow(encoded.len())?;
            stats.grows += 1;
            region.write(&encoded)?;
        } else {
            let mut attachment = attachment;
            attachment.write_in_place(&encoded)?;
            attachment.close()?;
        }

        advance(state, LoopState::SignalReady);
        match send_byte(
            outbound,
            module_pipe,
            config.connect_timeout,
            token,
            defaults::SIGNAL_BYTE,
        ) {
            Ok(()) => stats.cycles += 1,
            Err(e) => {
                log::warn!("Response written but client not signalled: {}", e);
                stats.dropped += 1;
            }
        }
        Ok(())
    }

    fn shutdown(self) -> SessionStats {
        let Self {
            mut runtime,
            inbound,
            outbound,
            stats,
            ..
        } = self;

        if let Err(e) = inbound.close() {
            log::warn!("{}", e);
        }
        if let Some(outbound) = outbound {
            if let Err(e) = outbound.close() {
                log::warn!("{}", e);
            }
        }
        if let Err(e) = runtime.destroy() {
            log::warn!("Runtime destruction failed: {}", e);
        }

        log::info!("Session finished: {}", stats);
        stats
    }
}
