//! Client side of a session.
//!
//! A [`ClientSession`] owns the session resources: both FIFOs, the key file
//! and the region. After the handshake it splits into a [`RequestSender`]
//! and a [`ResponseReceiver`], meant for a producer thread and a consumer
//! thread. The two halves share nothing but an in-flight counter.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::ipc::endpoints;
use crate::ipc::pipe::{self, PipeReader, PipeWriter};
use crate::ipc::serialization::{decode_response, encode_request};
use crate::ipc::shm::{self, RegionId, RegionKey, SharedRegion};
use crate::tensor::TensorBatch;

/// Where a session's resources live and how the client paces itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client to daemon pipe
    pub engine_pipe: PathBuf,
    /// Daemon to client pipe
    pub module_pipe: PathBuf,
    /// Existing or creatable file the region key is derived from
    pub key_path: PathBuf,
    pub discriminant: i32,
    /// Initial region payload capacity
    pub region_size: usize,
    /// Unconsumed requests allowed before `send` waits
    pub max_in_flight: usize,
    pub backpressure_poll: Duration,
    pub max_consecutive_waits: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine_pipe: endpoints::engine_pipe_path(),
            module_pipe: endpoints::module_pipe_path(),
            key_path: endpoints::region_key_path(),
            discriminant: defaults::DISCRIMINANT,
            region_size: defaults::REGION_SIZE,
            max_in_flight: defaults::MAX_IN_FLIGHT,
            backpressure_poll: defaults::backpressure_poll(),
            max_consecutive_waits: defaults::MAX_CONSECUTIVE_WAITS,
        }
    }
}

impl SessionConfig {
    /// Defaults with every path placed under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            engine_pipe: dir.join(endpoints::ENGINE_PIPE_NAME),
            module_pipe: dir.join(endpoints::MODULE_PIPE_NAME),
            key_path: dir.join(endpoints::REGION_KEY_NAME),
            ..Self::default()
        }
    }
}

/// The values a daemon needs to join a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub engine_pipe: PathBuf,
    pub module_pipe: PathBuf,
    pub region_id: RegionId,
    pub region_key: RegionKey,
}

impl SessionParams {
    /// The four trailing positional arguments of `oaax-daemon`.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.engine_pipe.display().to_string(),
            self.module_pipe.display().to_string(),
            self.region_id.0.to_string(),
            self.region_key.0.to_string(),
        ]
    }
}

/// Removes the region and pipes once every handle of the session is gone.
#[derive(Debug)]
struct SessionResources {
    key: RegionKey,
    engine_pipe: PathBuf,
    module_pipe: PathBuf,
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        // The region may have been grown by the daemon; resolve the live id.
        match shm::lookup(self.key).and_then(shm::destroy) {
            Ok(()) => log::debug!("Destroyed region for key {}", self.key),
            Err(e) => log::warn!("Could not destroy session region: {}", e),
        }
        let _ = fs::remove_file(&self.engine_pipe);
        let _ = fs::remove_file(&self.module_pipe);
    }
}

/// A client session before it is split into its two halves.
pub struct ClientSession {
    config: SessionConfig,
    region: SharedRegion,
    inbound: PipeReader,
    outbound: Option<PipeWriter>,
    resources: Arc<SessionResources>,
}

impl ClientSession {
    /// Create the pipes, the key file and the region, and open the read end
    /// of the module pipe.
    pub fn create(config: SessionConfig) -> Result<Self> {
        for path in [&config.engine_pipe, &config.module_pipe, &config.key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        pipe::create(&config.engine_pipe)?;
        pipe::create(&config.module_pipe)?;

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.key_path)?;
        let region =
            SharedRegion::create(&config.key_path, config.discriminant, config.region_size)?;

        let resources = Arc::new(SessionResources {
            key: region.key(),
            engine_pipe: config.engine_pipe.clone(),
            module_pipe: config.module_pipe.clone(),
        });
        let inbound = PipeReader::open(&config.module_pipe)?;

        log::info!(
            "Session ready: engine pipe {:?}, module pipe {:?}, region key {}",
            config.engine_pipe,
            config.module_pipe,
            region.key()
        );

        Ok(Self {
            config,
            region,
            inbound,
            outbound: None,
            resources,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn params(&self) -> SessionParams {
        SessionParams {
            engine_pipe: self.config.engine_pipe.clone(),
            module_pipe: self.config.module_pipe.clone(),
            region_id: self.region.id().unwrap_or(RegionId(-1)),
            region_key: self.region.key(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    /// Announce the client to the daemon and wait for its answer.
    ///
    /// `timeout` bounds both the wait for the daemon to open its end and the
    /// wait for the reply.
    pub fn connect(&mut self, timeout: Duration) -> Result<()> {
        let mut writer = PipeWriter::open_with_timeout(&self.config.engine_pipe, timeout)?;
        writer.send(defaults::HANDSHAKE_BYTE)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("daemon handshake"));
            }
            if self.inbound.timed_read(remaining)?.is_some() {
                break;
            }
        }

        log::info!("Connected to daemon");
        self.outbound = Some(writer);
        Ok(())
    }

    /// Split into a producer half and a consumer half.
    pub fn split(self) -> Result<(RequestSender, ResponseReceiver)> {
        let Self {
            config,
            region,
            inbound,
            outbound,
            resources,
        } = self;
        let outbound = outbound.ok_or(Error::NotConnected)?;
        let receiver_region = SharedRegion::open_by_key(region.key())?;
        let in_flight = Arc::new(AtomicUsize::new(0));

        let sender = RequestSender {
            region,
            outbound,
            in_flight: Arc::clone(&in_flight),
            max_in_flight: config.max_in_flight.max(1),
            poll: config.backpressure_poll,
            max_waits: config.max_consecutive_waits,
            _resources: Arc::clone(&resources),
        };
        let receiver = ResponseReceiver {
            region: receiver_region,
            inbound,
            in_flight,
            _resources: resources,
        };
        Ok((sender, receiver))
    }
}

/// Producer half: writes requests into the region and signals the daemon.
pub struct RequestSender {
    region: SharedRegion,
    outbound: PipeWriter,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    poll: Duration,
    max_waits: u32,
    _resources: Arc<SessionResources>,
}

impl RequestSender {
    /// Requests sent and not yet received.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Send `batch` as the next request.
    ///
    /// Waits while the in-flight cap is reached. The region is never grown
    /// from this side, so a request larger than the capacity fails.
    pub fn send(&mut self, batch: TensorBatch) -> Result<()> {
        let mut waits = 0;
        while self.in_flight.load(Ordering::Acquire) >= self.max_in_flight {
            if waits >= self.max_waits {
                return Err(Error::Backpressure { waits });
            }
            thread::sleep(self.poll);
            waits += 1;
        }

        let encoded = encode_request(&batch)?;
        drop(batch);
        self.region.write(&encoded)?;

        // Counted before signalling so the receiver can never decrement first.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.outbound.send(defaults::SIGNAL_BYTE) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into());
        }
        log::debug!("Sent request of {} bytes", encoded.len());
        Ok(())
    }
}

/// Consumer half: waits for ready signals and reads responses.
pub struct ResponseReceiver {
    region: SharedRegion,
    inbound: PipeReader,
    in_flight: Arc<AtomicUsize>,
    _resources: Arc<SessionResources>,
}

impl ResponseReceiver {
    /// Wait up to `timeout` for the next response. `Ok(None)` on timeout;
    /// `PipeError::EndOfChannel` once the daemon has gone away.
    ///
    /// A timeout abandons the oldest outstanding request and gives its
    /// in-flight slot back, so a cycle the daemon dropped cannot hold the
    /// sender at the cap.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<TensorBatch>> {
        let response = self.next_response(timeout)?;
        if response.is_none() {
            self.abandon();
        }
        Ok(response)
    }

    fn next_response(&mut self, timeout: Duration) -> Result<Option<TensorBatch>> {
        if self.inbound.timed_read(timeout)?.is_none() {
            return Ok(None);
        }

        let decoded = self.read_response();
        // The response slot is consumed whether or not it decoded.
        self.release_slot();
        decoded.map(Some)
    }

    fn release_slot(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn abandon(&self) {
        if self.release_slot() {
            log::warn!("No response before timeout; abandoning outstanding request");
        }
    }

    fn read_response(&mut self) -> Result<TensorBatch> {
        let attachment = self.region.read()?;
        let decoded = decode_response(attachment.payload()?);
        attachment.close()?;
        let batch = decoded?;
        log::debug!("Received response with {} tensors", batch.count());
        Ok(batch)
    }

    /// Current region capacity as seen by this half.
    pub fn region_capacity(&mut self) -> Result<usize> {
        Ok(self.region.capacity()?)
    }

    /// Block until a response arrives, the daemon goes away or `deadline`
    /// passes. Passing the deadline abandons one outstanding request.
    pub fn receive_until(&mut self, deadline: Instant) -> Result<TensorBatch> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon();
                return Err(Error::Timeout("response"));
            }
            if let Some(batch) = self.next_response(remaining)? {
                return Ok(batch);
            }
        }
    }
}
