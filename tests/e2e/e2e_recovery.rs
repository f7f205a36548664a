//! Per-cycle failures are logged and skipped; the session keeps serving.

use std::time::Duration;

use oaax_ipc::{shm, DataType, Error, PipeWriter, RegionError, SharedRegion, Tensor, TensorBatch};

use crate::fixture::{f32_tensor, ScriptedRuntime, Session, WAIT_TIMEOUT};

/// Signal the daemon from a second writer on the engine pipe; the daemon
/// cannot tell it apart from the session's own sender.
fn signal(session: &Session) {
    let mut writer = PipeWriter::open(&session.params.engine_pipe).unwrap();
    writer.send(b'a').unwrap();
    writer.close().unwrap();
}

fn signal_raw(session: &Session, payload: &[u8]) {
    let mut region = SharedRegion::open(session.params.region_key, session.params.region_id);
    region.write(payload).unwrap();
    signal(session);
}

fn request_without_shapes() -> Vec<u8> {
    let mut buf = Vec::new();
    rmp::encode::write_uint(&mut buf, 1).unwrap();
    rmp::encode::write_bin(&mut buf, &[0u8; 4]).unwrap();
    rmp::encode::write_str(&mut buf, "json").unwrap();
    rmp::encode::write_bool(&mut buf, false).unwrap();
    buf
}

#[test]
fn test_malformed_requests_are_dropped() {
    let runtime = ScriptedRuntime::new(|input| input.clone());
    let mut session = Session::start(1024, runtime);

    signal_raw(&session, b"\xc1 not msgpack");
    std::thread::sleep(WAIT_TIMEOUT * 3);
    signal_raw(&session, &request_without_shapes());
    std::thread::sleep(WAIT_TIMEOUT * 3);

    // Neither produced a response.
    assert!(session
        .receiver
        .receive(Duration::from_millis(200))
        .unwrap()
        .is_none());

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![2], 3.0)]));
    assert_eq!(response.count(), 1);
    assert_eq!(response.tensors[0].to_f32_vec(), vec![3.0, 4.0]);

    let stats = session.stop();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.cycles, 1);
    assert_eq!(session.log.lock().unwrap().inputs.len(), 1);
}

/// A failing inference call still yields whatever output was produced.
#[test]
fn test_inference_failure_still_responds() {
    let runtime =
        ScriptedRuntime::new(|_| TensorBatch::new(vec![f32_tensor(Some("partial"), vec![2], 0.0)]))
            .failing();
    let mut session = Session::start(1024, runtime);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![1], 0.0)]));
    assert!(response.get("partial").is_some());

    let stats = session.stop();
    assert_eq!(stats.inference_failures, 1);
    assert_eq!(stats.cycles, 1);
    assert_eq!(session.log.lock().unwrap().cleanups, 1);
}

/// The client never grows the region; an oversized request is refused
/// before anything is signalled.
#[test]
fn test_oversized_request_is_refused() {
    let runtime = ScriptedRuntime::new(|input| input.clone());
    let mut session = Session::start(256, runtime);

    let result = session
        .sender
        .send(TensorBatch::new(vec![f32_tensor(None, vec![128], 0.0)]));
    assert!(matches!(
        result,
        Err(Error::Region(RegionError::PayloadTooLarge { capacity: 256, .. }))
    ));
    assert_eq!(session.sender.in_flight(), 0);

    // The session is still usable with a request that fits.
    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![8], 0.0)]));
    assert_eq!(response.count(), 1);
}

#[test]
fn test_backpressure_gives_up() {
    let runtime = ScriptedRuntime::new(|_| TensorBatch::default());
    let mut session = Session::start_with(runtime, |config| {
        config.region_size = 1024;
        config.backpressure_poll = Duration::from_millis(10);
        config.max_consecutive_waits = 3;
    });

    let request = || TensorBatch::new(vec![f32_tensor(None, vec![1], 0.0)]);
    session.sender.send(request()).unwrap();
    assert_eq!(session.sender.in_flight(), 1);

    // The first response is never consumed, so the cap stays reached.
    let result = session.sender.send(request());
    assert!(matches!(result, Err(Error::Backpressure { waits: 3 })));

    assert!(session
        .receiver
        .receive(Duration::from_secs(2))
        .unwrap()
        .is_some());
    assert_eq!(session.sender.in_flight(), 0);
    session.sender.send(request()).unwrap();
}

/// A response the daemon cannot encode is dropped; the receiver's timeout
/// hands the in-flight slot back so the sender is not stuck at the cap.
#[test]
fn test_dropped_cycle_releases_in_flight_slot() {
    let mut calls = 0;
    let runtime = ScriptedRuntime::new(move |input| {
        calls += 1;
        if calls == 1 {
            // Shape says 16 bytes, buffer holds 3.
            TensorBatch::new(vec![Tensor::new(
                Some("broken".into()),
                DataType::Float32,
                vec![4],
                vec![0; 3],
            )])
        } else {
            input.clone()
        }
    });
    let mut session = Session::start_with(runtime, |config| {
        config.region_size = 1024;
        config.backpressure_poll = Duration::from_millis(10);
        config.max_consecutive_waits = 20;
    });

    session
        .sender
        .send(TensorBatch::new(vec![f32_tensor(None, vec![2], 0.0)]))
        .unwrap();
    assert_eq!(session.sender.in_flight(), 1);

    assert!(session.receiver.receive(WAIT_TIMEOUT * 3).unwrap().is_none());
    assert_eq!(session.sender.in_flight(), 0);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![2], 5.0)]));
    assert_eq!(response.tensors[0].to_f32_vec(), vec![5.0, 6.0]);
    assert_eq!(session.sender.in_flight(), 0);

    let stats = session.stop();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.cycles, 1);
}

/// The region vanishing under the daemon drops that cycle only; once a
/// region exists again under the same key the loop picks it up.
#[test]
fn test_unavailable_region_is_dropped() {
    let runtime = ScriptedRuntime::new(|input| input.clone());
    let mut session = Session::start(1024, runtime);

    shm::destroy(session.params.region_id).unwrap();
    signal(&session);
    std::thread::sleep(WAIT_TIMEOUT * 3);
    assert!(session.log.lock().unwrap().inputs.is_empty());

    let (key, id) = shm::create(&session.config.key_path, session.config.discriminant, 1024).unwrap();
    assert_eq!(key, session.params.region_key);
    assert_eq!(shm::lookup(key).unwrap(), id);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![3], 1.0)]));
    assert_eq!(response.tensors[0].to_f32_vec(), vec![1.0, 2.0, 3.0]);

    let stats = session.stop();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.cycles, 1);
}
