//! Responses larger than the region force the daemon to reallocate it.

use oaax_ipc::{encode_response, shm, TensorBatch};

use crate::fixture::{f32_tensor, ScriptedRuntime, Session};

fn large_output() -> TensorBatch {
    // 512 float32 values: 2048 bytes of tensor data.
    TensorBatch::new(vec![f32_tensor(Some("heatmap"), vec![1, 512], 0.0)])
}

#[test]
fn test_grow_for_large_response() {
    let runtime = ScriptedRuntime::new(|_| large_output());
    let mut session = Session::start(1024, runtime);
    let original_id = session.params.region_id;
    let encoded_len = encode_response(&large_output()).unwrap().len();
    assert!(encoded_len >= 2048);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![4], 0.0)]));

    let heatmap = response.get("heatmap").unwrap();
    assert_eq!(heatmap.shape, vec![1, 512]);
    let values = heatmap.to_f32_vec();
    assert_eq!(values.len(), 512);
    assert_eq!(values[511], 511.0);

    // The receiver re-resolved the id and sees the grown capacity.
    let capacity = session.receiver.region_capacity().unwrap();
    assert!(capacity >= 2048, "capacity {} after grow", capacity);
    assert_eq!(capacity, encoded_len);
    let live_id = shm::lookup(session.params.region_key).unwrap();
    assert_ne!(live_id, original_id);
    assert!(shm::capacity(original_id).is_err(), "old region destroyed");

    let stats = session.stop();
    assert_eq!(stats.grows, 1);
    assert_eq!(stats.cycles, 1);
}

/// The sender still holds the pre-grow id; its next write recovers.
#[test]
fn test_sender_recovers_after_grow() {
    let runtime = ScriptedRuntime::new(|_| large_output());
    let mut session = Session::start(1024, runtime);

    for _ in 0..3 {
        let response =
            session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![2, 2], 1.0)]));
        assert_eq!(response.get("heatmap").unwrap().data.len(), 2048);
    }

    let stats = session.stop();
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.grows, 1, "later responses fit the grown region");

    let log = session.log.lock().unwrap();
    assert_eq!(log.inputs.len(), 3);
    assert!(log.inputs.iter().all(|batch| batch.tensors[0].shape == vec![2, 2]));
}
