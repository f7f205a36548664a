//! Request/response exchange within the initial region capacity.

use oaax_ipc::{encode_request, encode_response, DataType, Tensor, TensorBatch};

use crate::fixture::{f32_tensor, i64_tensor, ScriptedRuntime, Session};

fn detection_output() -> TensorBatch {
    TensorBatch::new(vec![
        f32_tensor(Some("boxes"), vec![1, 8, 4], 0.0),
        i64_tensor("classes", &[0, 1, 2, 3, 4, 5, 6, 7]),
    ])
}

/// Ten inputs in, two outputs back, no reallocation.
#[test]
fn test_exchange_in_place() {
    let runtime = ScriptedRuntime::new(|_| detection_output());
    let mut session = Session::start(1024, runtime);

    let request = TensorBatch::new(
        (0..10)
            .map(|i| f32_tensor(None, vec![1, 20], i as f32))
            .collect(),
    );
    let request_len = encode_request(&request).unwrap().len();
    assert!(
        request_len > 800 && request_len <= 1024,
        "request encodes to {} bytes",
        request_len
    );
    let response_len = encode_response(&detection_output()).unwrap().len();
    assert!(response_len < 1024, "response encodes to {} bytes", response_len);

    let response = session.round_trip(request.clone());

    assert_eq!(response.count(), 2);
    let boxes = response.get("boxes").expect("boxes output");
    assert_eq!(boxes.data_type, DataType::Float32);
    assert_eq!(boxes.shape, vec![1, 8, 4]);
    assert_eq!(boxes.to_f32_vec()[31], 31.0);
    let classes = response.get("classes").expect("classes output");
    assert_eq!(classes.data_type, DataType::Int64);
    assert_eq!(classes.shape, vec![8]);

    assert_eq!(session.receiver.region_capacity().unwrap(), 1024);

    let stats = session.stop();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.grows, 0);
    assert_eq!(stats.dropped, 0);

    let log = session.log.lock().unwrap();
    assert_eq!(log.inputs.len(), 1);
    let seen = &log.inputs[0];
    assert_eq!(seen.count(), 10);
    for (sent, received) in request.iter().zip(seen.iter()) {
        assert_eq!(received.shape, vec![1, 20]);
        assert_eq!(received.data, sent.data);
    }
    assert_eq!(log.cleanups, 1);
    assert!(log.destroyed, "runtime destroyed at shutdown");
}

/// Several sequential cycles reuse the same region.
#[test]
fn test_repeated_exchanges() {
    let runtime = ScriptedRuntime::new(|input| {
        // Echo the first input back, named.
        let mut echoed = input.tensors[0].clone();
        echoed.name = Some("echo".to_string());
        TensorBatch::new(vec![echoed])
    });
    let mut session = Session::start(1024, runtime);

    for round in 0..5 {
        let request = TensorBatch::new(vec![f32_tensor(None, vec![2, 3], round as f32)]);
        let response = session.round_trip(request);
        let echo = response.get("echo").unwrap();
        assert_eq!(echo.shape, vec![2, 3]);
        assert_eq!(echo.to_f32_vec()[0], round as f32);
    }

    assert_eq!(session.stop().cycles, 5);
}

/// Outputs of a type without a response width are left out of the
/// response; the remaining outputs keep their names and order.
#[test]
fn test_unsupported_output_type_is_skipped() {
    let runtime = ScriptedRuntime::new(|_| {
        TensorBatch::new(vec![
            f32_tensor(Some("scores"), vec![3], 0.5),
            Tensor::new(Some("half".into()), DataType::Uint16, vec![2], vec![1, 0, 2, 0]),
            Tensor::new(Some("ids".into()), DataType::Int32, vec![1], 9i32.to_le_bytes().to_vec()),
        ])
    });
    let mut session = Session::start(1024, runtime);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![1], 0.0)]));

    assert_eq!(response.count(), 2);
    assert!(response.get("half").is_none());
    assert_eq!(response.tensors[0].name.as_deref(), Some("scores"));
    assert_eq!(response.tensors[1].name.as_deref(), Some("ids"));
}

/// An empty response is still signalled.
#[test]
fn test_empty_output_is_delivered() {
    let runtime = ScriptedRuntime::new(|_| TensorBatch::default());
    let mut session = Session::start(1024, runtime);

    let response = session.round_trip(TensorBatch::new(vec![f32_tensor(None, vec![4], 1.0)]));
    assert!(response.is_empty());
}
