//! Producer and consumer on separate threads, coordinated only by the
//! channel and the in-flight counter.

use std::thread;
use std::time::{Duration, Instant};

use oaax_ipc::TensorBatch;

use crate::fixture::{f32_tensor, ScriptedRuntime, Session, RESPONSE_TIMEOUT};

const REQUESTS: usize = 20;

#[test]
fn test_pipelined_requests_stay_ordered() {
    // Sum of the input values, so each response identifies its request.
    let runtime = ScriptedRuntime::new(|input| {
        let total: f32 = input.tensors[0].to_f32_vec().iter().sum();
        TensorBatch::new(vec![oaax_ipc::Tensor::from_f32(Some("sum"), vec![1], &[total])])
    });
    let mut session = Session::start_with(runtime, |config| {
        config.region_size = 4096;
        config.backpressure_poll = Duration::from_millis(5);
    });

    let Session {
        sender, receiver, ..
    } = &mut session;

    let received = thread::scope(|scope| {
        scope.spawn(move || {
            for i in 0..REQUESTS {
                // Values i, i+1, i+2, i+3 sum to 4i + 6.
                sender
                    .send(TensorBatch::new(vec![f32_tensor(None, vec![4], i as f32)]))
                    .unwrap();
            }
        });

        let consumer = scope.spawn(move || {
            let deadline = Instant::now() + RESPONSE_TIMEOUT * 2;
            (0..REQUESTS)
                .map(|_| receiver.receive_until(deadline).unwrap())
                .collect::<Vec<_>>()
        });
        consumer.join().unwrap()
    });

    for (i, batch) in received.iter().enumerate() {
        let sum = batch.get("sum").unwrap().to_f32_vec()[0];
        assert_eq!(sum, 4.0 * i as f32 + 6.0, "response {} out of order", i);
    }

    let stats = session.stop();
    assert_eq!(stats.cycles, REQUESTS as u64);
    assert_eq!(session.sender.in_flight(), 0);
}
