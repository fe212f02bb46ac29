//! A `Get` against a device that never answers retries at the 500ms/1s/2s
//! unicast schedule (4 sends total) and finally surfaces a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use echonet_codec::{Frame, Property};
use echonet_engine::{Engine, EngineError};
use echonet_protocol::{DeviceKey, Eoj, Esv};
use echonet_registry::Registry;
use echonet_transport::MockTransport;

fn controller_eoj() -> Eoj {
    Eoj::new(0x05, 0xFF, 0x01)
}

#[tokio::test]
async fn unresponsive_device_is_retried_four_times_then_times_out() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device = DeviceKey::new("192.168.1.30".parse().unwrap(), Eoj::new(0x01, 0x35, 0x01));

    let started = Instant::now();
    let get_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.get(device, &[0x80], Duration::from_secs(4)).await }
    });

    let mut tids = Vec::new();
    for _ in 0..4 {
        let (dest, sent) = handle.next_sent().await.unwrap();
        assert_eq!(dest, device.ip());
        let request = Frame::parse(&sent).unwrap();
        assert_eq!(request.esv, Esv::Get);
        tids.push(request.tid);
    }

    // Each retry uses a fresh TID.
    let mut sorted = tids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 4, "every retry must use a distinct TID");

    let result = get_task.await.unwrap();
    assert_eq!(result, Err(EngineError::Timeout));
    assert!(
        started.elapsed() >= Duration::from_millis(3400),
        "the 500ms/1s/2s retry schedule should take at least 3.5s before the final wait"
    );
}

#[tokio::test]
async fn a_device_that_answers_on_the_third_attempt_still_resolves() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device = DeviceKey::new("192.168.1.31".parse().unwrap(), Eoj::new(0x01, 0x35, 0x01));

    let get_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.get(device, &[0x80], Duration::from_secs(4)).await }
    });

    // First two attempts are dropped on the floor — nothing is pushed
    // back in response to them.
    let (_, first_sent) = handle.next_sent().await.unwrap();
    assert_eq!(Frame::parse(&first_sent).unwrap().esv, Esv::Get);
    let (_, second_sent) = handle.next_sent().await.unwrap();
    assert_eq!(Frame::parse(&second_sent).unwrap().esv, Esv::Get);

    // The third attempt gets a real answer.
    let (_, third_sent) = handle.next_sent().await.unwrap();
    let request = Frame::parse(&third_sent).unwrap();
    assert_eq!(request.esv, Esv::Get);
    let response = Frame::new(
        request.tid,
        device.eoj,
        controller_eoj(),
        Esv::GetRes,
        vec![Property::new(0x80, vec![0x30])],
    );
    mock.push_inbound(device.ip(), response.encode().unwrap()).await;

    let outcome = get_task.await.unwrap().expect("a late-arriving third response must still resolve the call");
    assert_eq!(outcome.values.get(&0x80), Some(&vec![0x30]));
    assert!(!outcome.is_partial());

    // No fourth retry should follow — the call already resolved.
    assert!(
        tokio::time::timeout(Duration::from_millis(500), handle.next_sent())
            .await
            .is_err(),
        "a resolved call must not keep retrying"
    );
}
