//! A `SetC` carrying several properties, where the device accepts some
//! and rejects others, surfaces exactly the rejected EPCs and leaves the
//! accepted ones out of the registry only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use echonet_codec::{Frame, Property};
use echonet_engine::{Engine, EngineError};
use echonet_protocol::{DeviceKey, Eoj, Esv};
use echonet_registry::{DeviceFilter, Registry};
use echonet_transport::MockTransport;

fn controller_eoj() -> Eoj {
    Eoj::new(0x05, 0xFF, 0x01)
}

#[tokio::test]
async fn set_rejects_only_the_properties_the_device_refused() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device = DeviceKey::new("192.168.1.40".parse().unwrap(), Eoj::new(0x01, 0x35, 0x01));
    registry.touch_device(device).await;

    let mut values = HashMap::new();
    values.insert(0x80u8, vec![0x30]); // operation status: accepted
    values.insert(0xB0u8, vec![0xFF]); // out-of-range set point: rejected

    let set_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.set(device, values, Duration::from_secs(2)).await }
    });

    let (_, sent) = handle.next_sent().await.unwrap();
    let request = Frame::parse(&sent).unwrap();
    assert_eq!(request.esv, Esv::SetC);

    // Set_Res: accepted properties carry an empty EDT, the rejected one
    // echoes back a non-empty EDT per the "SNA marker" convention used
    // when a `Set_Res` (not `SetC_SNA`) still needs to flag a refusal.
    let response = Frame::new(
        request.tid,
        device.eoj,
        controller_eoj(),
        Esv::SetRes,
        vec![Property::new(0x80, vec![]), Property::new(0xB0, vec![0xFF])],
    );
    mock.push_inbound(device.ip(), response.encode().unwrap()).await;

    let result = set_task.await.unwrap();
    assert_eq!(result, Err(EngineError::Rejected(vec![0xB0])));

    let values = registry
        .list_devices(&DeviceFilter {
            class_group: None,
            class: None,
            alias_prefix: None,
            group: None,
        })
        .await
        .unwrap();
    assert_eq!(values, vec![device], "the device itself must still be known");
}

#[tokio::test]
async fn full_setc_sna_rejects_every_requested_epc() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device = DeviceKey::new("192.168.1.41".parse().unwrap(), Eoj::new(0x01, 0x35, 0x01));
    let mut values = HashMap::new();
    values.insert(0x80u8, vec![0x30]);

    let set_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.set(device, values, Duration::from_secs(2)).await }
    });

    let (_, sent) = handle.next_sent().await.unwrap();
    let request = Frame::parse(&sent).unwrap();
    let response = Frame::new(
        request.tid,
        device.eoj,
        controller_eoj(),
        Esv::SetCSna,
        vec![Property::new(0x80, vec![])],
    );
    mock.push_inbound(device.ip(), response.encode().unwrap()).await;

    let result = set_task.await.unwrap();
    assert_eq!(result, Err(EngineError::Rejected(vec![0x80])));
}
