//! Discovery happy path: a multicast `Get` against the node profile's
//! self-node instance list, answered by one device, surfaces that
//! device's objects and registers them in the registry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use echonet_codec::{Frame, Property};
use echonet_engine::Engine;
use echonet_protocol::{DeviceKey, Eoj, Esv};
use echonet_registry::Registry;
use echonet_transport::MockTransport;

fn controller_eoj() -> Eoj {
    Eoj::new(0x05, 0xFF, 0x01)
}

#[tokio::test]
async fn discover_registers_every_object_a_device_advertises() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device_ip: IpAddr = "192.168.1.20".parse().unwrap();
    let light = Eoj::new(0x02, 0x90, 0x01);

    let discover_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.discover(Duration::from_secs(2)).await }
    });

    let request = Frame::parse(&handle.next_multicast().await.unwrap()).unwrap();
    assert_eq!(request.esv, Esv::Get);
    assert_eq!(request.deoj, Eoj::NODE_PROFILE);

    let mut instance_list = vec![1u8];
    instance_list.extend_from_slice(&light.to_bytes());
    let response = Frame::new(
        request.tid,
        Eoj::NODE_PROFILE,
        controller_eoj(),
        Esv::GetRes,
        vec![Property::new(0xD6, instance_list)],
    );
    mock.push_inbound(device_ip, response.encode().unwrap()).await;

    let discovered = discover_task.await.unwrap();
    assert_eq!(discovered, vec![DeviceKey::new(device_ip, light)]);

    let devices = registry
        .list_devices(&echonet_registry::DeviceFilter {
            class_group: None,
            class: None,
            alias_prefix: None,
            group: None,
        })
        .await
        .unwrap();
    assert_eq!(devices, vec![DeviceKey::new(device_ip, light)]);
}

#[tokio::test]
async fn discover_stops_retrying_once_a_response_arrives() {
    let (mock, handle) = MockTransport::new();
    let mock = Arc::new(mock);
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let engine = Engine::start(mock.clone(), registry.clone(), controller_eoj());

    let device_ip: IpAddr = "192.168.1.21".parse().unwrap();
    let sensor = Eoj::new(0x00, 0x02, 0x01);

    let discover_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.discover(Duration::from_millis(1800)).await }
    });

    let request = Frame::parse(&handle.next_multicast().await.unwrap()).unwrap();
    let mut instance_list = vec![1u8];
    instance_list.extend_from_slice(&sensor.to_bytes());
    let response = Frame::new(
        request.tid,
        Eoj::NODE_PROFILE,
        controller_eoj(),
        Esv::GetRes,
        vec![Property::new(0xD6, instance_list)],
    );
    mock.push_inbound(device_ip, response.encode().unwrap()).await;

    // The first retry would otherwise land at +1s; once a response has
    // arrived, no further multicast frame should appear before the
    // overall collection window (1.8s) elapses.
    let second_send = tokio::time::timeout(Duration::from_millis(1500), handle.next_multicast()).await;
    assert!(second_send.is_err(), "no retry expected once a response was observed");

    discover_task.await.unwrap();
}
