//! Hub fan-out under load: repeated updates to one device collapse into
//! a single `deviceChanged` event, and a client that stops reading is
//! eventually caught up with a `resync` sentinel rather than an
//! unbounded backlog.

use std::sync::Arc;
use std::time::Duration;

use echonet_hub::HubState;
use echonet_protocol::{DeviceKey, Eoj, EventPayload, ServerMessage};
use echonet_registry::{AccessRules, Registry};
use echonet_transport::MockTransport;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

async fn start_hub(registry: Arc<Registry>) -> (std::net::SocketAddr, Arc<Registry>) {
    let (mock, _handle) = MockTransport::new();
    let engine = echonet_engine::Engine::start(Arc::new(mock), registry.clone(), Eoj::new(0x05, 0xFF, 0x01));
    let state = HubState {
        engine,
        registry: registry.clone(),
        auth_token: None,
    };
    let router = echonet_hub::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, registry)
}

fn device(instance: u8) -> DeviceKey {
    DeviceKey::new("192.168.1.60".parse().unwrap(), Eoj::new(0x02, 0x90, instance))
}

fn subscribe_message() -> Message {
    Message::Text(
        serde_json::json!({"type": "subscribe", "requestId": null, "payload": {"enabled": true}})
            .to_string()
            .into(),
    )
}

#[tokio::test]
async fn repeated_updates_to_one_device_collapse_into_one_event() {
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let (addr, registry) = start_hub(registry).await;

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut write, mut read) = ws.split();
    write.send(subscribe_message()).await.unwrap();

    let target = device(1);
    for step in 0u8..20 {
        registry
            .upsert_property(target, 0x80, vec![step], AccessRules { get: true, ..Default::default() })
            .await;
    }

    // Give the 20ms coalescing tick a couple of cycles to flush.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let mut device_events = 0u32;
    while let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(200), read.next()).await
    {
        if let Ok(ServerMessage::Event { payload: EventPayload::DeviceChanged { device, .. }, .. }) =
            serde_json::from_str::<ServerMessage>(&text)
        {
            assert_eq!(device, target);
            device_events += 1;
        }
    }

    assert_eq!(
        device_events, 1,
        "20 rapid updates to the same device must collapse to a single deviceChanged event"
    );
}

#[tokio::test]
async fn a_client_that_stops_reading_eventually_gets_a_resync() {
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let (addr, registry) = start_hub(registry).await;

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut write, mut read) = ws.split();
    write.send(subscribe_message()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Flood with enough *distinct* devices that nothing coalesces, while
    // never reading — the outbound queue (capacity 256) will not drain.
    for instance in 0u8..=255 {
        registry
            .upsert_property(device(instance), 0x80, vec![instance], AccessRules { get: true, ..Default::default() })
            .await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut saw_resync = false;
    for _ in 0..400 {
        match tokio::time::timeout(Duration::from_millis(50), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(ServerMessage::Event { payload: EventPayload::Resync, .. }) =
                    serde_json::from_str::<ServerMessage>(&text)
                {
                    saw_resync = true;
                    break;
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }

    assert!(
        saw_resync,
        "a client that falls far enough behind must eventually see a resync sentinel"
    );
}

#[tokio::test]
async fn one_stalled_and_one_live_session_see_independent_backpressure() {
    let registry = Arc::new(Registry::empty(tempfile::tempdir().unwrap().path()));
    let (addr, registry) = start_hub(registry).await;

    let (stalled_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut stalled_write, mut stalled_read) = stalled_ws.split();
    stalled_write.send(subscribe_message()).await.unwrap();

    let (live_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (mut live_write, mut live_read) = live_ws.split();
    live_write.send(subscribe_message()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Drain the live session in the background, recording every
    // deviceChanged event's sequence number as it arrives.
    let seqs = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let seqs_for_task = seqs.clone();
    let live_task = tokio::spawn(async move {
        while let Some(Ok(Message::Text(text))) = live_read.next().await {
            if let Ok(ServerMessage::Event {
                seq,
                payload: EventPayload::DeviceChanged { .. },
            }) = serde_json::from_str::<ServerMessage>(&text)
            {
                seqs_for_task.lock().await.push(seq);
            }
        }
    });

    // The stalled session never reads again from here on — its outbound
    // queue (capacity 256) will back up under the same flood.
    let target = device(2);
    for step in 0u32..1000 {
        registry
            .upsert_property(target, 0x80, step.to_le_bytes().to_vec(), AccessRules { get: true, ..Default::default() })
            .await;
        if step % 25 == 0 {
            // Let real time pass so the 20ms coalescing tick gets a
            // chance to run between bursts of writes instead of every
            // one of the 1000 updates landing in a single staging slot.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    live_task.abort();

    let observed = seqs.lock().await.clone();
    assert!(
        !observed.is_empty(),
        "the live session must observe at least one deviceChanged event out of the 1000 updates"
    );
    for pair in observed.windows(2) {
        assert_eq!(
            pair[1],
            pair[0] + 1,
            "sequence numbers observed by a session that keeps reading must be contiguous, no gaps, \
             even while another session on the same device is stalled"
        );
    }

    // The stalled session is read only now, well after the flood — its
    // queue must have stayed bounded rather than growing without limit,
    // and the last thing it ever sees is a resync sentinel.
    let mut stalled_messages = 0u32;
    let mut last_event = None;
    while let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(50), stalled_read.next()).await
    {
        stalled_messages += 1;
        if let Ok(msg @ ServerMessage::Event { .. }) = serde_json::from_str::<ServerMessage>(&text) {
            last_event = Some(msg);
        }
    }
    assert!(
        stalled_messages <= 257,
        "the stalled session's queue must never hold more than its 256-message capacity plus one resync"
    );
    assert!(
        matches!(
            last_event,
            Some(ServerMessage::Event { payload: EventPayload::Resync, .. })
        ),
        "the stalled session's queue must end with a resync event as its tail"
    );
}
