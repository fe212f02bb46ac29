//! Crash-safe persistence: devices/aliases/groups round-trip through the
//! on-disk JSON files, and a corrupted file is quarantined rather than
//! taking down startup.

use std::collections::HashSet;

use echonet_protocol::{DeviceKey, Eoj};
use echonet_registry::{AccessRules, Registry};

fn device(instance: u8) -> DeviceKey {
    DeviceKey::new("192.168.1.70".parse().unwrap(), Eoj::new(0x02, 0x90, instance))
}

#[tokio::test]
async fn devices_aliases_and_groups_survive_a_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let living_room = device(1);

    {
        let registry = Registry::empty(dir.path());
        registry
            .upsert_property(living_room, 0x80, vec![0x30], AccessRules { get: true, ..Default::default() })
            .await;
        registry.add_alias("Living Room Light", living_room).await.unwrap();
        registry.add_group("@lights", &[living_room]).await.unwrap();
        registry.save_all().await.unwrap();
    }

    let reloaded = Registry::load(dir.path());
    let devices = reloaded
        .list_devices(&echonet_registry::DeviceFilter {
            class_group: None,
            class: None,
            alias_prefix: None,
            group: None,
        })
        .await
        .unwrap();
    assert_eq!(devices, vec![living_room]);

    let aliases = reloaded.list_aliases().await;
    assert_eq!(aliases.get("Living Room Light"), Some(&living_room));

    let groups = reloaded.list_groups().await;
    assert_eq!(
        groups.get("@lights"),
        Some(&HashSet::from([living_room]))
    );
}

#[tokio::test]
async fn a_corrupt_devices_file_is_quarantined_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devices.json"), b"{not valid json").unwrap();

    let registry = Registry::load(dir.path());
    let devices = registry
        .list_devices(&echonet_registry::DeviceFilter {
            class_group: None,
            class: None,
            alias_prefix: None,
            group: None,
        })
        .await
        .unwrap();
    assert!(devices.is_empty(), "a corrupt file falls back to an empty store");

    let quarantined: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains("devices.json.corrupt."))
        .collect();
    assert_eq!(quarantined.len(), 1, "the corrupt file must be renamed aside, not deleted");
}

#[tokio::test]
async fn an_unwritable_device_recorded_after_quarantine_can_still_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("aliases.json"), b"not json at all").unwrap();

    let registry = Registry::load(dir.path());
    let target = device(5);
    registry.touch_device(target).await;
    registry.add_alias("Recovered", target).await.unwrap();
    registry.save_all().await.unwrap();

    let reloaded = Registry::load(dir.path());
    let aliases = reloaded.list_aliases().await;
    assert_eq!(aliases.get("Recovered"), Some(&target));
}
