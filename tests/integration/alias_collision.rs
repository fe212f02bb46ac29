//! Alias assignment: a name may point at only one device, but a second
//! `addAlias` for the same name and the same device is a harmless no-op
//! rather than a collision.

use echonet_protocol::{DeviceKey, Eoj};
use echonet_registry::{Registry, RegistryError};

fn device(instance: u8) -> DeviceKey {
    DeviceKey::new("192.168.1.50".parse().unwrap(), Eoj::new(0x02, 0x90, instance))
}

#[tokio::test]
async fn second_alias_for_a_different_device_is_rejected() {
    let registry = Registry::empty(tempfile::tempdir().unwrap().path());
    let living_room = device(1);
    let kitchen = device(2);
    registry.touch_device(living_room).await;
    registry.touch_device(kitchen).await;

    registry.add_alias("Living Room Light", living_room).await.unwrap();

    let err = registry
        .add_alias("Living Room Light", kitchen)
        .await
        .expect_err("alias already points elsewhere");
    assert!(matches!(err, RegistryError::AliasInUse(name) if name == "Living Room Light"));
}

#[tokio::test]
async fn re_adding_the_same_alias_to_the_same_device_is_idempotent() {
    let registry = Registry::empty(tempfile::tempdir().unwrap().path());
    let living_room = device(1);
    registry.touch_device(living_room).await;

    registry.add_alias("Living Room Light", living_room).await.unwrap();
    registry.add_alias("Living Room Light", living_room).await.unwrap();

    let aliases = registry.list_aliases().await;
    assert_eq!(aliases.get("Living Room Light"), Some(&living_room));
}

#[tokio::test]
async fn assigning_a_new_alias_drops_the_devices_prior_one() {
    let registry = Registry::empty(tempfile::tempdir().unwrap().path());
    let living_room = device(1);
    registry.touch_device(living_room).await;

    registry.add_alias("Old Name", living_room).await.unwrap();
    registry.add_alias("New Name", living_room).await.unwrap();

    let aliases = registry.list_aliases().await;
    assert_eq!(aliases.get("New Name"), Some(&living_room));
    assert_eq!(aliases.get("Old Name"), None, "aliases are bijective: the old one is dropped");
}

#[tokio::test]
async fn alias_for_an_unknown_device_is_rejected() {
    let registry = Registry::empty(tempfile::tempdir().unwrap().path());
    let err = registry
        .add_alias("Ghost", device(9))
        .await
        .expect_err("device was never touched into the registry");
    assert!(matches!(err, RegistryError::UnknownDevice(_)));
}

#[tokio::test]
async fn malformed_alias_names_are_rejected() {
    let registry = Registry::empty(tempfile::tempdir().unwrap().path());
    let living_room = device(1);
    registry.touch_device(living_room).await;

    let err = registry
        .add_alias("@not-an-alias", living_room)
        .await
        .expect_err("alias names must not start with '@'");
    assert!(matches!(err, RegistryError::AliasInvalid(_)));

    let err = registry
        .add_alias("has space", living_room)
        .await
        .expect_err("alias names must not contain whitespace");
    assert!(matches!(err, RegistryError::AliasInvalid(_)));
}
