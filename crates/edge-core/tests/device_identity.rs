//! Integration tests for device identity across the public edge-core API.
//!
//! A device key travels through several textual forms: typed on the command
//! line (`product/device`), embedded in navigation routes, and stored as two
//! columns of a registry row.  These tests check that every form refers to
//! the same device.

use edge_core::{
    device_page_route, parse_device_page_route, BookmarkEntry, ConnectionError, DeviceKey,
    PairedDeviceRecord, PairingError, PairingRoute,
};

fn record() -> PairedDeviceRecord {
    PairedDeviceRecord {
        product_id: "pr-12345678".to_string(),
        device_id: "de-abcdefgh".to_string(),
        display_name: "Garage".to_string(),
        sct: "token-1".to_string(),
        paired_at: 1_700_000_000,
    }
}

#[test]
fn test_key_typed_by_user_matches_registry_row_and_routes() {
    // Arrange
    let typed: DeviceKey = "pr-12345678/de-abcdefgh".parse().expect("valid key");
    let row = record();

    // Act
    let pair_route = PairingRoute::new(typed.clone()).with_password("pw").to_string();
    let page_route = device_page_route(&typed);

    // Assert
    assert!(row.has_key(&typed));
    assert_eq!(PairingRoute::parse(&pair_route).unwrap().key, typed);
    assert_eq!(parse_device_page_route(&page_route).unwrap(), typed);
    assert_eq!(BookmarkEntry::new(&typed, 0).key(), row.key());
}

#[test]
fn test_registry_row_uses_the_documented_column_names() {
    let json = serde_json::to_value(record()).expect("serialize");

    let mut columns: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
    columns.sort();

    assert_eq!(
        columns,
        vec!["device_id", "display_name", "paired_at", "product_id", "sct"]
    );
}

#[test]
fn test_errors_name_the_device_in_their_message() {
    let key = record().key();

    let pairing = PairingError::AlreadyPaired(key.clone()).to_string();
    let connection = ConnectionError::NotPaired(key).to_string();

    assert!(pairing.contains("pr-12345678/de-abcdefgh"), "{pairing}");
    assert!(connection.contains("pr-12345678/de-abcdefgh"), "{connection}");
}
