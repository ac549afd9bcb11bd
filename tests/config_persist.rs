//! Persistence flows: first-load behavior, the save queue, config
//! round-trips through account data, and restore-time validity.

mod common;

use common::{RecordingMatrix, TestBed, BOT, NETWORK, OWNER};
use serde_json::json;
use slirc_bridge::matrix::MatrixClient;
use slirc_bridge::persistence::{self, SaveOp};
use slirc_bridge::rooms::direct::DirectRoom;
use slirc_bridge::rooms::{DirectRoomConfig, RoomConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn first_load_saves_defaults() {
    let api = RecordingMatrix::new();
    let client: Arc<dyn MatrixClient> = api.clone();

    let blob = persistence::load(&client, OWNER).await.unwrap();
    assert!(blob.rooms.is_empty());

    // The 404 was absorbed and defaults were written back.
    let saved = api.account_data.lock().clone().unwrap();
    assert_eq!(saved, json!({"rooms": {}}));
}

#[tokio::test]
async fn existing_blob_loads_and_parses_rooms() {
    let api = RecordingMatrix::new();
    *api.account_data.lock() = Some(json!({
        "member_sync": "full",
        "rooms": {
            "!d:example.com": {"type": "direct", "name": "alice", "network": "oftc"},
            "!p:example.com": {
                "type": "plumbed", "name": "#chan", "network": "oftc",
                "max_lines": 5, "use_pastebin": true, "use_displaynames": false,
                "use_disambiguation": true, "use_zwsp": false, "allow_notice": false
            }
        }
    }));
    let client: Arc<dyn MatrixClient> = api.clone();

    let blob = persistence::load(&client, OWNER).await.unwrap();
    assert!(matches!(
        blob.room_config("!d:example.com"),
        Some(RoomConfig::Direct(_))
    ));
    assert!(matches!(
        blob.room_config("!p:example.com"),
        Some(RoomConfig::Plumbed(_))
    ));
    // Globals owned by the bootstrap survive untouched.
    assert_eq!(blob.globals.get("member_sync"), Some(&json!("full")));
}

#[tokio::test]
async fn save_queue_merges_room_entries() {
    let api = RecordingMatrix::new();
    let client: Arc<dyn MatrixClient> = api.clone();
    let blob = persistence::load(&client, OWNER).await.unwrap();
    let save_tx = persistence::spawn_saver(client, OWNER.to_string(), blob);

    save_tx
        .send(SaveOp::Room {
            room_id: "!d:example.com".to_string(),
            config: RoomConfig::Direct(DirectRoomConfig {
                name: "alice".to_string(),
                network: NETWORK.to_string(),
                media: Vec::new(),
            }),
        })
        .unwrap();

    let saved = wait_for(&api, |data| {
        data.get("rooms")
            .and_then(|rooms| rooms.get("!d:example.com"))
            .is_some()
    })
    .await;
    assert_eq!(saved["rooms"]["!d:example.com"]["name"], json!("alice"));

    save_tx
        .send(SaveOp::RemoveRoom {
            room_id: "!d:example.com".to_string(),
        })
        .unwrap();

    wait_for(&api, |data| {
        data.get("rooms")
            .map(|rooms| rooms.as_object().is_some_and(|map| map.is_empty()))
            .unwrap_or(false)
    })
    .await;
}

/// Poll the fake's account data until `check` passes (the saver runs on its
/// own task).
async fn wait_for(
    api: &Arc<RecordingMatrix>,
    check: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    for _ in 0..100 {
        if let Some(data) = api.account_data.lock().clone() {
            if check(&data) {
                return data;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saver never produced the expected account data");
}

#[tokio::test]
async fn restored_room_without_operator_is_invalid() {
    let bed = TestBed::new();
    // Only the bot and the puppet are left in the room.
    bed.api.put_member("!stale:example.com", BOT, None);
    bed.api.put_member(
        "!stale:example.com",
        &bed.bridge.puppet_user_id(NETWORK, "alice"),
        Some("alice"),
    );

    let room = DirectRoom::restore(
        bed.bridge.clone(),
        "!stale:example.com",
        DirectRoomConfig {
            name: "alice".to_string(),
            network: NETWORK.to_string(),
            media: Vec::new(),
        },
        bed.network.clone(),
        None,
    )
    .await
    .unwrap();

    assert!(!room.is_valid());
}

#[tokio::test]
async fn restored_room_with_operator_is_valid() {
    let bed = TestBed::new();
    bed.api.put_member("!ok:example.com", OWNER, Some("op"));
    bed.api.put_member("!ok:example.com", BOT, None);

    let room = DirectRoom::restore(
        bed.bridge.clone(),
        "!ok:example.com",
        DirectRoomConfig {
            name: "alice".to_string(),
            network: NETWORK.to_string(),
            media: Vec::new(),
        },
        bed.network.clone(),
        None,
    )
    .await
    .unwrap();

    assert!(room.is_valid());
}

#[tokio::test]
async fn puppet_identity_is_stable_and_reversible() {
    let bed = TestBed::new();

    let user_id = bed.bridge.puppet_user_id(NETWORK, "We|rd^Nick");
    assert!(user_id.starts_with("@irc_oftc_"));
    assert!(user_id.ends_with(":example.com"));
    assert!(bed.bridge.is_puppet(&user_id));

    // Deterministic and case-insensitive.
    assert_eq!(user_id, bed.bridge.puppet_user_id(NETWORK, "we|rd^nick"));

    // Reversible on our own server.
    assert_eq!(
        bed.bridge.puppet_nick(NETWORK, &user_id).as_deref(),
        Some("we|rd^nick")
    );

    // Foreign users are never ours.
    assert!(!bed.bridge.is_puppet("@irc_oftc_alice:other.server"));
    assert!(!bed.bridge.is_puppet(OWNER));
}
