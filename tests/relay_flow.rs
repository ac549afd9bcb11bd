//! Matrix-to-IRC relay scenarios: sender rendering, line budgeting,
//! pastebin offloading, edits and loop prevention.

mod common;

use common::{edit_event, text_event, Call, TestBed, BOT, NETWORK, OWNER};
use slirc_bridge::matrix::{MessageContent, MessageEvent};
use slirc_bridge::rooms::channel::ChannelRoom;
use slirc_bridge::rooms::direct::DirectRoom;
use slirc_bridge::rooms::{
    ChannelRoomConfig, DirectRoomConfig, PlumbedRoomConfig, RoomConfig, RoomInput, RoomLogic,
};

const PLUMBED_ROOM: &str = "!plumbed:example.com";
const DIRECT_ROOM: &str = "!direct:example.com";

fn plumbed_config(max_lines: usize, use_pastebin: bool) -> PlumbedRoomConfig {
    PlumbedRoomConfig {
        channel: ChannelRoomConfig {
            name: "#chan".to_string(),
            network: NETWORK.to_string(),
            key: None,
            media: Vec::new(),
        },
        max_lines,
        use_pastebin,
        use_displaynames: false,
        use_disambiguation: false,
        use_zwsp: false,
        allow_notice: false,
        need_invite: false,
        member_sync: Default::default(),
    }
}

async fn plumbed_room(bed: &TestBed, config: PlumbedRoomConfig) -> ChannelRoom {
    bed.api.put_member(PLUMBED_ROOM, OWNER, Some("op"));
    bed.api.put_member(PLUMBED_ROOM, BOT, None);
    bed.api.put_member(PLUMBED_ROOM, "@alice:x.y", Some("Bob"));
    bed.api.put_member(PLUMBED_ROOM, "@alice2:x.y", Some("Bob"));

    ChannelRoom::restore_plumbed(
        bed.bridge.clone(),
        PLUMBED_ROOM,
        config,
        bed.network.clone(),
        Some(bed.irc_sender()),
    )
    .await
    .expect("restore plumbed room")
}

async fn direct_room(bed: &TestBed) -> DirectRoom {
    let puppet = bed.bridge.puppet_user_id(NETWORK, "alice");
    bed.api.put_member(DIRECT_ROOM, OWNER, Some("op"));
    bed.api.put_member(DIRECT_ROOM, BOT, None);
    bed.api.put_member(DIRECT_ROOM, &puppet, Some("alice"));

    DirectRoom::restore(
        bed.bridge.clone(),
        DIRECT_ROOM,
        DirectRoomConfig {
            name: "alice".to_string(),
            network: NETWORK.to_string(),
            media: Vec::new(),
        },
        bed.network.clone(),
        Some(bed.irc_sender()),
    )
    .await
    .expect("restore direct room")
}

fn media_event(event_id: &str, sender: &str, url: &str) -> MessageEvent {
    let mut content = MessageContent::default();
    content.msgtype = "m.image".to_string();
    content.body = "cat.png".to_string();
    content.url = Some(url.to_string());
    MessageEvent {
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        content,
    }
}

#[tokio::test]
async fn plumbed_sender_rendering_with_zwsp_and_disambiguation() {
    let bed = TestBed::new();
    let mut config = plumbed_config(0, false);
    config.use_displaynames = true;
    config.use_disambiguation = true;
    config.use_zwsp = true;
    let mut room = plumbed_room(&bed, config).await;

    room.handle(RoomInput::MxMessage(text_event("$e1", "@alice:x.y", "hello")))
        .await;

    let lines = bed.irc.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].kind, "privmsg");
    assert_eq!(lines[0].target, "#chan");
    assert_eq!(lines[0].text, "<B\u{200B}ob (@alice:x.y)> hello");

    // A read receipt follows the relay.
    assert_eq!(bed.api.receipts(PLUMBED_ROOM), vec!["$e1"]);
}

#[tokio::test]
async fn bridge_and_puppet_messages_never_relay() {
    let bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(0, false)).await;

    room.handle(RoomInput::MxMessage(text_event("$bot", BOT, "loop?")))
        .await;
    let puppet = bed.bridge.puppet_user_id(NETWORK, "alice");
    room.handle(RoomInput::MxMessage(text_event("$pup", &puppet, "loop?")))
        .await;

    assert!(bed.irc.lines().is_empty());
    assert!(bed.api.receipts(PLUMBED_ROOM).is_empty());
}

#[tokio::test]
async fn pastebin_truncation_uploads_and_reacts() {
    let mut bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(3, true)).await;

    let body = (1..=10).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
    room.handle(RoomInput::MxMessage(text_event("$long", "@alice:x.y", &body)))
        .await;

    let texts = bed.irc.texts();
    assert_eq!(texts.len(), 3);
    assert_eq!(texts[0], "<@alice:x.y> line1");
    assert_eq!(texts[1], "line2");
    assert!(texts[2].starts_with("... long message truncated: https://hs.test/"));
    assert!(texts[2].ends_with("(10 lines)"));

    let reactions = bed.api.reactions(PLUMBED_ROOM);
    assert_eq!(reactions[0], ("$long".to_string(), "\u{2702}".to_string()));
    assert_eq!(reactions[1], ("$long".to_string(), "\u{1F4DD}".to_string()));

    assert!(bed
        .api
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Upload { content_type, .. }
            if content_type == "text/plain; charset=UTF-8")));

    // The upload landed in the persisted media log.
    let configs = bed.saved_configs();
    let Some(RoomConfig::Plumbed(saved)) = configs.last() else {
        panic!("expected plumbed config save");
    };
    assert_eq!(saved.channel.media.len(), 1);
    assert!(saved.channel.media[0].url.starts_with("mxc://test/"));
}

#[tokio::test]
async fn max_lines_one_with_pastebin_sends_only_the_url() {
    let bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(1, true)).await;

    room.handle(RoomInput::MxMessage(text_event(
        "$long",
        "@alice:x.y",
        "a\nb\nc",
    )))
    .await;

    let texts = bed.irc.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("<@alice:x.y> https://hs.test/"));
    assert!(texts[0].ends_with("(long message, 3 lines)"));
}

#[tokio::test]
async fn unlimited_rooms_never_truncate_but_count_lines() {
    let bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(0, false)).await;

    room.handle(RoomInput::MxMessage(text_event(
        "$multi",
        "@alice:x.y",
        "one\ntwo\nthree",
    )))
    .await;

    let texts = bed.irc.texts();
    assert_eq!(texts, vec!["<@alice:x.y> one", "two", "three"]);

    let reactions = bed.api.reactions(PLUMBED_ROOM);
    assert_eq!(
        reactions,
        vec![("$multi".to_string(), "\u{2702} 3 lines".to_string())]
    );
}

#[tokio::test]
async fn notice_relay_follows_policy() {
    let bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(0, false)).await;

    let mut event = text_event("$n1", "@alice:x.y", "psst");
    event.content.msgtype = "m.notice".to_string();
    room.handle(RoomInput::MxMessage(event.clone())).await;

    // Dropped, but still receipted.
    assert!(bed.irc.lines().is_empty());
    assert_eq!(bed.api.receipts(PLUMBED_ROOM), vec!["$n1"]);

    let mut config = plumbed_config(0, false);
    config.allow_notice = true;
    let mut room = plumbed_room(&bed, config).await;
    event.event_id = "$n2".to_string();
    room.handle(RoomInput::MxMessage(event)).await;

    let lines = bed.irc.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].kind, "notice");
    assert_eq!(lines[0].text, "<@alice:x.y> psst");
}

#[tokio::test]
async fn media_log_is_bounded_when_persisted() {
    let mut bed = TestBed::new();
    let mut room = plumbed_room(&bed, plumbed_config(0, false)).await;

    for i in 0..7 {
        room.handle(RoomInput::MxMessage(media_event(
            &format!("$m{i}"),
            "@alice:x.y",
            &format!("mxc://x.y/file{i}"),
        )))
        .await;
    }

    let configs = bed.saved_configs();
    let Some(RoomConfig::Plumbed(saved)) = configs.last() else {
        panic!("expected plumbed config save");
    };
    assert_eq!(saved.channel.media.len(), 5);
    // Most recent entries survive.
    assert_eq!(saved.channel.media[4].url, "mxc://x.y/file6");
    assert_eq!(saved.channel.media[0].url, "mxc://x.y/file2");
}

#[tokio::test]
async fn edits_send_compact_diff_lines() {
    let bed = TestBed::new();
    let mut room = direct_room(&bed).await;
    bed.api
        .put_event(text_event("$e1", OWNER, "the quick brown fox"));

    room.handle(RoomInput::MxMessage(text_event(
        "$e1",
        OWNER,
        "the quick brown fox",
    )))
    .await;
    room.handle(RoomInput::MxMessage(edit_event(
        "$e2",
        OWNER,
        "$e1",
        "the quick red fox",
    )))
    .await;

    assert_eq!(bed.irc.texts(), vec!["the quick brown fox", "* red"]);
}

#[tokio::test]
async fn edit_of_untracked_event_resends_in_full() {
    let bed = TestBed::new();
    let mut room = direct_room(&bed).await;
    bed.api.put_event(text_event("$elsewhere", OWNER, "old"));

    room.handle(RoomInput::MxMessage(text_event("$e1", OWNER, "first")))
        .await;
    // Edit targets some other, older event.
    room.handle(RoomInput::MxMessage(edit_event(
        "$e3",
        OWNER,
        "$elsewhere",
        "revised text",
    )))
    .await;

    assert_eq!(bed.irc.texts(), vec!["first", "revised text"]);
}

#[tokio::test]
async fn re_edit_diffs_against_previous_edit() {
    let bed = TestBed::new();
    let mut room = direct_room(&bed).await;
    bed.api.put_event(text_event("$e1", OWNER, "count one two"));

    room.handle(RoomInput::MxMessage(text_event(
        "$e1",
        OWNER,
        "count one two",
    )))
    .await;
    room.handle(RoomInput::MxMessage(edit_event(
        "$e2",
        OWNER,
        "$e1",
        "count one three",
    )))
    .await;
    room.handle(RoomInput::MxMessage(edit_event(
        "$e3",
        OWNER,
        "$e1",
        "count one four",
    )))
    .await;

    assert_eq!(
        bed.irc.texts(),
        vec!["count one two", "* three", "* four"]
    );
}

#[tokio::test]
async fn media_message_sends_resolved_url() {
    let mut bed = TestBed::new();
    let mut room = direct_room(&bed).await;

    room.handle(RoomInput::MxMessage(media_event(
        "$img",
        OWNER,
        "mxc://example.com/pic",
    )))
    .await;

    let lines = bed.irc.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].kind, "privmsg");
    assert_eq!(lines[0].target, "alice");
    assert!(lines[0].text.contains("/_matrix/media/v3/download/example.com/pic"));

    assert_eq!(
        bed.api.reactions(DIRECT_ROOM),
        vec![("$img".to_string(), "\u{1F517}".to_string())]
    );
    assert!(!bed.saved_configs().is_empty());
}

#[tokio::test]
async fn plumbing_a_room_snapshots_members_and_announces() {
    let mut bed = TestBed::new();
    let alias = "#shared:example.com";
    bed.api.put_member(alias, OWNER, Some("op"));
    bed.api.put_member(alias, "@alice:x.y", Some("Bob"));
    bed.api.state.lock().insert(
        (alias.to_string(), "m.room.join_rules".to_string()),
        serde_json::json!({"join_rule": "invite"}),
    );

    let handle = slirc_bridge::rooms::plumbed::plumb(
        bed.bridge.clone(),
        bed.network.clone(),
        Some(bed.irc_sender()),
        alias,
        "#chan",
        None,
    )
    .await
    .expect("plumb");
    assert_eq!(handle.id, alias);

    // The IRC channel was joined right away.
    assert!(bed
        .irc
        .lines()
        .iter()
        .any(|line| line.kind == "join" && line.target == "#chan"));

    // Defaults plus the probed join rule were persisted.
    let configs = bed.saved_configs();
    let Some(RoomConfig::Plumbed(saved)) = configs.last() else {
        panic!("expected plumbed config save");
    };
    assert_eq!(saved.channel.name, "#chan");
    assert_eq!(saved.max_lines, 5);
    assert!(saved.use_pastebin);
    assert!(saved.use_disambiguation);
    assert!(saved.need_invite);

    // The network room learned about its new child and the announcement.
    let mut saw_child = false;
    let mut saw_announcement = false;
    while let Ok(input) = bed.network_rx.try_recv() {
        match input {
            RoomInput::ChildOpened { key, .. } => {
                assert_eq!(key, "#chan");
                saw_child = true;
            }
            RoomInput::Notice { text, .. } => {
                if text.contains("to unplumb just kick me out") {
                    saw_announcement = true;
                }
            }
            _ => {}
        }
    }
    assert!(saw_child && saw_announcement);
}

#[tokio::test]
async fn disconnected_network_reports_instead_of_relaying() {
    let bed = TestBed::new();
    let mut room = direct_room(&bed).await;
    bed.irc.up.store(false, std::sync::atomic::Ordering::Relaxed);

    room.handle(RoomInput::MxMessage(text_event("$e1", OWNER, "anyone?")))
        .await;

    assert!(bed.irc.lines().is_empty());
    let sent = bed.api.sent_messages(DIRECT_ROOM);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.body, "Not connected to network.");
}
