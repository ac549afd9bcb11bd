//! Shared bridge state and process orchestration.
//!
//! [`Bridge`] is the explicit context every room gets at construction: the
//! homeserver client, identity constants, the room registry and the save
//! queue. No ambient globals. This module also owns startup (restoring
//! rooms from account data) and the sync dispatch loop.

use crate::config::{BridgeConfig, MemberSync, NetworkBlock};
use crate::error::BridgeResult;
use crate::irc::LinkConfig;
use crate::matrix::{HttpMatrixClient, MatrixClient, MatrixResult};
use crate::persistence::{self, SaveOp};
use crate::rooms::network::NetworkRoom;
use crate::rooms::{
    channel::ChannelRoom, direct::DirectRoom, spawn_room, NetworkRef, RoomConfig, RoomHandle,
    RoomInput,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pause after a failed sync before retrying.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

struct BridgeInner {
    api: Arc<dyn MatrixClient>,
    owner: String,
    server_name: String,
    bot_localpart: String,
    bot_user_id: String,
    puppet_prefix: String,
    member_sync: MemberSync,
    admin: bool,
    rooms: DashMap<String, RoomHandle>,
    /// Cached puppet displaynames, to detect drift cheaply.
    displaynames: DashMap<String, String>,
    save_tx: mpsc::UnboundedSender<SaveOp>,
}

/// Cheap cloneable handle to the shared bridge state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(
        api: Arc<dyn MatrixClient>,
        config: &BridgeConfig,
        save_tx: mpsc::UnboundedSender<SaveOp>,
    ) -> Self {
        let bridge = &config.bridge;
        Self {
            inner: Arc::new(BridgeInner {
                api,
                owner: bridge.owner.clone(),
                server_name: bridge.server_name.clone(),
                bot_localpart: bridge.localpart.clone(),
                bot_user_id: format!("@{}:{}", bridge.localpart, bridge.server_name),
                puppet_prefix: bridge.puppet_prefix.clone(),
                member_sync: bridge.member_sync,
                admin: config.homeserver.admin,
                rooms: DashMap::new(),
                displaynames: DashMap::new(),
                save_tx,
            }),
        }
    }

    pub fn api(&self) -> &Arc<dyn MatrixClient> {
        &self.inner.api
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn bot_localpart(&self) -> &str {
        &self.inner.bot_localpart
    }

    pub fn bot_user_id(&self) -> &str {
        &self.inner.bot_user_id
    }

    pub fn member_sync(&self) -> MemberSync {
        self.inner.member_sync
    }

    pub fn admin(&self) -> bool {
        self.inner.admin
    }

    // -------------------------------------------------------------------------
    // Puppet identity
    // -------------------------------------------------------------------------

    /// The puppet localpart for a nick: `<prefix><network>_<escaped-nick>`.
    pub fn puppet_localpart(&self, network: &str, nick: &str) -> String {
        format!(
            "{}{}_{}",
            self.inner.puppet_prefix,
            network.to_lowercase(),
            escape_nick(nick)
        )
    }

    /// The full puppet user id for a nick on a network.
    pub fn puppet_user_id(&self, network: &str, nick: &str) -> String {
        format!(
            "@{}:{}",
            self.puppet_localpart(network, nick),
            self.inner.server_name
        )
    }

    /// Whether a user id is one of our puppets: prefix matches and it lives
    /// on our own server.
    pub fn is_puppet(&self, user_id: &str) -> bool {
        user_id.starts_with(&format!("@{}", self.inner.puppet_prefix))
            && user_id.ends_with(&format!(":{}", self.inner.server_name))
    }

    /// Invert [`Self::puppet_user_id`] for a known network.
    pub fn puppet_nick(&self, network: &str, user_id: &str) -> Option<String> {
        let localpart = user_id
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.inner.server_name))?;
        let escaped = localpart
            .strip_prefix(&self.inner.puppet_prefix)?
            .strip_prefix(&format!("{}_", network.to_lowercase()))?;
        unescape_nick(escaped)
    }

    /// Whether the cached puppet displayname already matches this nick.
    pub fn is_user_cached(&self, user_id: &str, nick: &str) -> bool {
        self.inner
            .displaynames
            .get(user_id)
            .is_some_and(|cached| cached.value() == nick)
    }

    /// Make sure the puppet exists and its displayname matches the nick.
    pub async fn ensure_puppet(&self, network: &str, nick: &str) -> MatrixResult<String> {
        let user_id = self.puppet_user_id(network, nick);
        if self.is_user_cached(&user_id, nick) {
            return Ok(user_id);
        }

        self.inner
            .api
            .register_user(&self.puppet_localpart(network, nick))
            .await?;
        if let Err(e) = self.inner.api.set_displayname(&user_id, nick).await {
            debug!(user_id = %user_id, error = %e, "puppet displayname update failed");
        }

        self.inner
            .displaynames
            .insert(user_id.clone(), nick.to_string());
        Ok(user_id)
    }

    // -------------------------------------------------------------------------
    // Room registry & persistence
    // -------------------------------------------------------------------------

    pub fn register_room(&self, handle: RoomHandle) {
        self.inner.rooms.insert(handle.id.clone(), handle);
    }

    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.inner.rooms.get(room_id).map(|entry| entry.clone())
    }

    /// Drop a room from the registry and from persisted state.
    pub fn remove_room(&self, room_id: &str) {
        self.inner.rooms.remove(room_id);
        let _ = self.inner.save_tx.send(SaveOp::RemoveRoom {
            room_id: room_id.to_string(),
        });
    }

    /// Queue a room config save; idempotent merge into the blob.
    pub fn save_room(&self, room_id: &str, config: RoomConfig) {
        if room_id.is_empty() {
            return;
        }
        let _ = self.inner.save_tx.send(SaveOp::Room {
            room_id: room_id.to_string(),
            config,
        });
    }
}

/// Escape an IRC nick into the localpart alphabet; `=xx` hex-escapes
/// anything else, so the mapping stays reversible.
fn escape_nick(nick: &str) -> String {
    let mut out = String::with_capacity(nick.len());
    for b in nick.to_lowercase().bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("={b:02x}")),
        }
    }
    out
}

fn unescape_nick(escaped: &str) -> Option<String> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.bytes();
    while let Some(b) = bytes.next() {
        if b == b'=' {
            let hi = bytes.next()?;
            let lo = bytes.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}

// =============================================================================
// Startup
// =============================================================================

fn link_config(block: &NetworkBlock) -> LinkConfig {
    LinkConfig {
        address: block.address.clone(),
        nick: block.nick.clone(),
        username: block.username.clone().unwrap_or_else(|| block.nick.clone()),
        realname: block.realname.clone().unwrap_or_else(|| block.nick.clone()),
    }
}

/// Bring the whole bridge up: load persisted state, start network rooms,
/// restore child rooms, connect, and run the sync loop until the process
/// dies.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let api: Arc<dyn MatrixClient> = Arc::new(HttpMatrixClient::new(
        &config.homeserver.url,
        &config.homeserver.token,
    ));

    let blob = persistence::load(&api, &config.bridge.owner).await?;
    let save_tx = persistence::spawn_saver(
        Arc::clone(&api),
        config.bridge.owner.clone(),
        blob.clone(),
    );
    let bridge = Bridge::new(Arc::clone(&api), &config, save_tx);

    let blocks: HashMap<&str, &NetworkBlock> = config
        .networks
        .iter()
        .map(|block| (block.name.as_str(), block))
        .collect();

    // Network rooms first; children need their back-references.
    let mut networks: HashMap<String, (RoomHandle, NetworkRef)> = HashMap::new();

    for room_id in blob.rooms.keys() {
        let Some(RoomConfig::Network(network_config)) = blob.room_config(room_id) else {
            continue;
        };

        let block = blocks.get(network_config.name.as_str());
        let link = match (block, &network_config.address, &network_config.nick) {
            (Some(block), _, _) => Some(link_config(block)),
            (None, Some(address), Some(nick)) => Some(LinkConfig {
                address: address.clone(),
                nick: nick.clone(),
                username: nick.clone(),
                realname: nick.clone(),
            }),
            _ => None,
        };
        let autoconnect = block.map(|b| b.autoconnect).unwrap_or(true);
        let (pills_length, pills_ignore) = block
            .map(|b| (b.pills_length, b.pills_ignore.clone()))
            .unwrap_or((crate::config::default_pills_length(), Vec::new()));

        match NetworkRoom::start(
            bridge.clone(),
            room_id,
            &network_config.name,
            link,
            autoconnect,
            pills_length,
            pills_ignore,
        )
        .await
        {
            Ok((handle, network_ref)) => {
                bridge.register_room(handle.clone());
                networks.insert(network_config.name.clone(), (handle, network_ref));
            }
            Err(e) => warn!(network = %network_config.name, error = %e, "network room restore failed"),
        }
    }

    // Configured networks without a persisted control room get one now.
    for block in &config.networks {
        if networks.contains_key(&block.name) {
            continue;
        }
        match start_network(&bridge, block).await {
            Ok((handle, network_ref)) => {
                networks.insert(block.name.clone(), (handle, network_ref));
            }
            Err(e) => warn!(network = %block.name, error = %e, "network startup failed"),
        }
    }

    // Child rooms.
    for room_id in blob.rooms.keys() {
        let Some(config) = blob.room_config(room_id) else {
            continue;
        };

        let (network_name, key) = match &config {
            RoomConfig::Network(_) => continue,
            RoomConfig::Direct(c) => (c.network.clone(), c.name.clone()),
            RoomConfig::Channel(c) => (c.network.clone(), c.name.clone()),
            RoomConfig::Plumbed(c) => (c.channel.network.clone(), c.channel.name.clone()),
        };

        let Some((network_handle, network_ref)) = networks.get(&network_name) else {
            warn!(room = %room_id, network = %network_name, "room references unknown network");
            continue;
        };

        match restore_room(&bridge, room_id, config, network_ref.clone()).await {
            Ok(Some(handle)) => {
                bridge.register_room(handle.clone());
                network_handle.send(RoomInput::ChildOpened { key, handle });
            }
            Ok(None) => {
                info!(room = %room_id, "dropping invalid room");
                let _ = api.leave_room(room_id, None).await;
                bridge.remove_room(room_id);
            }
            Err(e) => warn!(room = %room_id, error = %e, "room restore failed"),
        }
    }

    // Connect the links.
    for (name, (handle, _)) in &networks {
        let autoconnect = blocks.get(name.as_str()).map(|b| b.autoconnect).unwrap_or(true);
        if autoconnect {
            handle.send(RoomInput::Connect);
        }
    }

    info!(
        networks = networks.len(),
        rooms = blob.rooms.len(),
        "bridge up, entering sync loop"
    );

    sync_loop(bridge, config.homeserver.sync_timeout_ms).await;
    Ok(())
}

async fn start_network(
    bridge: &Bridge,
    block: &NetworkBlock,
) -> BridgeResult<(RoomHandle, NetworkRef)> {
    let room_id = bridge
        .api()
        .create_room(
            &format!("{} (network)", block.name),
            &format!("IRC network {}", block.name),
            &[bridge.owner().to_string()],
        )
        .await?;

    let (handle, network_ref) = NetworkRoom::start(
        bridge.clone(),
        &room_id,
        &block.name,
        Some(link_config(block)),
        block.autoconnect,
        block.pills_length,
        block.pills_ignore.clone(),
    )
    .await?;

    bridge.register_room(handle.clone());
    bridge.save_room(
        &room_id,
        RoomConfig::Network(crate::rooms::NetworkRoomConfig {
            name: block.name.clone(),
            address: Some(block.address.clone()),
            nick: Some(block.nick.clone()),
        }),
    );
    info!(network = %block.name, room = %room_id, "created network room");
    Ok((handle, network_ref))
}

/// Restore one child room; `None` means the config was valid but the room
/// itself no longer is (the owner left, the plumb was kicked).
async fn restore_room(
    bridge: &Bridge,
    room_id: &str,
    config: RoomConfig,
    network_ref: NetworkRef,
) -> BridgeResult<Option<RoomHandle>> {
    match config {
        RoomConfig::Direct(config) => {
            let room =
                DirectRoom::restore(bridge.clone(), room_id, config, network_ref, None).await?;
            if !room.is_valid() {
                return Ok(None);
            }
            Ok(Some(spawn_room(room)))
        }
        RoomConfig::Channel(config) => {
            let room =
                ChannelRoom::restore(bridge.clone(), room_id, config, network_ref, None).await?;
            if !room.is_valid() {
                return Ok(None);
            }
            Ok(Some(spawn_room(room)))
        }
        RoomConfig::Plumbed(config) => {
            let room =
                ChannelRoom::restore_plumbed(bridge.clone(), room_id, config, network_ref, None)
                    .await?;
            if !room.is_valid() {
                return Ok(None);
            }
            Ok(Some(spawn_room(room)))
        }
        RoomConfig::Network(_) => Ok(None),
    }
}

// =============================================================================
// Sync dispatch
// =============================================================================

/// Long-poll the homeserver forever, dispatching room events to their
/// owning room tasks.
pub async fn sync_loop(bridge: Bridge, timeout_ms: u64) {
    let mut since: Option<String> = None;

    loop {
        match bridge.api().sync(since.as_deref(), timeout_ms).await {
            Ok(response) => {
                for (room_id, joined) in &response.rooms.join {
                    dispatch_room_events(&bridge, room_id, &joined.timeline.events);
                }
                since = Some(response.next_batch);
            }
            Err(e) => {
                warn!(error = %e, "sync failed");
                tokio::time::sleep(SYNC_RETRY_DELAY).await;
            }
        }
    }
}

/// Turn raw sync events into room inputs.
pub fn dispatch_room_events(
    bridge: &Bridge,
    room_id: &str,
    events: &[crate::matrix::RawEvent],
) {
    let Some(handle) = bridge.room(room_id) else {
        debug!(room = %room_id, "events for unregistered room");
        return;
    };

    for event in events {
        match event.kind.as_str() {
            "m.room.message" => {
                if let Some(message) = event.to_message() {
                    handle.send(RoomInput::MxMessage(message));
                }
            }
            "m.room.redaction" => {
                if let Some(redaction) = event.to_redaction() {
                    handle.send(RoomInput::MxRedaction(redaction));
                }
            }
            "m.room.member" => {
                let Some(user_id) = event.state_key.clone() else {
                    continue;
                };
                let membership = event
                    .content
                    .get("membership")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                let displayname = event
                    .content
                    .get("displayname")
                    .and_then(|value| value.as_str())
                    .map(String::from);
                handle.send(RoomInput::Membership {
                    user_id,
                    membership,
                    displayname,
                });
            }
            _ => {}
        }
    }
}
