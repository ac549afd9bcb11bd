//! Account-data persistence.
//!
//! The whole bridge state lives in one JSON blob under the owner's account
//! data: global settings plus one entry per room, keyed by room id. Saves
//! are serialized through a single queue task so concurrent room saves
//! cannot interleave partial blobs.

use crate::error::{BridgeError, BridgeResult};
use crate::matrix::{MatrixClient, MatrixError};
use crate::rooms::RoomConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Account-data event type holding the bridge state.
pub const ACCOUNT_DATA_KEY: &str = "irc";

/// The persisted blob. Room entries are kept as raw JSON so a single
/// malformed entry cannot poison the rest; global keys owned by the
/// bootstrap ride along untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountData {
    #[serde(default)]
    pub rooms: BTreeMap<String, Value>,

    #[serde(flatten)]
    pub globals: serde_json::Map<String, Value>,
}

impl AccountData {
    /// Parse one room entry, skipping it on error.
    pub fn room_config(&self, room_id: &str) -> Option<RoomConfig> {
        let raw = self.rooms.get(room_id)?;
        match serde_json::from_value(raw.clone()) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(room = %room_id, error = %e, "skipping unparseable room config");
                None
            }
        }
    }
}

/// A mutation of the persisted blob.
#[derive(Debug)]
pub enum SaveOp {
    Room {
        room_id: String,
        config: RoomConfig,
    },
    RemoveRoom {
        room_id: String,
    },
}

/// Load the blob, treating "never saved" as an empty state that gets
/// written back immediately.
pub async fn load(api: &Arc<dyn MatrixClient>, owner: &str) -> BridgeResult<AccountData> {
    match api.get_account_data(owner, ACCOUNT_DATA_KEY).await {
        Ok(raw) => serde_json::from_value(raw)
            .map_err(|e| BridgeError::Invariant(format!("corrupt account data: {e}"))),
        Err(MatrixError::NotFound) => {
            info!("no account data yet, saving defaults");
            let blob = AccountData::default();
            let raw = serde_json::to_value(&blob)
                .map_err(|e| BridgeError::Invariant(e.to_string()))?;
            api.put_account_data(owner, ACCOUNT_DATA_KEY, &raw).await?;
            Ok(blob)
        }
        Err(e) => Err(e.into()),
    }
}

/// Spawn the save queue. Each op merges into the in-memory blob and writes
/// the whole thing back; failures are logged and the state is retried with
/// the next save.
pub fn spawn_saver(
    api: Arc<dyn MatrixClient>,
    owner: String,
    initial: AccountData,
) -> mpsc::UnboundedSender<SaveOp> {
    let (tx, mut rx) = mpsc::unbounded_channel::<SaveOp>();

    tokio::spawn(async move {
        let mut blob = initial;

        while let Some(op) = rx.recv().await {
            match op {
                SaveOp::Room { room_id, config } => match serde_json::to_value(&config) {
                    Ok(value) => {
                        blob.rooms.insert(room_id, value);
                    }
                    Err(e) => {
                        warn!(room = %room_id, error = %e, "unserializable room config");
                        continue;
                    }
                },
                SaveOp::RemoveRoom { room_id } => {
                    blob.rooms.remove(&room_id);
                }
            }

            match serde_json::to_value(&blob) {
                Ok(raw) => {
                    if let Err(e) = api.put_account_data(&owner, ACCOUNT_DATA_KEY, &raw).await {
                        warn!(error = %e, "account data save failed");
                    } else {
                        debug!(rooms = blob.rooms.len(), "account data saved");
                    }
                }
                Err(e) => warn!(error = %e, "account data serialization failed"),
            }
        }
    });

    tx
}
