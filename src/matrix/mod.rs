//! Matrix homeserver collaborator.
//!
//! The bridge talks to the homeserver through the [`MatrixClient`] trait so
//! the relay core can run against a fake in tests; [`HttpMatrixClient`] is
//! the reqwest-backed production implementation speaking the client-server
//! API with appservice impersonation.

mod http;
mod types;

pub use http::HttpMatrixClient;
pub use types::{
    msgtype, InReplyTo, JoinedRoomSync, MemberInfo, MessageContent, MessageEvent, RawEvent,
    RedactionEvent, RelatesTo, SyncResponse, SyncRooms, Timeline,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Homeserver API errors.
///
/// `NotFound` is distinct from the generic remote error because account-data
/// first load and event backfetches need to absorb 404s.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("not found")]
    NotFound,

    #[error("{errcode}: {error}")]
    Remote { errcode: String, error: String },

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Invalid(String),
}

pub type MatrixResult<T> = Result<T, MatrixError>;

/// Operations the relay core needs from the homeserver.
///
/// `user_id` parameters on messaging/membership calls select the puppet to
/// impersonate; `None` acts as the bridge bot itself.
#[async_trait]
pub trait MatrixClient: Send + Sync {
    /// Create a private room, returning its room id.
    async fn create_room(&self, name: &str, topic: &str, invite: &[String])
        -> MatrixResult<String>;

    /// Join a room by id or alias, returning the resolved room id.
    async fn join_room(&self, room: &str, user_id: Option<&str>) -> MatrixResult<String>;

    async fn invite_user(&self, room_id: &str, user_id: &str) -> MatrixResult<()>;

    async fn leave_room(&self, room_id: &str, user_id: Option<&str>) -> MatrixResult<()>;

    async fn kick_user(&self, room_id: &str, user_id: &str, reason: &str) -> MatrixResult<()>;

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> MatrixResult<Value>;

    async fn put_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> MatrixResult<String>;

    async fn get_room_event(&self, room_id: &str, event_id: &str) -> MatrixResult<MessageEvent>;

    async fn get_joined_members(
        &self,
        room_id: &str,
    ) -> MatrixResult<HashMap<String, MemberInfo>>;

    /// Post an `m.room.message`, returning the new event id.
    async fn send_message(
        &self,
        room_id: &str,
        user_id: Option<&str>,
        content: &MessageContent,
    ) -> MatrixResult<String>;

    /// Post an `m.reaction` annotation on `event_id`.
    async fn send_reaction(
        &self,
        room_id: &str,
        event_id: &str,
        key: &str,
    ) -> MatrixResult<String>;

    /// Post an `m.read` receipt for `event_id`.
    async fn send_receipt(&self, room_id: &str, event_id: &str) -> MatrixResult<()>;

    async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> MatrixResult<String>;

    /// Upload a media blob, returning its `mxc://` content URI.
    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: Option<&str>,
    ) -> MatrixResult<String>;

    /// Resolve an `mxc://` URI to a public download URL.
    fn media_url(&self, mxc_uri: &str, filename: Option<&str>) -> String;

    async fn get_account_data(&self, user_id: &str, key: &str) -> MatrixResult<Value>;

    async fn put_account_data(&self, user_id: &str, key: &str, data: &Value) -> MatrixResult<()>;

    /// Ensure a puppet user exists (appservice registration). Succeeds when
    /// the user is already registered.
    async fn register_user(&self, localpart: &str) -> MatrixResult<()>;

    async fn set_displayname(&self, user_id: &str, displayname: &str) -> MatrixResult<()>;

    async fn get_displayname(&self, user_id: &str) -> MatrixResult<Option<String>>;

    /// Quarantine a media item through the Synapse admin API.
    async fn quarantine_media(&self, server_name: &str, media_id: &str) -> MatrixResult<()>;

    /// Long-poll the sync stream.
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> MatrixResult<SyncResponse>;
}
