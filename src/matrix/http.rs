//! reqwest-backed Matrix client-server API implementation.

use super::types::{MemberInfo, MessageContent, MessageEvent, SyncResponse};
use super::{MatrixClient, MatrixError, MatrixResult};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Timeout for plain API calls; sync long-polls get their own allowance.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra headroom on top of the requested sync long-poll window.
const SYNC_SLACK: Duration = Duration::from_secs(15);

/// Error body shape returned by the homeserver.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

/// Production homeserver client authenticating with an appservice token.
pub struct HttpMatrixClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpMatrixClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("slirc-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn txn_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Issue a JSON request and decode the response, mapping 404 to
    /// [`MatrixError::NotFound`] and other non-2xx statuses to
    /// [`MatrixError::Remote`].
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> MatrixResult<T> {
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.token)
            .timeout(timeout)
            .query(query);

        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(MatrixError::NotFound);
        }

        if !status.is_success() {
            let err: ApiError = resp.json().await.unwrap_or(ApiError {
                errcode: format!("HTTP_{}", status.as_u16()),
                error: String::new(),
            });
            debug!(method = %method, path, errcode = %err.errcode, "API call failed");
            return Err(MatrixError::Remote {
                errcode: err.errcode,
                error: err.error,
            });
        }

        Ok(resp.json().await?)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        user_id: Option<&str>,
        body: Option<&Value>,
    ) -> MatrixResult<T> {
        let query: Vec<(&str, &str)> = match user_id {
            Some(uid) => vec![("user_id", uid)],
            None => Vec::new(),
        };
        self.request(method, path, &query, body, API_TIMEOUT).await
    }
}

fn encode(component: &str) -> String {
    // Room ids, event ids and user ids may contain '#', '!', '$', ':' which
    // must not be interpreted as URL structure.
    let mut out = String::with_capacity(component.len());
    for b in component.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, MemberInfo>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct DisplaynameResponse {
    #[serde(default)]
    displayname: Option<String>,
}

#[async_trait]
impl MatrixClient for HttpMatrixClient {
    async fn create_room(
        &self,
        name: &str,
        topic: &str,
        invite: &[String],
    ) -> MatrixResult<String> {
        let body = json!({
            "visibility": "private",
            "name": name,
            "topic": topic,
            "invite": invite,
            "is_direct": false,
            "power_level_content_override": {
                "users_default": 0,
                "invite": 100,
                "kick": 100,
                "redact": 100,
                "ban": 100,
            },
        });
        let resp: RoomIdResponse = self
            .call(Method::POST, "/_matrix/client/v3/createRoom", None, Some(&body))
            .await?;
        Ok(resp.room_id)
    }

    async fn join_room(&self, room: &str, user_id: Option<&str>) -> MatrixResult<String> {
        let path = format!("/_matrix/client/v3/join/{}", encode(room));
        let resp: RoomIdResponse = self
            .call(Method::POST, &path, user_id, Some(&json!({})))
            .await?;
        Ok(resp.room_id)
    }

    async fn invite_user(&self, room_id: &str, user_id: &str) -> MatrixResult<()> {
        let path = format!("/_matrix/client/v3/rooms/{}/invite", encode(room_id));
        let _: Value = self
            .call(Method::POST, &path, None, Some(&json!({"user_id": user_id})))
            .await?;
        Ok(())
    }

    async fn leave_room(&self, room_id: &str, user_id: Option<&str>) -> MatrixResult<()> {
        let path = format!("/_matrix/client/v3/rooms/{}/leave", encode(room_id));
        let _: Value = self
            .call(Method::POST, &path, user_id, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn kick_user(&self, room_id: &str, user_id: &str, reason: &str) -> MatrixResult<()> {
        let path = format!("/_matrix/client/v3/rooms/{}/kick", encode(room_id));
        let body = json!({"user_id": user_id, "reason": reason});
        let _: Value = self.call(Method::POST, &path, None, Some(&body)).await?;
        Ok(())
    }

    async fn get_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> MatrixResult<Value> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            encode(room_id),
            encode(event_type),
            encode(state_key)
        );
        self.call(Method::GET, &path, None, None).await
    }

    async fn put_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> MatrixResult<String> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/{}/{}",
            encode(room_id),
            encode(event_type),
            encode(state_key)
        );
        let resp: EventIdResponse = self
            .call(Method::PUT, &path, None, Some(&content))
            .await?;
        Ok(resp.event_id)
    }

    async fn get_room_event(&self, room_id: &str, event_id: &str) -> MatrixResult<MessageEvent> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/event/{}",
            encode(room_id),
            encode(event_id)
        );
        self.call(Method::GET, &path, None, None).await
    }

    async fn get_joined_members(
        &self,
        room_id: &str,
    ) -> MatrixResult<HashMap<String, MemberInfo>> {
        let path = format!("/_matrix/client/v3/rooms/{}/joined_members", encode(room_id));
        let resp: JoinedMembersResponse = self.call(Method::GET, &path, None, None).await?;
        Ok(resp.joined)
    }

    async fn send_message(
        &self,
        room_id: &str,
        user_id: Option<&str>,
        content: &MessageContent,
    ) -> MatrixResult<String> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            encode(room_id),
            Self::txn_id()
        );
        let body = serde_json::to_value(content)
            .map_err(|e| MatrixError::Invalid(e.to_string()))?;
        let resp: EventIdResponse = self.call(Method::PUT, &path, user_id, Some(&body)).await?;
        Ok(resp.event_id)
    }

    async fn send_reaction(
        &self,
        room_id: &str,
        event_id: &str,
        key: &str,
    ) -> MatrixResult<String> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/m.reaction/{}",
            encode(room_id),
            Self::txn_id()
        );
        let body = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event_id,
                "key": key,
            }
        });
        let resp: EventIdResponse = self.call(Method::PUT, &path, None, Some(&body)).await?;
        Ok(resp.event_id)
    }

    async fn send_receipt(&self, room_id: &str, event_id: &str) -> MatrixResult<()> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/receipt/m.read/{}",
            encode(room_id),
            encode(event_id)
        );
        let _: Value = self
            .call(Method::POST, &path, None, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        reason: Option<&str>,
    ) -> MatrixResult<String> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/redact/{}/{}",
            encode(room_id),
            encode(event_id),
            Self::txn_id()
        );
        let body = match reason {
            Some(reason) => json!({"reason": reason}),
            None => json!({}),
        };
        let resp: EventIdResponse = self.call(Method::PUT, &path, None, Some(&body)).await?;
        Ok(resp.event_id)
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: Option<&str>,
    ) -> MatrixResult<String> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(name) = filename {
            query.push(("filename", name));
        }

        let resp = self
            .http
            .post(self.url("/_matrix/media/v3/upload"))
            .bearer_auth(&self.token)
            .timeout(API_TIMEOUT)
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let err: ApiError = resp.json().await.unwrap_or(ApiError {
                errcode: format!("HTTP_{}", status.as_u16()),
                error: String::new(),
            });
            return Err(MatrixError::Remote {
                errcode: err.errcode,
                error: err.error,
            });
        }

        let upload: UploadResponse = resp.json().await?;
        Ok(upload.content_uri)
    }

    fn media_url(&self, mxc_uri: &str, filename: Option<&str>) -> String {
        let Some(rest) = mxc_uri.strip_prefix("mxc://") else {
            return mxc_uri.to_string();
        };
        match filename {
            Some(name) => format!(
                "{}/_matrix/media/v3/download/{}/{}",
                self.base_url,
                rest,
                encode(name)
            ),
            None => format!("{}/_matrix/media/v3/download/{}", self.base_url, rest),
        }
    }

    async fn get_account_data(&self, user_id: &str, key: &str) -> MatrixResult<Value> {
        let path = format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(user_id),
            encode(key)
        );
        self.call(Method::GET, &path, None, None).await
    }

    async fn put_account_data(&self, user_id: &str, key: &str, data: &Value) -> MatrixResult<()> {
        let path = format!(
            "/_matrix/client/v3/user/{}/account_data/{}",
            encode(user_id),
            encode(key)
        );
        let _: Value = self.call(Method::PUT, &path, None, Some(data)).await?;
        Ok(())
    }

    async fn register_user(&self, localpart: &str) -> MatrixResult<()> {
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        let result: MatrixResult<Value> = self
            .call(Method::POST, "/_matrix/client/v3/register", None, Some(&body))
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already registered is success for our purposes.
            Err(MatrixError::Remote { ref errcode, .. }) if errcode == "M_USER_IN_USE" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_displayname(&self, user_id: &str, displayname: &str) -> MatrixResult<()> {
        let path = format!("/_matrix/client/v3/profile/{}/displayname", encode(user_id));
        let body = json!({"displayname": displayname});
        let _: Value = self
            .call(Method::PUT, &path, Some(user_id), Some(&body))
            .await?;
        Ok(())
    }

    async fn get_displayname(&self, user_id: &str) -> MatrixResult<Option<String>> {
        let path = format!("/_matrix/client/v3/profile/{}/displayname", encode(user_id));
        let resp: DisplaynameResponse = match self.call(Method::GET, &path, None, None).await {
            Ok(resp) => resp,
            Err(MatrixError::NotFound) => DisplaynameResponse::default(),
            Err(e) => return Err(e),
        };
        Ok(resp.displayname)
    }

    async fn quarantine_media(&self, server_name: &str, media_id: &str) -> MatrixResult<()> {
        let path = format!(
            "/_synapse/admin/v1/media/quarantine/{}/{}",
            encode(server_name),
            encode(media_id)
        );
        let _: Value = self
            .call(Method::POST, &path, None, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> MatrixResult<SyncResponse> {
        let timeout = timeout_ms.to_string();
        let mut query: Vec<(&str, &str)> = vec![("timeout", timeout.as_str())];
        if let Some(since) = since {
            query.push(("since", since));
        }
        self.request(
            Method::GET,
            "/_matrix/client/v3/sync",
            &query,
            None,
            Duration::from_millis(timeout_ms) + SYNC_SLACK,
        )
        .await
    }
}
