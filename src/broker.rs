// Thin typed adapter over the external channel broker. Stateless: request
// timeouts live here, retry and backoff live in the ingest orchestrator.

use crate::config::CoreConfig;
use crate::models::MessageContent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const CHANNEL_PERSON: u8 = 1;
pub const CHANNEL_GROUP: u8 = 2;

/// Canonical two-user channel id: lexicographic join of the uids.
pub fn personal_channel_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// Broker payloads are opaque base64 blobs; the structured content is JSON
/// underneath.
pub fn encode_payload(content: &MessageContent) -> String {
    use base64::Engine;
    let json = serde_json::to_string(content).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(json)
}

pub fn decode_payload(payload: &str) -> Result<MessageContent, String> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| format!("invalid base64 payload: {e}"))?;
    serde_json::from_slice(&raw).map_err(|e| format!("invalid payload JSON: {e}"))
}

// --- Wire shapes ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSend {
    pub channel_id: String,
    pub channel_type: u8,
    pub from_uid: String,
    pub payload: String,
    pub client_msg_no: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub message_id: i64,
    pub message_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: i64,
    pub message_seq: i64,
    pub channel_id: String,
    pub channel_type: u8,
    pub from_uid: String,
    pub payload: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncQuery {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_seq: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub channel_type: u8,
    #[serde(default)]
    pub subscriber_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserToken {
    pub uid: String,
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerUserInfo {
    pub uid: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub device_count: i64,
}

// --- Errors ---

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request timed out")]
    Timeout,

    #[error("broker unreachable: {0}")]
    Network(String),

    #[error("broker returned {0}: {1}")]
    Status(u16, String),
}

impl BrokerError {
    /// Timeouts, network failures and 5xx are worth another try; 4xx is the
    /// broker telling us the request itself is wrong.
    pub fn is_retriable(&self) -> bool {
        match self {
            BrokerError::Timeout | BrokerError::Network(_) => true,
            BrokerError::Status(code, _) => *code >= 500,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else {
            BrokerError::Network(e.to_string())
        }
    }
}

// --- Transport seam ---

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn send_message(&self, send: &BrokerSend) -> Result<BrokerAck, BrokerError>;
    async fn send_batch(
        &self,
        sends: &[BrokerSend],
    ) -> Result<Vec<Result<BrokerAck, BrokerError>>, BrokerError>;
    async fn sync_messages(&self, query: &SyncQuery) -> Result<Vec<BrokerMessage>, BrokerError>;

    async fn create_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<(), BrokerError>;
    async fn delete_channel(&self, channel_id: &str, channel_type: u8) -> Result<(), BrokerError>;
    async fn channel_info(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<ChannelInfo, BrokerError>;

    async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;
    async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;
    async fn list_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, BrokerError>;

    async fn blocklist_add(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;
    async fn blocklist_remove(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;
    async fn allowlist_add(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;
    async fn allowlist_remove(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError>;

    async fn upsert_user(&self, uid: &str) -> Result<(), BrokerError>;
    async fn user_token(&self, uid: &str) -> Result<UserToken, BrokerError>;
    async fn user_info(&self, uid: &str) -> Result<BrokerUserInfo, BrokerError>;

    async fn health(&self) -> Result<bool, BrokerError>;
    async fn system_info(&self) -> Result<serde_json::Value, BrokerError>;
}

// --- HTTP implementation ---

pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    manager_url: String,
    token: Option<String>,
    timeout: Duration,
    batch_timeout: Duration,
}

impl HttpBroker {
    pub fn new(config: &CoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.broker_timeout_secs))
            .build()
            .expect("Failed to create broker HTTP client");
        HttpBroker {
            client,
            base_url: config.broker_url.trim_end_matches('/').to_string(),
            manager_url: config.broker_manager_url.trim_end_matches('/').to_string(),
            token: config.broker_token.clone(),
            timeout: Duration::from_secs(config.broker_timeout_secs),
            batch_timeout: Duration::from_secs(config.broker_batch_timeout_secs),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: String,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url).timeout(timeout);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .request(reqwest::Method::POST, url, timeout)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Status(status.as_u16(), text));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn post_ok(&self, path: &str, body: &serde_json::Value) -> Result<(), BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .request(reqwest::Method::POST, url, self.timeout)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Status(status.as_u16(), text));
        }
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.manager_url, path);
        let resp = self
            .request(reqwest::Method::GET, url, self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Status(status.as_u16(), text));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl BrokerTransport for HttpBroker {
    async fn send_message(&self, send: &BrokerSend) -> Result<BrokerAck, BrokerError> {
        self.post_json(
            "/message/send",
            &serde_json::to_value(send).unwrap_or_default(),
            self.timeout,
        )
        .await
    }

    async fn send_batch(
        &self,
        sends: &[BrokerSend],
    ) -> Result<Vec<Result<BrokerAck, BrokerError>>, BrokerError> {
        #[derive(Deserialize)]
        struct BatchItem {
            #[serde(default)]
            message_id: i64,
            #[serde(default)]
            message_seq: i64,
            #[serde(default)]
            error: Option<String>,
        }
        let items: Vec<BatchItem> = self
            .post_json(
                "/message/sendbatch",
                &serde_json::json!({ "messages": sends }),
                self.batch_timeout,
            )
            .await?;
        Ok(items
            .into_iter()
            .map(|item| match item.error {
                Some(err) => Err(BrokerError::Status(400, err)),
                None => Ok(BrokerAck {
                    message_id: item.message_id,
                    message_seq: item.message_seq,
                }),
            })
            .collect())
    }

    async fn sync_messages(&self, query: &SyncQuery) -> Result<Vec<BrokerMessage>, BrokerError> {
        #[derive(Deserialize)]
        struct SyncResponse {
            #[serde(default)]
            messages: Vec<BrokerMessage>,
        }
        let resp: SyncResponse = self
            .post_json(
                "/message/sync",
                &serde_json::to_value(query).unwrap_or_default(),
                self.timeout,
            )
            .await?;
        Ok(resp.messages)
    }

    async fn create_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "subscribers": subscribers,
            }),
        )
        .await
    }

    async fn delete_channel(&self, channel_id: &str, channel_type: u8) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/delete",
            &serde_json::json!({ "channel_id": channel_id, "channel_type": channel_type }),
        )
        .await
    }

    async fn channel_info(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<ChannelInfo, BrokerError> {
        self.get_json(&format!(
            "/channel/info?channel_id={channel_id}&channel_type={channel_type}"
        ))
        .await
    }

    async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/subscriber_add",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "subscribers": uids,
            }),
        )
        .await
    }

    async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/subscriber_remove",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "subscribers": uids,
            }),
        )
        .await
    }

    async fn list_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Vec<String>, BrokerError> {
        self.get_json(&format!(
            "/channel/subscribers?channel_id={channel_id}&channel_type={channel_type}"
        ))
        .await
    }

    async fn blocklist_add(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/blacklist_add",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "uids": uids,
            }),
        )
        .await
    }

    async fn blocklist_remove(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/blacklist_remove",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "uids": uids,
            }),
        )
        .await
    }

    async fn allowlist_add(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/whitelist_add",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "uids": uids,
            }),
        )
        .await
    }

    async fn allowlist_remove(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<(), BrokerError> {
        self.post_ok(
            "/channel/whitelist_remove",
            &serde_json::json!({
                "channel_id": channel_id,
                "channel_type": channel_type,
                "uids": uids,
            }),
        )
        .await
    }

    async fn upsert_user(&self, uid: &str) -> Result<(), BrokerError> {
        self.post_ok("/user/add", &serde_json::json!({ "uid": uid }))
            .await
    }

    async fn user_token(&self, uid: &str) -> Result<UserToken, BrokerError> {
        self.post_json(
            "/user/token",
            &serde_json::json!({ "uid": uid }),
            self.timeout,
        )
        .await
    }

    async fn user_info(&self, uid: &str) -> Result<BrokerUserInfo, BrokerError> {
        self.get_json(&format!("/user/info?uid={uid}")).await
    }

    async fn health(&self) -> Result<bool, BrokerError> {
        let url = format!("{}/health", self.manager_url);
        let resp = self
            .request(reqwest::Method::GET, url, self.timeout)
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn system_info(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_json("/varz").await
    }
}
