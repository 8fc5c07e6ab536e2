// ABOUTME: Discord REST v10 client: messages, threads, channel and user lookups
// ABOUTME: Retries rate-limited (429) calls honoring retry_after; caches channel and user info

use anyhow::{Context, Result};
use reqwest::{
    header::AUTHORIZATION,
    multipart::{Form, Part},
    Method, RequestBuilder, Response, StatusCode,
};
use serde_json::{json, Value};
use slackord_core::{FetchedMessage, StagedFile};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Extra attempts after a 429 before the response is returned as-is
const RATE_LIMIT_RETRIES: u32 = 3;

/// Longest wait honored from a retry_after hint
const MAX_RETRY_AFTER_SECS: f64 = 30.0;

/// Auto-archive threads after a day of inactivity
const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 1440;

/// Discord caps thread names at 100 characters
const MAX_THREAD_NAME_CHARS: usize = 100;

/// Channel facts the relay needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: Option<String>,
    /// Discord channel type (0 text, 10/11/12 threads, ...)
    pub kind: u64,
    pub parent_id: Option<String>,
}

impl ChannelInfo {
    pub fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            id: value.get("id")?.as_str()?.to_string(),
            name: value.get("name").and_then(Value::as_str).map(str::to_string),
            kind: value.get("type").and_then(Value::as_u64).unwrap_or(0),
            parent_id: value
                .get("parent_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn is_thread(&self) -> bool {
        matches!(self.kind, 10..=12)
    }
}

pub struct DiscordRest {
    http: reqwest::Client,
    token: String,
    api_base: String,
    channels: Mutex<HashMap<String, ChannelInfo>>,
    users: Mutex<HashMap<String, String>>,
}

impl DiscordRest {
    pub fn new(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self::with_base(http, token, DISCORD_API_BASE)
    }

    pub fn with_base(http: reqwest::Client, token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: api_base.into(),
            channels: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn bot_auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Send a request, waiting out up to RATE_LIMIT_RETRIES rate limits.
    ///
    /// `build` runs once per attempt since multipart bodies cannot be replayed.
    async fn execute<F>(&self, method: Method, path: &str, build: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> Result<RequestBuilder>,
    {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            let request = build(
                self.http
                    .request(method.clone(), &url)
                    .header(AUTHORIZATION, self.bot_auth()),
            )?;
            let response = request
                .send()
                .await
                .with_context(|| format!("Discord {} {} failed", method, path))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS || attempt >= RATE_LIMIT_RETRIES {
                return Ok(response);
            }
            attempt += 1;

            let body: Value = response.json().await.unwrap_or_default();
            let retry_after = body
                .get("retry_after")
                .and_then(Value::as_f64)
                .unwrap_or(1.0)
                .clamp(0.0, MAX_RETRY_AFTER_SECS);
            tracing::warn!(
                path = %path,
                attempt,
                retry_after_secs = retry_after,
                "Discord rate limited, waiting"
            );
            tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
        }
    }

    /// Body of a successful response, or an error carrying status and body
    async fn json_body(response: Response, what: &str) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord {} failed ({}): {}", what, status, body);
        }
        response
            .json()
            .await
            .with_context(|| format!("Discord {} returned invalid JSON", what))
    }

    /// ID of the bot user behind the token
    pub async fn current_user_id(&self) -> Result<String> {
        let response = self.execute(Method::GET, "/users/@me", Ok).await?;
        let body = Self::json_body(response, "users/@me").await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Discord users/@me response missing id")
    }

    /// Gateway WebSocket URL for bots
    pub async fn gateway_url(&self) -> Result<String> {
        let response = self.execute(Method::GET, "/gateway/bot", Ok).await?;
        let body = Self::json_body(response, "gateway/bot").await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Missing 'url' in gateway response")
    }

    /// Post a message to a channel or thread, attaching `files` when given
    pub async fn create_message(&self, channel_id: &str, text: &str, files: &[StagedFile]) -> Result<String> {
        let path = format!("/channels/{}/messages", channel_id);
        let mut payload = json!({
            "content": text,
            "allowed_mentions": { "parse": [] },
        });

        let response = if files.is_empty() {
            self.execute(Method::POST, &path, |req| Ok(req.json(&payload)))
                .await?
        } else {
            let mut contents = Vec::with_capacity(files.len());
            for file in files {
                let bytes = tokio::fs::read(&file.path)
                    .await
                    .with_context(|| format!("Failed to read staged file {}", file.path.display()))?;
                contents.push((file, bytes));
            }
            payload["attachments"] = Value::Array(
                contents
                    .iter()
                    .enumerate()
                    .map(|(i, (file, _))| json!({ "id": i, "filename": file.filename }))
                    .collect(),
            );

            self.execute(Method::POST, &path, |req| {
                let mut form = Form::new().text("payload_json", payload.to_string());
                for (i, (file, bytes)) in contents.iter().enumerate() {
                    let part = Part::bytes(bytes.clone())
                        .file_name(file.filename.clone())
                        .mime_str(&file.mime_type)
                        .with_context(|| format!("Invalid MIME type `{}`", file.mime_type))?;
                    form = form.part(format!("files[{}]", i), part);
                }
                Ok(req.multipart(form))
            })
            .await?
        };

        let body = Self::json_body(response, "create message").await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Discord message response missing id")
    }

    /// Start a public thread on an existing message
    pub async fn start_thread(&self, channel_id: &str, message_id: &str, name: &str) -> Result<String> {
        let name: String = name.chars().take(MAX_THREAD_NAME_CHARS).collect();
        let path = format!("/channels/{}/messages/{}/threads", channel_id, message_id);
        let payload = json!({
            "name": name,
            "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
        });
        let response = self
            .execute(Method::POST, &path, |req| Ok(req.json(&payload)))
            .await?;
        let body = Self::json_body(response, "start thread").await?;
        if let Some(info) = ChannelInfo::from_json(&body) {
            self.remember_channel(info.clone());
            return Ok(info.id);
        }
        anyhow::bail!("Discord thread response missing id")
    }

    /// Read a message; `None` on 404
    pub async fn get_message(&self, channel_id: &str, message_id: &str) -> Result<Option<FetchedMessage>> {
        let path = format!("/channels/{}/messages/{}", channel_id, message_id);
        let response = self.execute(Method::GET, &path, Ok).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::json_body(response, "get message").await?;
        Ok(Some(FetchedMessage {
            id: message_id.to_string(),
            text: body
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            thread_id: body
                .get("thread")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }))
    }

    /// Channel info, served from cache after the first lookup
    pub async fn channel(&self, channel_id: &str) -> Result<ChannelInfo> {
        if let Some(info) = self
            .channels
            .lock()
            .ok()
            .and_then(|c| c.get(channel_id).cloned())
        {
            return Ok(info);
        }

        let path = format!("/channels/{}", channel_id);
        let response = self.execute(Method::GET, &path, Ok).await?;
        let body = Self::json_body(response, "get channel").await?;
        let info = ChannelInfo::from_json(&body).context("Discord channel response missing id")?;
        self.remember_channel(info.clone());
        Ok(info)
    }

    /// Prime the channel cache from a gateway CHANNEL/THREAD payload
    pub fn remember_channel(&self, info: ChannelInfo) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(info.id.clone(), info);
        }
    }

    /// Global display name, falling back to the username
    pub async fn user_display_name(&self, user_id: &str) -> Result<String> {
        if let Some(name) = self.users.lock().ok().and_then(|u| u.get(user_id).cloned()) {
            return Ok(name);
        }

        let path = format!("/users/{}", user_id);
        let response = self.execute(Method::GET, &path, Ok).await?;
        let body = Self::json_body(response, "get user").await?;
        let name = user_name(&body).with_context(|| format!("Discord user {} has no name", user_id))?;
        if let Ok(mut users) = self.users.lock() {
            users.insert(user_id.to_string(), name.clone());
        }
        Ok(name)
    }
}

/// `global_name` when set, else `username`
pub fn user_name(user: &Value) -> Option<String> {
    user.get("global_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| user.get("username").and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_info_thread_detection() {
        let thread = ChannelInfo::from_json(&json!({
            "id": "900", "type": 11, "name": "How do we", "parent_id": "100"
        }))
        .unwrap();
        assert!(thread.is_thread());
        assert_eq!(thread.parent_id.as_deref(), Some("100"));

        let text = ChannelInfo::from_json(&json!({"id": "100", "type": 0, "name": "general"})).unwrap();
        assert!(!text.is_thread());
    }

    #[test]
    fn test_channel_info_requires_id() {
        assert!(ChannelInfo::from_json(&json!({"type": 0})).is_none());
    }

    #[test]
    fn test_user_name_prefers_global_name() {
        assert_eq!(
            user_name(&json!({"username": "nelly_k", "global_name": "Nelly"})).as_deref(),
            Some("Nelly")
        );
        assert_eq!(
            user_name(&json!({"username": "nelly_k", "global_name": null})).as_deref(),
            Some("nelly_k")
        );
        assert_eq!(user_name(&json!({})), None);
    }

    #[tokio::test]
    async fn test_cached_channel_served_without_network() {
        // Unroutable base: any network call would fail the test
        let rest = DiscordRest::with_base(reqwest::Client::new(), "token", "http://127.0.0.1:9");
        rest.remember_channel(ChannelInfo {
            id: "100".to_string(),
            name: Some("general".to_string()),
            kind: 0,
            parent_id: None,
        });
        let info = rest.channel("100").await.unwrap();
        assert_eq!(info.name.as_deref(), Some("general"));
    }
}
