// ABOUTME: Slack binding for the relay: Web API sends, directory lookups and attachment downloads
// ABOUTME: Inbound events arrive through the Events API webhook and the queue in `events`

pub mod events;
pub mod files;

pub use events::{SlackEnvelope, SlackEventQueue, SlackInbound};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use slack_morphism::prelude::*;
use slackord_core::{
    config::SlackConfig, AttachmentInfo, DirectoryLookup, FetchedMessage, InboundSource,
    OutboundSender, Platform, RetryPolicy, SendTarget, SentMessage, StagedFile,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Name and avatar of a Slack user, as used for greeting waves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackProfile {
    pub real_name: String,
    pub avatar_url: Option<String>,
}

/// Slack platform binding using slack-morphism for typed Web API calls and
/// reqwest for file transfer.
pub struct SlackPlatform {
    /// Shared Slack client for API calls
    client: Arc<SlackHyperClient>,
    /// Bot OAuth token (xoxb-...) for Web API calls
    bot_token: SlackApiToken,
    /// Same token for raw HTTP calls (downloads, uploads)
    raw_token: String,
    http: reqwest::Client,
    /// Bot's Slack user ID (resolved via auth.test at startup)
    bot_user_id: String,
    max_message_len: usize,
    share_poll: RetryPolicy,
    cancel: CancellationToken,
    /// user id -> display name
    names: Mutex<HashMap<String, String>>,
}

impl SlackPlatform {
    /// Create a new SlackPlatform from config.
    ///
    /// Resolves the bot's user ID via the `auth.test` API call.
    pub async fn connect(
        config: &SlackConfig,
        http: reqwest::Client,
        max_message_len: usize,
        share_poll: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("Failed to create Slack HTTP connector")?,
        ));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.bot_token.clone()));

        let session = client.open_session(&bot_token);
        let auth_response = session
            .auth_test()
            .await
            .context("Failed to call Slack auth.test, check bot_token")?;
        let bot_user_id = auth_response.user_id.to_string();

        if let Some(configured) = &config.bot_user_id {
            if configured != &bot_user_id {
                tracing::warn!(
                    configured = %configured,
                    actual = %bot_user_id,
                    "Configured Slack bot_user_id differs from auth.test, using auth.test"
                );
            }
        }
        tracing::info!(
            bot_user = %bot_user_id,
            team = %auth_response.team,
            "Slack bot authenticated"
        );

        Ok(Self {
            client,
            bot_token,
            raw_token: config.bot_token.clone(),
            http,
            bot_user_id,
            max_message_len,
            share_poll,
            cancel,
            names: Mutex::new(HashMap::new()),
        })
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    /// Real name and 192px avatar for a user
    pub async fn user_profile(&self, user_id: &str) -> Result<SlackProfile> {
        let body = files::call(
            &self.raw_token,
            "users.info",
            self.http
                .get(format!("{}/users.info", files::SLACK_API_BASE))
                .query(&[("user", user_id)]),
        )
        .await?;
        Ok(profile_from_user(body.get("user").unwrap_or(&Value::Null)))
    }

    /// Post a message carrying Block Kit blocks, returning its ts
    pub async fn post_blocks(&self, channel_id: &str, text: &str, blocks: Value) -> Result<String> {
        let blocks: Vec<SlackBlock> =
            serde_json::from_value(blocks).context("Invalid Block Kit payload")?;
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiChatPostMessageRequest::new(
            channel_id.into(),
            SlackMessageContent::new()
                .with_text(text.to_string())
                .with_blocks(blocks),
        );
        let resp = session
            .chat_post_message(&req)
            .await
            .context("Failed to post Slack block message")?;
        Ok(resp.ts.to_string())
    }

    /// Message only `user_id` can see in `channel_id`
    pub async fn post_ephemeral(&self, channel_id: &str, user_id: &str, text: &str) -> Result<()> {
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiChatPostEphemeralRequest::new(
            channel_id.into(),
            user_id.into(),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        session
            .chat_post_ephemeral(&req)
            .await
            .context("Failed to post Slack ephemeral message")?;
        Ok(())
    }

    async fn post_text(&self, channel_id: &str, thread_ts: Option<&str>, text: &str) -> Result<String> {
        let session = self.client.open_session(&self.bot_token);
        let mut req = SlackApiChatPostMessageRequest::new(
            channel_id.into(),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        if let Some(ts) = thread_ts {
            req = req.with_thread_ts(ts.into());
        }
        let resp = session
            .chat_post_message(&req)
            .await
            .context("Failed to send Slack message")?;
        Ok(resp.ts.to_string())
    }

    fn cached_name(&self, user_id: &str) -> Option<String> {
        self.names.lock().ok()?.get(user_id).cloned()
    }

    fn cache_name(&self, user_id: &str, name: &str) {
        if let Ok(mut names) = self.names.lock() {
            names.insert(user_id.to_string(), name.to_string());
        }
    }
}

/// Pick name and avatar out of a users.info `user` object
fn profile_from_user(user: &Value) -> SlackProfile {
    let real_name = user
        .get("real_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            user.get("profile")
                .and_then(|p| p.get("real_name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or("Anonymous")
        .to_string();
    let avatar_url = user
        .get("profile")
        .and_then(|p| p.get("image_192"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    SlackProfile {
        real_name,
        avatar_url,
    }
}

#[async_trait]
impl InboundSource for SlackPlatform {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn download(&self, attachment: &AttachmentInfo, dir: &Path) -> Result<PathBuf> {
        super::download_attachment(&self.http, attachment, dir, Some(&self.raw_token)).await
    }

    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>> {
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiConversationsInfoRequest::new(channel_id.into());
        let resp = session
            .conversations_info(&req)
            .await
            .context("Failed to call Slack conversations.info")?;
        Ok(resp.channel.name)
    }
}

#[async_trait]
impl OutboundSender for SlackPlatform {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    async fn send(&self, target: &SendTarget, text: &str, files: &[StagedFile]) -> Result<SentMessage> {
        let channel_id = target.channel_id();
        let thread_ts = match target {
            SendTarget::Thread { thread_id, .. } => Some(thread_id.as_str()),
            SendTarget::Channel { .. } => None,
        };

        if files.is_empty() {
            if text.trim().is_empty() {
                anyhow::bail!("Refusing to post an empty Slack message");
            }
            let ts = self.post_text(channel_id, thread_ts, text).await?;
            return Ok(SentMessage {
                id: ts,
                channel_id: channel_id.to_string(),
            });
        }

        let file_ids =
            files::upload_files(&self.http, &self.raw_token, channel_id, thread_ts, text, files)
                .await?;
        let first = file_ids
            .first()
            .context("Slack upload returned no file ids")?;
        // The share message ts shows up in files.info once Slack finishes processing
        let ts = files::wait_for_share_ts(
            &self.http,
            &self.raw_token,
            first,
            channel_id,
            self.share_poll,
            &self.cancel,
        )
        .await?;
        Ok(SentMessage {
            id: ts,
            channel_id: channel_id.to_string(),
        })
    }

    async fn create_thread(&self, _channel_id: &str, parent_message_id: &str, _name: &str) -> Result<String> {
        // Any Slack message anchors a thread on its own ts
        Ok(parent_message_id.to_string())
    }

    async fn fetch_message(&self, channel_id: &str, message_id: &str) -> Result<Option<FetchedMessage>> {
        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiConversationsHistoryRequest::new()
            .with_channel(channel_id.into())
            .with_latest(message_id.into())
            .with_inclusive(true)
            .with_limit(1);
        let resp = session
            .conversations_history(&req)
            .await
            .context("Failed to call Slack conversations.history")?;

        Ok(resp
            .messages
            .into_iter()
            .find(|m| m.origin.ts.to_string() == message_id)
            .map(|m| FetchedMessage {
                id: message_id.to_string(),
                text: m.content.text.unwrap_or_default(),
                thread_id: Some(
                    m.origin
                        .thread_ts
                        .map(|ts| ts.to_string())
                        .unwrap_or_else(|| message_id.to_string()),
                ),
            }))
    }
}

#[async_trait]
impl DirectoryLookup for SlackPlatform {
    async fn resolve_user_display_name(&self, user_id: &str) -> Result<String> {
        if let Some(name) = self.cached_name(user_id) {
            return Ok(name);
        }

        let session = self.client.open_session(&self.bot_token);
        let req = SlackApiUsersInfoRequest::new(user_id.into());
        let resp = session
            .users_info(&req)
            .await
            .with_context(|| format!("Failed to look up Slack user {}", user_id))?;

        let user = resp.user;
        let name = user
            .real_name
            .filter(|n| !n.is_empty())
            .or_else(|| {
                user.profile
                    .and_then(|p| p.display_name)
                    .filter(|n| !n.is_empty())
            })
            .or(user.name)
            .with_context(|| format!("Slack user {} has no name", user_id))?;

        self.cache_name(user_id, &name);
        Ok(name)
    }
}
