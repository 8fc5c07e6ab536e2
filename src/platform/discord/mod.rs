// ABOUTME: Discord binding for the relay over the REST API and the Gateway WebSocket
// ABOUTME: Implements the slackord-core traits and broadcasts guild newcomers for greetings

pub mod gateway;
pub mod rest;

pub use gateway::Newcomer;
pub use rest::{ChannelInfo, DiscordRest};

use anyhow::{Context, Result};
use async_trait::async_trait;
use slackord_core::{
    config::DiscordConfig, AttachmentInfo, DirectoryLookup, EventSource, EventStream,
    FetchedMessage, InboundSource, OutboundSender, Platform, SendTarget, SentMessage, StagedFile,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;
const NEWCOMER_BUFFER: usize = 32;

pub struct DiscordPlatform {
    rest: Arc<DiscordRest>,
    bot_user_id: String,
    max_message_len: usize,
    newcomers: broadcast::Sender<Newcomer>,
    cancel: CancellationToken,
}

impl DiscordPlatform {
    /// Authenticate the bot token and prepare the binding. The gateway
    /// connects when the event stream is first requested.
    pub async fn connect(
        config: &DiscordConfig,
        http: reqwest::Client,
        max_message_len: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let rest = Arc::new(DiscordRest::new(http, config.bot_token.clone()));
        let bot_user_id = rest
            .current_user_id()
            .await
            .context("Failed to authenticate Discord bot, check bot_token")?;

        if let Some(configured) = &config.bot_user_id {
            if configured != &bot_user_id {
                tracing::warn!(
                    configured = %configured,
                    actual = %bot_user_id,
                    "Configured Discord bot_user_id differs from users/@me, using users/@me"
                );
            }
        }
        tracing::info!(bot_user = %bot_user_id, "Discord bot authenticated");

        Ok(Self::from_parts(rest, bot_user_id, max_message_len, cancel))
    }

    pub fn from_parts(
        rest: Arc<DiscordRest>,
        bot_user_id: String,
        max_message_len: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (newcomers, _) = broadcast::channel(NEWCOMER_BUFFER);
        Self {
            rest,
            bot_user_id,
            max_message_len,
            newcomers,
            cancel,
        }
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    pub fn rest(&self) -> &Arc<DiscordRest> {
        &self.rest
    }

    /// Guild joins seen by the gateway from now on
    pub fn subscribe_newcomers(&self) -> broadcast::Receiver<Newcomer> {
        self.newcomers.subscribe()
    }
}

#[async_trait]
impl EventSource for DiscordPlatform {
    async fn event_stream(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(gateway::run(
            Arc::clone(&self.rest),
            self.bot_user_id.clone(),
            tx,
            self.newcomers.clone(),
            self.cancel.child_token(),
        ));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl InboundSource for DiscordPlatform {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn download(&self, attachment: &AttachmentInfo, dir: &Path) -> Result<PathBuf> {
        // CDN attachment URLs are signed, no auth header
        super::download_attachment(self.rest.http(), attachment, dir, None).await
    }

    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>> {
        Ok(self.rest.channel(channel_id).await?.name)
    }
}

#[async_trait]
impl OutboundSender for DiscordPlatform {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    async fn send(&self, target: &SendTarget, text: &str, files: &[StagedFile]) -> Result<SentMessage> {
        // Threads are channels of their own on Discord
        let channel_id = match target {
            SendTarget::Thread { thread_id, .. } => thread_id.as_str(),
            SendTarget::Channel { channel_id } => channel_id.as_str(),
        };
        let id = self.rest.create_message(channel_id, text, files).await?;
        Ok(SentMessage {
            id,
            channel_id: channel_id.to_string(),
        })
    }

    async fn create_thread(&self, channel_id: &str, parent_message_id: &str, name: &str) -> Result<String> {
        let name = if name.trim().is_empty() { "Discussion" } else { name };
        self.rest.start_thread(channel_id, parent_message_id, name).await
    }

    async fn fetch_message(&self, channel_id: &str, message_id: &str) -> Result<Option<FetchedMessage>> {
        self.rest.get_message(channel_id, message_id).await
    }
}

#[async_trait]
impl DirectoryLookup for DiscordPlatform {
    async fn resolve_user_display_name(&self, user_id: &str) -> Result<String> {
        self.rest.user_display_name(user_id).await
    }
}
