// ABOUTME: Core traits and data types shared by the relay engine and the platform bindings
// ABOUTME: Normalized inbound events, outbound send primitives, directory lookup, channel refs

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::staging::StagedFile;

// =============================================================================
// Platforms
// =============================================================================

/// The two chat platforms the bridge connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Slack,
    Discord,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Discord => "discord",
        }
    }

    /// The platform on the other side of the bridge
    pub fn other(&self) -> Self {
        match self {
            Self::Slack => Self::Discord,
            Self::Discord => Self::Slack,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slack" => Ok(Self::Slack),
            "discord" => Ok(Self::Discord),
            _ => anyhow::bail!("Unknown platform: {}", s),
        }
    }
}

// =============================================================================
// Inbound events
// =============================================================================

/// Identity of a chat user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatUser {
    /// Platform user ID (e.g., U12345678, 80351110224678912)
    pub id: String,
    /// Display name, when the event already carried one
    pub display_name: Option<String>,
}

impl ChatUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: Some(name.into()),
        }
    }
}

/// Attachment descriptor carried by an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    /// Platform file identifier, used for file-level dedup
    pub id: String,
    /// Download URL (Slack url_private, Discord CDN url)
    pub url: String,
    /// Original filename, if the platform reported one
    pub filename: Option<String>,
    /// MIME type
    pub mime_type: String,
    /// File size in bytes, if known
    pub size: Option<u64>,
}

/// A user mention token found in the message text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub user_id: String,
    /// Display name supplied by the platform payload (Discord includes it)
    pub display_name: Option<String>,
}

/// Where in its channel an inbound message lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    /// Top-level channel message
    Direct,
    /// Reply inside a thread anchored on `root_message_id`
    Threaded { root_message_id: String },
}

impl ChannelRef {
    pub fn root_message_id(&self) -> Option<&str> {
        match self {
            Self::Direct => None,
            Self::Threaded { root_message_id } => Some(root_message_id),
        }
    }
}

/// Normalized inbound event from either platform
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Platform the event came from
    pub platform: Platform,
    /// Stable identifier used to detect redelivery (not the raw payload)
    pub dedup_key: String,
    /// Platform message ID (Slack ts, Discord snowflake)
    pub message_id: String,
    /// Routing channel: the Slack channel, or the Discord text channel
    /// (the parent channel when the message was posted inside a thread)
    pub channel_id: String,
    /// Direct vs threaded placement
    pub channel: ChannelRef,
    /// Message author
    pub author: ChatUser,
    /// Raw message text in the source platform's markup
    pub text: String,
    /// Attachments to mirror
    pub attachments: Vec<AttachmentInfo>,
    /// Mention tokens present in `text`
    pub mentions: Vec<Mention>,
    /// Sticker names; rendered as placeholders, never fetched
    pub stickers: Vec<String>,
    /// Seconds since Unix epoch
    pub timestamp: i64,
}

impl InboundEvent {
    /// Short text preview for log lines
    pub fn preview(&self) -> String {
        self.text.chars().take(50).collect()
    }
}

/// Boxed stream type for platform events
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

// =============================================================================
// Outbound
// =============================================================================

/// Destination of an outbound send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Top level of a channel
    Channel { channel_id: String },
    /// Inside an existing thread (Slack thread_ts, Discord thread channel)
    Thread {
        channel_id: String,
        thread_id: String,
    },
}

impl SendTarget {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Channel { channel_id } | Self::Thread { channel_id, .. } => channel_id,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, Self::Thread { .. })
    }
}

/// Receipt for a message the destination accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub channel_id: String,
}

/// A message read back from a platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: String,
    pub text: String,
    /// Thread already hanging off this message, if any
    pub thread_id: Option<String>,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Something that delivers normalized inbound events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Receive inbound events as a stream
    async fn event_stream(&self) -> Result<EventStream>;
}

/// Source-side capabilities the orchestrator needs while relaying
#[async_trait]
pub trait InboundSource: Send + Sync {
    fn platform(&self) -> Platform;

    /// Download an attachment into `dir`, returning the written path
    async fn download(&self, attachment: &AttachmentInfo, dir: &Path) -> Result<PathBuf>;

    /// Human-readable channel name, used for logging and annotation only
    async fn channel_name(&self, channel_id: &str) -> Result<Option<String>>;
}

/// Send primitives of the destination platform
#[async_trait]
pub trait OutboundSender: Send + Sync {
    fn platform(&self) -> Platform;

    /// Maximum characters per message on this platform
    fn max_message_len(&self) -> usize;

    /// Send one message, optionally carrying staged files
    async fn send(&self, target: &SendTarget, text: &str, files: &[StagedFile])
        -> Result<SentMessage>;

    /// Start a thread on `parent_message_id`, returning the thread identifier
    async fn create_thread(
        &self,
        channel_id: &str,
        parent_message_id: &str,
        name: &str,
    ) -> Result<String>;

    /// Read a message back; `None` when it no longer exists
    async fn fetch_message(&self, channel_id: &str, message_id: &str)
        -> Result<Option<FetchedMessage>>;
}

/// Best-effort user directory
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn resolve_user_display_name(&self, user_id: &str) -> Result<String>;
}

// =============================================================================
// Tests
// =============================================================================
