// ABOUTME: Slack Events API payload types and normalization into relay events
// ABOUTME: Also the queue that carries accepted webhook events to the bridge

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use slackord_core::{
    AttachmentInfo, ChannelRef, ChatUser, EventSource, EventStream, InboundEvent, Platform,
};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Outer Events API envelope
#[derive(Debug, Clone, Deserialize)]
pub struct SlackEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event: Option<SlackMessagePayload>,
}

/// The `event` object of a message callback. Every field is optional so
/// non-message callbacks still deserialize and get skipped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackMessagePayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub client_msg_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<SlackFilePayload>,
    #[serde(default)]
    pub attachments: Vec<SlackLegacyAttachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackFilePayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackLegacyAttachment {
    #[serde(default)]
    pub text: Option<String>,
}

/// Result of normalizing one envelope
#[derive(Debug, Clone)]
pub enum SlackInbound {
    Event(Box<InboundEvent>),
    Skipped(&'static str),
}

impl SlackEnvelope {
    pub fn is_url_verification(&self) -> bool {
        self.kind == "url_verification"
    }

    /// Posted by a bot other than the bridge.
    ///
    /// The bridge's own posts are let through so the relay can record them
    /// as the last destination-side sender.
    pub fn is_foreign_bot(&self, bridge_user_id: &str) -> bool {
        match &self.event {
            Some(event) => {
                event.bot_id.is_some() && event.user.as_deref() != Some(bridge_user_id)
            }
            None => false,
        }
    }
}

/// Turn a message callback into a relay event
pub fn normalize(envelope: &SlackEnvelope) -> SlackInbound {
    if envelope.kind != "event_callback" {
        return SlackInbound::Skipped("not an event callback");
    }
    let Some(event) = &envelope.event else {
        return SlackInbound::Skipped("no event body");
    };
    if event.kind != "message" {
        return SlackInbound::Skipped("not a message");
    }
    match event.subtype.as_deref() {
        None | Some("file_share") | Some("thread_broadcast") | Some("bot_message") => {}
        Some("file_change") => return SlackInbound::Skipped("file_change"),
        Some(_) => return SlackInbound::Skipped("unsupported subtype"),
    }

    let (Some(channel_id), Some(ts)) = (&event.channel, &event.ts) else {
        return SlackInbound::Skipped("missing channel or ts");
    };
    let Some(author) = event.user.as_ref().or(event.bot_id.as_ref()) else {
        return SlackInbound::Skipped("no author");
    };

    let text = message_text(event);
    let attachments: Vec<AttachmentInfo> = event
        .files
        .iter()
        .filter_map(|f| {
            f.url_private.as_ref().map(|url| AttachmentInfo {
                id: f.id.clone(),
                url: url.clone(),
                filename: f.name.clone(),
                mime_type: f
                    .mimetype
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: f.size,
            })
        })
        .collect();

    if text.is_empty() && attachments.is_empty() {
        return SlackInbound::Skipped("no content");
    }

    let dedup_key = event
        .client_msg_id
        .clone()
        .or_else(|| envelope.event_id.clone())
        .unwrap_or_else(|| ts.clone());

    let channel = match &event.thread_ts {
        Some(root) if root != ts => ChannelRef::Threaded {
            root_message_id: root.clone(),
        },
        _ => ChannelRef::Direct,
    };

    SlackInbound::Event(Box::new(InboundEvent {
        platform: Platform::Slack,
        dedup_key,
        message_id: ts.clone(),
        channel_id: channel_id.clone(),
        channel,
        author: ChatUser::new(author.clone()),
        text,
        attachments,
        mentions: Vec::new(),
        stickers: Vec::new(),
        timestamp: parse_slack_ts(ts),
    }))
}

/// Message text, falling back to the first non-empty legacy attachment text
fn message_text(event: &SlackMessagePayload) -> String {
    match event.text.as_deref() {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => event
            .attachments
            .iter()
            .filter_map(|a| a.text.as_deref())
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_default(),
    }
}

/// Parse a Slack timestamp (e.g., "1700000000.000100") into Unix seconds
pub fn parse_slack_ts(ts: &str) -> i64 {
    ts.split('.')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0)
}

// =============================================================================
// Event queue
// =============================================================================

/// Receiving half of the webhook queue, handed to the bridge as a stream
pub struct SlackEventQueue {
    rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
}

impl SlackEventQueue {
    pub fn channel(capacity: usize) -> (mpsc::Sender<InboundEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

#[async_trait]
impl EventSource for SlackEventQueue {
    async fn event_stream(&self) -> Result<EventStream> {
        let rx = self
            .rx
            .lock()
            .map_err(|e| anyhow::anyhow!("Slack queue mutex poisoned: {}", e))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("Slack event stream already taken"))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> SlackEnvelope {
        serde_json::from_value(value).unwrap()
    }

    fn event_of(inbound: SlackInbound) -> InboundEvent {
        match inbound {
            SlackInbound::Event(event) => *event,
            SlackInbound::Skipped(reason) => panic!("unexpected skip: {}", reason),
        }
    }

    #[test]
    fn test_plain_message() {
        let env = envelope(json!({
            "type": "event_callback",
            "event_id": "Ev1",
            "event": {
                "type": "message",
                "client_msg_id": "abc-123",
                "channel": "C1",
                "user": "U1",
                "text": "Hello",
                "ts": "1700000001.000100"
            }
        }));
        let event = event_of(normalize(&env));
        assert_eq!(event.dedup_key, "abc-123");
        assert_eq!(event.message_id, "1700000001.000100");
        assert_eq!(event.channel, ChannelRef::Direct);
        assert_eq!(event.timestamp, 1_700_000_001);
        assert_eq!(event.author.id, "U1");
    }

    #[test]
    fn test_event_id_used_without_client_msg_id() {
        let env = envelope(json!({
            "type": "event_callback",
            "event_id": "Ev9",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "x", "ts": "1.2"}
        }));
        assert_eq!(event_of(normalize(&env)).dedup_key, "Ev9");
    }

    #[test]
    fn test_thread_reply_and_root() {
        let reply = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "r",
                      "ts": "2.0", "thread_ts": "1.0"}
        }));
        assert_eq!(
            event_of(normalize(&reply)).channel,
            ChannelRef::Threaded {
                root_message_id: "1.0".to_string()
            }
        );

        let root = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "r",
                      "ts": "1.0", "thread_ts": "1.0"}
        }));
        assert_eq!(event_of(normalize(&root)).channel, ChannelRef::Direct);
    }

    #[test]
    fn test_file_share_collects_files() {
        let env = envelope(json!({
            "type": "event_callback",
            "event": {
                "type": "message", "subtype": "file_share", "channel": "C1", "user": "U1",
                "text": "", "ts": "1.0",
                "files": [
                    {"id": "F1", "name": "cat.png", "mimetype": "image/png",
                     "url_private": "https://files.slack.com/F1", "size": 10},
                    {"id": "F2", "name": "hidden.png"}
                ]
            }
        }));
        let event = event_of(normalize(&env));
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(event.attachments[0].id, "F1");
        assert_eq!(event.attachments[0].mime_type, "image/png");
    }

    #[test]
    fn test_file_change_skipped() {
        let env = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "subtype": "file_change", "channel": "C1", "ts": "1.0"}
        }));
        assert!(matches!(normalize(&env), SlackInbound::Skipped("file_change")));
    }

    #[test]
    fn test_attachment_text_fallback() {
        let env = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "",
                      "ts": "1.0", "attachments": [{"text": "  "}, {"text": " shared link "}]}
        }));
        assert_eq!(event_of(normalize(&env)).text, "shared link");
    }

    #[test]
    fn test_empty_message_skipped() {
        let env = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "", "ts": "1.0"}
        }));
        assert!(matches!(normalize(&env), SlackInbound::Skipped("no content")));
    }

    #[test]
    fn test_non_message_event_skipped() {
        let env = envelope(json!({
            "type": "event_callback",
            "event": {"type": "member_joined_channel", "user": "U1", "channel": "C1"}
        }));
        assert!(matches!(normalize(&env), SlackInbound::Skipped("not a message")));
    }

    #[test]
    fn test_foreign_bot_detection() {
        let other = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "bot_id": "B9", "user": "U_OTHER_BOT", "text": "x",
                      "channel": "C1", "ts": "1.0"}
        }));
        assert!(other.is_foreign_bot("U_BRIDGE"));

        let ours = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "bot_id": "B1", "user": "U_BRIDGE", "text": "x",
                      "channel": "C1", "ts": "1.0"}
        }));
        assert!(!ours.is_foreign_bot("U_BRIDGE"));
    }

    #[test]
    fn test_url_verification() {
        let env = envelope(json!({"type": "url_verification", "challenge": "abc"}));
        assert!(env.is_url_verification());
        assert_eq!(env.challenge.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_queue_stream_taken_once() {
        use tokio_stream::StreamExt;

        let (tx, queue) = SlackEventQueue::channel(4);
        let mut stream = queue.event_stream().await.unwrap();
        assert!(queue.event_stream().await.is_err());

        let env = envelope(json!({
            "type": "event_callback",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "q", "ts": "1.0"}
        }));
        tx.send(event_of(normalize(&env))).await.unwrap();
        let received = stream.next().await.unwrap();
        assert_eq!(received.text, "q");
    }
}
