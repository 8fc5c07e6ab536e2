// ABOUTME: Discord Gateway v10 WebSocket session producing normalized relay events
// ABOUTME: Handles HELLO/IDENTIFY/heartbeat, MESSAGE_CREATE and GUILD_MEMBER_ADD, reconnecting on loss

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use slackord_core::{
    AttachmentInfo, ChannelRef, ChatUser, InboundEvent, Mention, Platform,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;

use super::rest::{user_name, ChannelInfo, DiscordRest};

/// GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | MESSAGE_CONTENT
pub const GATEWAY_INTENTS: u64 = 1 | (1 << 1) | (1 << 9) | (1 << 15);

const FALLBACK_GATEWAY_URL: &str = "wss://gateway.discord.gg";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_MS: u64 = 41_250;

/// Message types that carry user content (DEFAULT, REPLY)
const RELAYED_MESSAGE_TYPES: [u64; 2] = [0, 19];

/// Someone joined the guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Newcomer {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// A MESSAGE_CREATE the relay cares about, before thread resolution
#[derive(Debug, Clone, PartialEq)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    pub author: ChatUser,
    pub text: String,
    pub attachments: Vec<AttachmentInfo>,
    pub mentions: Vec<Mention>,
    pub stickers: Vec<String>,
    pub timestamp: i64,
}

/// Keep the gateway connected until `cancel` fires or the event receiver goes away
pub async fn run(
    rest: Arc<DiscordRest>,
    bot_user_id: String,
    events: mpsc::Sender<InboundEvent>,
    newcomers: broadcast::Sender<Newcomer>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Discord gateway shutting down");
                return;
            }
            result = session(&rest, &bot_user_id, &events, &newcomers) => match result {
                Ok(()) => tracing::info!("Discord gateway disconnected, reconnecting"),
                Err(e) => tracing::error!(error = %e, "Discord gateway error, reconnecting"),
            }
        }

        if events.is_closed() {
            tracing::info!("Discord event receiver dropped, stopping gateway");
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn session(
    rest: &DiscordRest,
    bot_user_id: &str,
    events: &mpsc::Sender<InboundEvent>,
    newcomers: &broadcast::Sender<Newcomer>,
) -> Result<()> {
    let base = match rest.gateway_url().await {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to get gateway URL, using default");
            FALLBACK_GATEWAY_URL.to_string()
        }
    };
    let url = format!("{}/?v=10&encoding=json", base.trim_end_matches('/'));

    let (mut ws, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to Discord Gateway")?;
    tracing::info!(url = %url, "Connected to Discord Gateway");

    // HELLO carries the heartbeat interval
    let heartbeat_ms = loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let payload: GatewayPayload =
                    serde_json::from_str(text.as_str()).context("Failed to parse Hello")?;
                if payload.op == 10 {
                    break payload
                        .d
                        .as_ref()
                        .and_then(|d| d.get("heartbeat_interval"))
                        .and_then(Value::as_u64)
                        .unwrap_or(DEFAULT_HEARTBEAT_MS);
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("WebSocket error before Hello"),
            None => anyhow::bail!("Gateway closed before Hello"),
        }
    };

    let identify = json!({
        "op": 2,
        "d": {
            "token": rest.token(),
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "slackord",
                "device": "slackord"
            }
        }
    });
    ws.send(WsMessage::Text(identify.to_string().into()))
        .await
        .context("Failed to send Identify")?;

    let period = Duration::from_millis(heartbeat_ms);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut sequence: Option<u64> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let hb = json!({ "op": 1, "d": sequence });
                ws.send(WsMessage::Text(hb.to_string().into())).await?;
                tracing::trace!("Sent heartbeat");
            }
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws.send(WsMessage::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(?frame, "Gateway closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("Gateway WebSocket error"),
                    None => return Ok(()),
                };

                let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to parse gateway payload");
                        continue;
                    }
                };
                if let Some(s) = payload.s {
                    sequence = Some(s);
                }

                match payload.op {
                    0 => {
                        let keep_going = dispatch(
                            rest,
                            bot_user_id,
                            payload.t.as_deref().unwrap_or_default(),
                            payload.d.as_ref().unwrap_or(&Value::Null),
                            events,
                            newcomers,
                        )
                        .await;
                        if !keep_going {
                            return Ok(());
                        }
                    }
                    1 => {
                        let hb = json!({ "op": 1, "d": sequence });
                        ws.send(WsMessage::Text(hb.to_string().into())).await?;
                    }
                    7 => {
                        tracing::info!("Discord requested reconnect");
                        return Ok(());
                    }
                    9 => {
                        tracing::warn!("Invalid gateway session, reconnecting");
                        return Ok(());
                    }
                    11 => tracing::trace!("Heartbeat ACK"),
                    op => tracing::debug!(op, "Unhandled gateway opcode"),
                }
            }
        }
    }
}

/// Handle one dispatch; `false` once the event receiver is gone
async fn dispatch(
    rest: &DiscordRest,
    bot_user_id: &str,
    kind: &str,
    data: &Value,
    events: &mpsc::Sender<InboundEvent>,
    newcomers: &broadcast::Sender<Newcomer>,
) -> bool {
    match kind {
        "READY" => {
            let user = data.get("user").and_then(user_name).unwrap_or_default();
            tracing::info!(user = %user, "Discord gateway ready");
        }
        "CHANNEL_CREATE" | "CHANNEL_UPDATE" | "THREAD_CREATE" | "THREAD_UPDATE" => {
            if let Some(info) = ChannelInfo::from_json(data) {
                rest.remember_channel(info);
            }
        }
        "GUILD_MEMBER_ADD" => {
            if let Some(newcomer) = parse_newcomer(data) {
                tracing::info!(
                    user = %newcomer.user_id,
                    name = %newcomer.display_name,
                    "New Discord member"
                );
                // No subscribers just means greetings are off
                let _ = newcomers.send(newcomer);
            }
        }
        "MESSAGE_CREATE" => {
            let Some(message) = parse_message(data, bot_user_id) else {
                return true;
            };
            let channel = match rest.channel(&message.channel_id).await {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(
                        channel = %message.channel_id,
                        error = %e,
                        "Channel lookup failed, treating as top-level"
                    );
                    None
                }
            };
            let event = into_event(message, channel.as_ref());
            if events.send(event).await.is_err() {
                return false;
            }
        }
        _ => {}
    }
    true
}

/// Guild nickname, then global name, then username
fn member_display_name(member: Option<&Value>, user: &Value) -> Option<String> {
    member
        .and_then(|m| m.get("nick"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| user_name(user))
}

/// Extract a relayable message from a MESSAGE_CREATE payload.
///
/// Skips system messages, webhook posts, and other bots. The bridge's own
/// messages pass through so the relay can record them.
pub fn parse_message(data: &Value, bot_user_id: &str) -> Option<DiscordMessage> {
    let kind = data.get("type").and_then(Value::as_u64).unwrap_or(0);
    if !RELAYED_MESSAGE_TYPES.contains(&kind) {
        return None;
    }
    if data.get("webhook_id").is_some_and(|w| !w.is_null()) {
        return None;
    }

    let author = data.get("author")?;
    let author_id = author.get("id")?.as_str()?;
    let is_bot = author.get("bot").and_then(Value::as_bool).unwrap_or(false);
    if is_bot && author_id != bot_user_id {
        return None;
    }

    let id = data.get("id")?.as_str()?.to_string();
    let channel_id = data.get("channel_id")?.as_str()?.to_string();
    let text = data
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let attachments: Vec<AttachmentInfo> = data
        .get("attachments")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    Some(AttachmentInfo {
                        id: a.get("id")?.as_str()?.to_string(),
                        url: a.get("url")?.as_str()?.to_string(),
                        filename: a.get("filename").and_then(Value::as_str).map(str::to_string),
                        mime_type: a
                            .get("content_type")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        size: a.get("size").and_then(Value::as_u64),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mentions = data
        .get("mentions")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|m| {
                    Some(Mention {
                        user_id: m.get("id")?.as_str()?.to_string(),
                        display_name: member_display_name(m.get("member"), m),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let stickers: Vec<String> = data
        .get("sticker_items")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() && attachments.is_empty() && stickers.is_empty() {
        return None;
    }

    let author = match member_display_name(data.get("member"), author) {
        Some(name) => ChatUser::with_name(author_id, name),
        None => ChatUser::new(author_id),
    };
    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);

    Some(DiscordMessage {
        id,
        channel_id,
        author,
        text,
        attachments,
        mentions,
        stickers,
        timestamp,
    })
}

/// Place a message in its routing channel. Thread messages route by the
/// thread's parent channel and point at the thread's starter message, which
/// shares the thread's id.
pub fn into_event(message: DiscordMessage, channel: Option<&ChannelInfo>) -> InboundEvent {
    let (channel_id, channel_ref) = match channel {
        Some(info) if info.is_thread() => match &info.parent_id {
            Some(parent) => (
                parent.clone(),
                ChannelRef::Threaded {
                    root_message_id: info.id.clone(),
                },
            ),
            None => (message.channel_id.clone(), ChannelRef::Direct),
        },
        _ => (message.channel_id.clone(), ChannelRef::Direct),
    };

    InboundEvent {
        platform: Platform::Discord,
        dedup_key: message.id.clone(),
        message_id: message.id,
        channel_id,
        channel: channel_ref,
        author: message.author,
        text: message.text,
        attachments: message.attachments,
        mentions: message.mentions,
        stickers: message.stickers,
        timestamp: message.timestamp,
    }
}

/// Human newcomer from a GUILD_MEMBER_ADD payload
pub fn parse_newcomer(data: &Value) -> Option<Newcomer> {
    let user = data.get("user")?;
    if user.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let user_id = user.get("id")?.as_str()?.to_string();
    let display_name = member_display_name(Some(data), user).unwrap_or_else(|| user_id.clone());
    Some(Newcomer {
        user_id,
        display_name,
    })
}
