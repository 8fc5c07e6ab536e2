// ABOUTME: Newcomer greetings: Discord joins become Slack prompts with a wave button
// ABOUTME: A click posts the wave to a Discord webhook under the Slack user's name and avatar

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::platform::discord::Newcomer;
use crate::platform::slack::{SlackPlatform, SlackProfile};

pub const GREET_ACTION_ID: &str = "greet_button";

/// A Slack user clicked the wave button for a Discord newcomer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetAction {
    pub slack_user_id: String,
    pub slack_channel_id: String,
    pub discord_user_id: String,
    pub discord_name: String,
}

impl GreetAction {
    /// Read a `block_actions` interaction payload. Anything but a wave click is `None`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if payload.get("type").and_then(Value::as_str) != Some("block_actions") {
            return None;
        }
        let action = payload.get("actions")?.as_array()?.first()?;
        if action.get("action_id").and_then(Value::as_str) != Some(GREET_ACTION_ID) {
            return None;
        }
        // Display names may contain commas, ids never do
        let (name, id) = action.get("value")?.as_str()?.rsplit_once(',')?;
        let slack_channel_id = payload
            .get("channel")
            .and_then(|c| c.get("id"))
            .or_else(|| payload.get("container").and_then(|c| c.get("channel_id")))
            .and_then(Value::as_str)?;

        Some(Self {
            slack_user_id: payload.get("user")?.get("id")?.as_str()?.to_string(),
            slack_channel_id: slack_channel_id.to_string(),
            discord_user_id: id.trim().to_string(),
            discord_name: name.trim().to_string(),
        })
    }
}

/// Block Kit prompt announcing a newcomer, with the wave button
pub fn prompt_blocks(newcomer: &Newcomer) -> Value {
    json!([
        {
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*{}* just joined the Discord server!", newcomer.display_name)
            }
        },
        {
            "type": "actions",
            "elements": [{
                "type": "button",
                "action_id": GREET_ACTION_ID,
                "text": {"type": "plain_text", "text": "Wave :wave:", "emoji": true},
                "value": format!("{},{}", newcomer.display_name, newcomer.user_id)
            }]
        }
    ])
}

/// Webhook body that pings the newcomer with a wave, posted as the Slack user
pub fn wave_payload(discord_user_id: &str, profile: &SlackProfile) -> Value {
    json!({
        "content": format!("<@{}>\n:wave:", discord_user_id),
        "username": profile.real_name,
        "avatar_url": profile.avatar_url.clone().unwrap_or_default(),
    })
}

pub async fn announce_newcomer(slack: &SlackPlatform, channel_id: &str, newcomer: &Newcomer) -> Result<String> {
    let fallback = format!("{} just joined the Discord server!", newcomer.display_name);
    let ts = slack
        .post_blocks(channel_id, &fallback, prompt_blocks(newcomer))
        .await?;
    tracing::info!(
        discord_user = %newcomer.user_id,
        name = %newcomer.display_name,
        channel = %channel_id,
        "Newcomer announced in Slack"
    );
    Ok(ts)
}

/// Deliver a wave to Discord and confirm it to the clicking user
pub async fn wave(slack: &SlackPlatform, http: &reqwest::Client, webhook_url: &str, action: &GreetAction) -> Result<()> {
    let profile = slack
        .user_profile(&action.slack_user_id)
        .await
        .context("Failed to look up waving Slack user")?;

    let response = http
        .post(webhook_url)
        .json(&wave_payload(&action.discord_user_id, &profile))
        .send()
        .await
        .context("Failed to call Discord newcomer webhook")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Discord newcomer webhook returned {}: {}", status, body);
    }
    tracing::info!(
        slack_user = %profile.real_name,
        discord_user = %action.discord_name,
        "Wave delivered"
    );

    slack
        .post_ephemeral(
            &action.slack_channel_id,
            &action.slack_user_id,
            &format!("You waved to *_{}_*!", action.discord_name),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(value: &str) -> Value {
        json!({
            "type": "block_actions",
            "user": {"id": "U_ANN", "name": "ann"},
            "channel": {"id": "C_WELCOME", "name": "welcome"},
            "actions": [{"action_id": "greet_button", "value": value, "type": "button"}]
        })
    }

    #[test]
    fn test_from_payload_reads_wave_click() {
        let action = GreetAction::from_payload(&click("Nelly,42")).unwrap();
        assert_eq!(
            action,
            GreetAction {
                slack_user_id: "U_ANN".to_string(),
                slack_channel_id: "C_WELCOME".to_string(),
                discord_user_id: "42".to_string(),
                discord_name: "Nelly".to_string(),
            }
        );
    }

    #[test]
    fn test_from_payload_name_with_comma() {
        let action = GreetAction::from_payload(&click("Nelly, the Great,42")).unwrap();
        assert_eq!(action.discord_name, "Nelly, the Great");
        assert_eq!(action.discord_user_id, "42");
    }

    #[test]
    fn test_from_payload_ignores_other_actions() {
        let mut other = click("Nelly,42");
        other["actions"][0]["action_id"] = json!("something_else");
        assert!(GreetAction::from_payload(&other).is_none());

        let mut modal = click("Nelly,42");
        modal["type"] = json!("view_submission");
        assert!(GreetAction::from_payload(&modal).is_none());

        assert!(GreetAction::from_payload(&click("no-separator")).is_none());
    }

    #[test]
    fn test_from_payload_container_channel() {
        let mut payload = click("Nelly,42");
        payload.as_object_mut().unwrap().remove("channel");
        payload["container"] = json!({"type": "message", "channel_id": "C_OTHER"});
        let action = GreetAction::from_payload(&payload).unwrap();
        assert_eq!(action.slack_channel_id, "C_OTHER");
    }

    #[test]
    fn test_prompt_blocks_button_value() {
        let blocks = prompt_blocks(&Newcomer {
            user_id: "42".to_string(),
            display_name: "Nelly".to_string(),
        });
        let button = &blocks[1]["elements"][0];
        assert_eq!(button["action_id"], GREET_ACTION_ID);
        assert_eq!(button["value"], "Nelly,42");
    }

    #[test]
    fn test_wave_payload() {
        let payload = wave_payload(
            "42",
            &SlackProfile {
                real_name: "Ann Example".to_string(),
                avatar_url: None,
            },
        );
        assert_eq!(payload["content"], "<@42>\n:wave:");
        assert_eq!(payload["username"], "Ann Example");
        assert_eq!(payload["avatar_url"], "");
    }
}
