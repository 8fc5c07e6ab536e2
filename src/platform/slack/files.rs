// ABOUTME: Slack external file upload and files.info share polling
// ABOUTME: Learns the ts of the message a file upload produced, which Slack reports asynchronously

use anyhow::{Context, Result};
use serde_json::{json, Value};
use slackord_core::{
    retry::{poll, PollResult, RetryPolicy},
    StagedFile,
};
use tokio_util::sync::CancellationToken;

pub(crate) const SLACK_API_BASE: &str = "https://slack.com/api";

/// Call a Web API method and return the body when Slack reports `ok: true`
pub(crate) async fn call(
    token: &str,
    method: &str,
    request: reqwest::RequestBuilder,
) -> Result<Value> {
    let body: Value = request
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("Slack {} request failed", method))?
        .json()
        .await
        .with_context(|| format!("Slack {} returned invalid JSON", method))?;

    if body.get("ok").and_then(Value::as_bool) != Some(true) {
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        anyhow::bail!("Slack {} failed: {}", method, error);
    }
    Ok(body)
}

/// Upload `files` and share them into `channel_id` (optionally in a thread)
/// with `text` as the initial comment. Returns the uploaded file ids.
pub async fn upload_files(
    http: &reqwest::Client,
    token: &str,
    channel_id: &str,
    thread_ts: Option<&str>,
    text: &str,
    files: &[StagedFile],
) -> Result<Vec<String>> {
    let mut uploaded = Vec::with_capacity(files.len());
    for file in files {
        let bytes = tokio::fs::read(&file.path)
            .await
            .with_context(|| format!("Failed to read staged file {}", file.path.display()))?;

        let length = bytes.len().to_string();
        let ticket = call(
            token,
            "files.getUploadURLExternal",
            http.post(format!("{}/files.getUploadURLExternal", SLACK_API_BASE))
                .form(&[("filename", file.filename.as_str()), ("length", length.as_str())]),
        )
        .await?;
        let upload_url = ticket
            .get("upload_url")
            .and_then(Value::as_str)
            .context("files.getUploadURLExternal response missing upload_url")?;
        let file_id = ticket
            .get("file_id")
            .and_then(Value::as_str)
            .context("files.getUploadURLExternal response missing file_id")?
            .to_string();

        let status = http
            .post(upload_url)
            .header(reqwest::header::CONTENT_TYPE, file.mime_type.as_str())
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", file.filename))?
            .status();
        if !status.is_success() {
            anyhow::bail!("Upload of {} returned {}", file.filename, status);
        }

        tracing::debug!(file_id = %file_id, filename = %file.filename, "File uploaded to Slack");
        uploaded.push((file_id, file.filename.clone()));
    }

    let mut payload = json!({
        "files": uploaded
            .iter()
            .map(|(id, title)| json!({ "id": id, "title": title }))
            .collect::<Vec<_>>(),
        "channel_id": channel_id,
        "initial_comment": text,
    });
    if let Some(ts) = thread_ts {
        payload["thread_ts"] = json!(ts);
    }
    call(
        token,
        "files.completeUploadExternal",
        http.post(format!("{}/files.completeUploadExternal", SLACK_API_BASE))
            .json(&payload),
    )
    .await?;

    Ok(uploaded.into_iter().map(|(id, _)| id).collect())
}

/// Timestamp of the message a file was shared in.
///
/// Prefers the share in `channel_id`; otherwise takes the first private
/// share, then the first public one.
pub fn share_ts(file: &Value, channel_id: &str) -> Option<String> {
    let shares = file.get("shares")?;
    let first_ts = |entries: &Value| {
        entries
            .as_array()
            .and_then(|list| list.first())
            .and_then(|share| share.get("ts"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    for visibility in ["private", "public"] {
        if let Some(entries) = shares.get(visibility).and_then(|v| v.get(channel_id)) {
            if let Some(ts) = first_ts(entries) {
                return Some(ts);
            }
        }
    }
    for visibility in ["private", "public"] {
        if let Some(channels) = shares.get(visibility).and_then(Value::as_object) {
            if let Some(ts) = channels.values().find_map(first_ts) {
                return Some(ts);
            }
        }
    }
    None
}

/// Poll files.info until the share shows up and yields a message ts
pub async fn wait_for_share_ts(
    http: &reqwest::Client,
    token: &str,
    file_id: &str,
    channel_id: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String> {
    let result = poll(policy, Some(cancel), || async move {
        let body = call(
            token,
            "files.info",
            http.get(format!("{}/files.info", SLACK_API_BASE))
                .query(&[("file", file_id)]),
        )
        .await?;
        Ok(body.get("file").and_then(|f| share_ts(f, channel_id)))
    })
    .await;

    match result {
        PollResult::Found { value, attempts } => {
            tracing::debug!(file_id = %file_id, ts = %value, attempts, "File share resolved");
            Ok(value)
        }
        PollResult::Exhausted { attempts } => {
            anyhow::bail!("File {} was not shared after {} checks", file_id, attempts)
        }
        PollResult::Cancelled { attempts } => {
            anyhow::bail!("Waiting for file {} share cancelled after {} checks", file_id, attempts)
        }
    }
}
