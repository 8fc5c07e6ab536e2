// ABOUTME: Platform bindings for Slack and Discord behind the slackord-core traits
// ABOUTME: Shared HTTP helpers for attachment downloads live here

pub mod discord;
pub mod slack;

pub use discord::DiscordPlatform;
pub use slack::SlackPlatform;

use anyhow::{Context, Result};
use slackord_core::{staging::staged_path, AttachmentInfo};
use std::path::{Path, PathBuf};

/// Fetch `attachment` into `dir`, sending `bearer` as the Authorization token when given
pub(crate) async fn download_attachment(
    http: &reqwest::Client,
    attachment: &AttachmentInfo,
    dir: &Path,
    bearer: Option<&str>,
) -> Result<PathBuf> {
    let mut request = http.get(&attachment.url);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to download attachment {}", attachment.id))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Attachment {} download returned {}", attachment.id, status);
    }
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("Failed to read attachment {} body", attachment.id))?;

    let path = staged_path(
        dir,
        &attachment.id,
        attachment.filename.as_deref(),
        &attachment.mime_type,
    );
    if let Some(slot) = path.parent() {
        tokio::fs::create_dir_all(slot)
            .await
            .with_context(|| format!("Failed to create {}", slot.display()))?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::debug!(
        file_id = %attachment.id,
        path = %path.display(),
        size = bytes.len(),
        "Attachment downloaded"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tempfile::TempDir;

    async fn serve_files() -> String {
        let app = Router::new()
            .route("/first", get(|| async { "FIRST-IMAGE" }))
            .route("/second", get(|| async { "SECOND-IMAGE" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn pasted_image(id: &str, url: String) -> AttachmentInfo {
        AttachmentInfo {
            id: id.to_string(),
            url,
            filename: Some("image.png".to_string()),
            mime_type: "image/png".to_string(),
            size: None,
        }
    }

    #[tokio::test]
    async fn test_same_named_attachments_both_survive() {
        let base = serve_files().await;
        let dir = TempDir::new().unwrap();
        let http = local_client();

        let first = download_attachment(
            &http,
            &pasted_image("att1", format!("{}/first", base)),
            dir.path(),
            None,
        )
        .await
        .unwrap();
        let second = download_attachment(
            &http,
            &pasted_image("att2", format!("{}/second", base)),
            dir.path(),
            None,
        )
        .await
        .unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "FIRST-IMAGE");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "SECOND-IMAGE");
        assert_eq!(first.file_name().unwrap(), "image.png");
        assert_eq!(second.file_name().unwrap(), "image.png");
    }

    #[tokio::test]
    async fn test_failed_download_reports_status() {
        let base = serve_files().await;
        let dir = TempDir::new().unwrap();
        let err = download_attachment(
            &local_client(),
            &pasted_image("att3", format!("{}/missing", base)),
            dir.path(),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("404"), "got {}", err);
    }
}
