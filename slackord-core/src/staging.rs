// ABOUTME: Per-event local staging of downloaded attachments
// ABOUTME: Each event gets its own directory, removed when the guard drops on every exit path

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// A downloaded attachment ready to be re-uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: String,
}

impl StagedFile {
    pub fn new(path: PathBuf, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            path,
            filename: filename.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Staging directory owned by one in-flight event.
///
/// The directory and everything in it is deleted on drop.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Create a fresh uniquely-named directory under `root`
    pub fn create(root: &Path) -> Result<Self> {
        let dir = root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create staging dir {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "Created staging area");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(dir = %self.dir.display(), "Removed staging area"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                dir = %self.dir.display(),
                error = %e,
                "Failed to remove staging area"
            ),
        }
    }
}

/// Sanitize a filename to only contain safe characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '-' || *c == '_')
        .collect()
}

/// Filename to stage an attachment under.
///
/// Uses the sanitized original name when there is one, otherwise the file id
/// with an extension guessed from the MIME type.
pub fn staged_filename(file_id: &str, original: Option<&str>, mime_type: &str) -> String {
    let cleaned = original.map(sanitize_filename).unwrap_or_default();
    if !cleaned.is_empty() && cleaned.chars().any(|c| c != '.') {
        return cleaned;
    }

    let stem = sanitize_filename(file_id);
    let stem = if stem.is_empty() { "file".to_string() } else { stem };
    match mime_guess::get_mime_extensions_str(mime_type).and_then(|exts| exts.first()) {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    }
}

/// Path an attachment is staged at inside `dir`.
///
/// Each attachment gets a subdirectory named after its file id so that two
/// attachments sharing a display name never overwrite each other. The file
/// itself keeps the display name, which is what the destination shows.
pub fn staged_path(dir: &Path, file_id: &str, original: Option<&str>, mime_type: &str) -> PathBuf {
    let slot = sanitize_filename(file_id);
    let slot = if slot.is_empty() || slot.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        slot
    };
    dir.join(slot)
        .join(staged_filename(file_id, original, mime_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("my file.pdf"), "myfile.pdf");
        assert_eq!(sanitize_filename("../../../etc/passwd"), "......etcpasswd");
        assert_eq!(sanitize_filename("image (1).png"), "image1.png");
    }

    #[test]
    fn test_staged_filename_prefers_original() {
        assert_eq!(
            staged_filename("F1", Some("report 2024.pdf"), "application/pdf"),
            "report2024.pdf"
        );
    }

    #[test]
    fn test_staged_filename_falls_back_to_mime_extension() {
        let name = staged_filename("F0123", None, "image/png");
        assert_eq!(name, "F0123.png");

        // Name made only of dots after sanitizing is useless
        let name = staged_filename("F0123", Some("/../"), "text/plain");
        assert!(name.starts_with("F0123."), "got {}", name);
    }

    #[test]
    fn test_staged_filename_unknown_mime() {
        assert_eq!(
            staged_filename("F9", None, "application/x-made-up"),
            "F9"
        );
    }

    #[test]
    fn test_same_named_attachments_get_distinct_paths() {
        let dir = Path::new("/staging/event");
        let first = staged_path(dir, "F1", Some("image.png"), "image/png");
        let second = staged_path(dir, "F2", Some("image.png"), "image/png");

        assert_ne!(first, second);
        assert_eq!(first, dir.join("F1").join("image.png"));
        // The display name survives for the upload
        assert_eq!(second.file_name().unwrap(), "image.png");
    }

    #[test]
    fn test_staged_path_never_escapes_dir() {
        let dir = Path::new("/staging/event");
        let path = staged_path(dir, "../..", Some("a.txt"), "text/plain");
        assert_eq!(path, dir.join("file").join("a.txt"));
    }

    #[test]
    fn test_staging_area_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let dir;
        {
            let area = StagingArea::create(root.path()).unwrap();
            dir = area.path().to_path_buf();
            std::fs::write(dir.join("a.txt"), b"hello").unwrap();
            assert!(dir.exists());
        }
        assert!(!dir.exists(), "staging dir must be deleted on drop");
    }

    #[test]
    fn test_staging_areas_are_distinct() {
        let root = TempDir::new().unwrap();
        let a = StagingArea::create(root.path()).unwrap();
        let b = StagingArea::create(root.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
