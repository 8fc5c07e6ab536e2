// ABOUTME: Durable mapping between a message and its mirrored counterpart on the other platform
// ABOUTME: SQLite-backed store (first-writer-wins) plus an in-memory store for tests and dry runs

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::traits::Platform;

/// A message on one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub platform: Platform,
    pub id: String,
}

impl MessageKey {
    pub fn new(platform: Platform, id: impl Into<String>) -> Self {
        Self {
            platform,
            id: id.into(),
        }
    }

    pub fn slack(id: impl Into<String>) -> Self {
        Self::new(Platform::Slack, id)
    }

    pub fn discord(id: impl Into<String>) -> Self {
        Self::new(Platform::Discord, id)
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

/// A source message and its mirror. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdentity {
    pub source: MessageKey,
    pub destination: MessageKey,
}

impl MessageIdentity {
    pub fn new(source: MessageKey, destination: MessageKey) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// Persistent identity mapping.
///
/// At most one destination is ever recorded per source; later writes for the
/// same source are ignored.
pub trait IdentityStore: Send + Sync {
    /// Record an identity. Returns true if written, false if the source
    /// already had a mirror.
    fn put(&self, identity: &MessageIdentity) -> Result<bool>;

    fn get_by_source(&self, source: &MessageKey) -> Result<Option<MessageKey>>;

    fn get_by_destination(&self, destination: &MessageKey) -> Result<Option<MessageKey>>;

    /// The message on the other platform linked to `key`, whichever side
    /// originated it
    fn counterpart(&self, key: &MessageKey) -> Result<Option<MessageKey>> {
        if let Some(found) = self.get_by_source(key)? {
            return Ok(Some(found));
        }
        self.get_by_destination(key)
    }
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteIdentityStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteIdentityStore {
    /// Open (or create) `identities.db` inside `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;

        let db_path = data_dir.join("identities.db");
        let conn = Connection::open(&db_path).context("Failed to open SQLite database")?;
        let store = Self::from_connection(conn)?;

        tracing::info!(db = %db_path.display(), "Identity store initialized");
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS message_identities (
                source_platform TEXT NOT NULL,
                source_id TEXT NOT NULL,
                destination_platform TEXT NOT NULL,
                destination_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (source_platform, source_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_identities_destination
             ON message_identities (destination_platform, destination_id)",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Total number of recorded identities
    pub fn count(&self) -> Result<usize> {
        let db = self.lock()?;
        let count: i64 =
            db.query_row("SELECT COUNT(*) FROM message_identities", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }
}

fn parse_platform(raw: String) -> rusqlite::Result<Platform> {
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

impl IdentityStore for SqliteIdentityStore {
    fn put(&self, identity: &MessageIdentity) -> Result<bool> {
        let db = self.lock()?;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO message_identities
             (source_platform, source_id, destination_platform, destination_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.source.platform.as_str(),
                identity.source.id,
                identity.destination.platform.as_str(),
                identity.destination.id,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(
                source = %identity.source,
                destination = %identity.destination,
                "Identity already recorded for source, keeping first mirror"
            );
        } else {
            tracing::info!(
                source = %identity.source,
                destination = %identity.destination,
                "Identity saved"
            );
        }
        Ok(inserted > 0)
    }

    fn get_by_source(&self, source: &MessageKey) -> Result<Option<MessageKey>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT destination_platform, destination_id FROM message_identities
             WHERE source_platform = ?1 AND source_id = ?2",
        )?;
        let found = stmt
            .query_row(params![source.platform.as_str(), source.id], |row| {
                Ok(MessageKey {
                    platform: parse_platform(row.get(0)?)?,
                    id: row.get(1)?,
                })
            })
            .optional()?;
        Ok(found)
    }

    fn get_by_destination(&self, destination: &MessageKey) -> Result<Option<MessageKey>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT source_platform, source_id FROM message_identities
             WHERE destination_platform = ?1 AND destination_id = ?2
             ORDER BY rowid LIMIT 1",
        )?;
        let found = stmt
            .query_row(
                params![destination.platform.as_str(), destination.id],
                |row| {
                    Ok(MessageKey {
                        platform: parse_platform(row.get(0)?)?,
                        id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryTables {
    by_source: HashMap<MessageKey, MessageKey>,
    by_destination: HashMap<MessageKey, MessageKey>,
}

/// Identity store kept in process memory
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().map(|t| t.by_source.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn put(&self, identity: &MessageIdentity) -> Result<bool> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Identity table mutex poisoned: {}", e))?;
        if tables.by_source.contains_key(&identity.source) {
            return Ok(false);
        }
        tables
            .by_source
            .insert(identity.source.clone(), identity.destination.clone());
        tables
            .by_destination
            .entry(identity.destination.clone())
            .or_insert_with(|| identity.source.clone());
        Ok(true)
    }

    fn get_by_source(&self, source: &MessageKey) -> Result<Option<MessageKey>> {
        let tables = self
            .tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Identity table mutex poisoned: {}", e))?;
        Ok(tables.by_source.get(source).cloned())
    }

    fn get_by_destination(&self, destination: &MessageKey) -> Result<Option<MessageKey>> {
        let tables = self
            .tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Identity table mutex poisoned: {}", e))?;
        Ok(tables.by_destination.get(destination).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair(slack: &str, discord: &str) -> MessageIdentity {
        MessageIdentity::new(MessageKey::slack(slack), MessageKey::discord(discord))
    }

    #[test]
    fn test_sqlite_put_and_lookup_both_ways() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        assert!(store.put(&pair("1700000000.000100", "1111")).unwrap());

        assert_eq!(
            store
                .get_by_source(&MessageKey::slack("1700000000.000100"))
                .unwrap(),
            Some(MessageKey::discord("1111"))
        );
        assert_eq!(
            store.get_by_destination(&MessageKey::discord("1111")).unwrap(),
            Some(MessageKey::slack("1700000000.000100"))
        );
    }

    #[test]
    fn test_sqlite_first_writer_wins() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        assert!(store.put(&pair("ts1", "1111")).unwrap());
        assert!(!store.put(&pair("ts1", "2222")).unwrap());

        assert_eq!(
            store.get_by_source(&MessageKey::slack("ts1")).unwrap(),
            Some(MessageKey::discord("1111"))
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_missing_is_none() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        assert!(store
            .get_by_source(&MessageKey::slack("nope"))
            .unwrap()
            .is_none());
        assert!(store
            .get_by_destination(&MessageKey::discord("nope"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_platform_namespacing() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store.put(&pair("42", "1111")).unwrap();
        // Same raw id on the other platform is a different message
        assert!(store
            .get_by_source(&MessageKey::discord("42"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_counterpart_finds_either_direction() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        // Slack-originated message mirrored to Discord
        store.put(&pair("ts1", "1111")).unwrap();
        // Discord-originated message mirrored to Slack
        store
            .put(&MessageIdentity::new(
                MessageKey::discord("2222"),
                MessageKey::slack("ts2"),
            ))
            .unwrap();

        assert_eq!(
            store.counterpart(&MessageKey::slack("ts1")).unwrap(),
            Some(MessageKey::discord("1111"))
        );
        assert_eq!(
            store.counterpart(&MessageKey::discord("1111")).unwrap(),
            Some(MessageKey::slack("ts1"))
        );
        assert_eq!(
            store.counterpart(&MessageKey::slack("ts2")).unwrap(),
            Some(MessageKey::discord("2222"))
        );
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteIdentityStore::new(dir.path()).unwrap();
            store.put(&pair("ts1", "1111")).unwrap();
        }
        let reopened = SqliteIdentityStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened.get_by_source(&MessageKey::slack("ts1")).unwrap(),
            Some(MessageKey::discord("1111"))
        );
    }

    #[test]
    fn test_memory_store_matches_sqlite_semantics() {
        let store = MemoryIdentityStore::new();
        assert!(store.is_empty());
        assert!(store.put(&pair("ts1", "1111")).unwrap());
        assert!(!store.put(&pair("ts1", "2222")).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.counterpart(&MessageKey::discord("1111")).unwrap(),
            Some(MessageKey::slack("ts1"))
        );
    }
}
